//! Per-turn tool aggregation
//!
//! Opens one session per connected active server, concurrently, and merges
//! their catalogs into a single [`ToolMap`]. A server that fails to open or
//! list is logged and skipped. On a name collision the server later in the
//! input order wins.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{CallToolResult, McpClient, McpToolInfo};
use super::registry::{ServerStatus, ToolServerDescriptor};
use super::tools::McpTool;
use crate::tools::ToolMap;

/// An open protocol session with one server
#[async_trait]
pub trait ToolServerSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;
    /// Close the session; later calls are no-ops
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against server endpoints
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn ToolServerSession>>;
}

#[async_trait]
impl ToolServerSession for McpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        McpClient::call_tool(self, name, arguments).await
    }

    async fn close(&self) -> Result<()> {
        McpClient::close(self).await;
        Ok(())
    }
}

/// Connector speaking MCP with dialect fallback
#[derive(Debug, Clone)]
pub struct McpConnector {
    handshake_timeout: Duration,
}

impl McpConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

#[async_trait]
impl SessionConnector for McpConnector {
    async fn connect(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn ToolServerSession>> {
        let (client, dialect) =
            McpClient::connect_remote(endpoint, headers, self.handshake_timeout).await?;
        debug!(endpoint, %dialect, "Opened tool session");
        Ok(Arc::new(client))
    }
}

/// Closes every session of one build, at most once
#[derive(Clone)]
pub struct CleanupHandle {
    inner: Arc<CleanupInner>,
}

struct CleanupInner {
    sessions: Vec<Arc<dyn ToolServerSession>>,
    done: AtomicBool,
}

impl CleanupHandle {
    fn new(sessions: Vec<Arc<dyn ToolServerSession>>) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                sessions,
                done: AtomicBool::new(false),
            }),
        }
    }

    /// Handle with nothing to close
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Close all sessions; returns true for the call that did the work
    pub async fn cleanup(&self) -> bool {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }

        let closes = self.inner.sessions.iter().map(|session| async move {
            if let Err(e) = session.close().await {
                warn!(error = %format!("{e:#}"), "Error closing tool session");
            }
        });
        join_all(closes).await;
        debug!(sessions = self.inner.sessions.len(), "Tool sessions closed");
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl std::fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("sessions", &self.inner.sessions.len())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Output of [`ToolAggregator::build`]
#[derive(Debug)]
pub struct AggregatedTools {
    pub tools: ToolMap,
    pub cleanup: CleanupHandle,
}

pub struct ToolAggregator {
    connector: Arc<dyn SessionConnector>,
}

impl ToolAggregator {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self { connector }
    }

    /// Merge the catalogs of the connected descriptors, in input order
    pub async fn build(&self, descriptors: &[ToolServerDescriptor]) -> AggregatedTools {
        let targets: Vec<_> = descriptors
            .iter()
            .filter(|d| d.status == ServerStatus::Connected)
            .filter_map(|d| d.endpoint().map(|endpoint| (d, endpoint.to_string())))
            .collect();
        let skipped = descriptors.len() - targets.len();
        if skipped > 0 {
            debug!(skipped, "Skipping servers that are not connected");
        }

        let opened = join_all(targets.iter().map(|(descriptor, endpoint)| {
            self.open(descriptor, endpoint)
        }))
        .await;

        let mut tools = ToolMap::new();
        let mut sessions = Vec::new();
        for (name, session, catalog) in opened.into_iter().flatten() {
            for info in catalog {
                let tool = McpTool::new(name.clone(), info, Arc::clone(&session));
                if let Some(previous) = tools.insert(Arc::new(tool)) {
                    debug!(tool = previous.name(), server = %name, "Tool name collision, later server wins");
                }
            }
            sessions.push(session);
        }

        info!(servers = sessions.len(), tools = tools.len(), "Aggregated tools");
        AggregatedTools {
            tools,
            cleanup: CleanupHandle::new(sessions),
        }
    }

    async fn open(
        &self,
        descriptor: &ToolServerDescriptor,
        endpoint: &str,
    ) -> Option<(String, Arc<dyn ToolServerSession>, Vec<McpToolInfo>)> {
        let session = match self
            .connector
            .connect(endpoint, &descriptor.request_headers())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(server = %descriptor.id, error = %format!("{e:#}"), "Failed to open tool session");
                return None;
            }
        };

        match session.list_tools().await {
            Ok(catalog) => Some((descriptor.name.clone(), session, catalog)),
            Err(e) => {
                warn!(server = %descriptor.id, error = %format!("{e:#}"), "Failed to list tools");
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Error closing failed session");
                }
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::bail;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Session returning a fixed catalog and echoing its label on calls
    pub struct FakeSession {
        pub label: String,
        pub tools: Vec<String>,
        pub fail_list: bool,
        pub closes: AtomicUsize,
    }

    impl FakeSession {
        pub fn new(label: &str, tools: &[&str]) -> Self {
            Self {
                label: label.to_string(),
                tools: tools.iter().map(|t| t.to_string()).collect(),
                fail_list: false,
                closes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolServerSession for FakeSession {
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
            if self.fail_list {
                bail!("list failed");
            }
            Ok(self
                .tools
                .iter()
                .map(|name| McpToolInfo {
                    name: name.clone(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<CallToolResult> {
            Ok(serde_json::from_value(serde_json::json!({
                "content": [{"type": "text", "text": format!("{}:{}", self.label, name)}]
            }))?)
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Connector handing out pre-built sessions by endpoint
    #[derive(Default)]
    pub struct FakeConnector {
        pub sessions: HashMap<String, Arc<FakeSession>>,
    }

    impl FakeConnector {
        pub fn with(mut self, endpoint: &str, session: FakeSession) -> Self {
            self.sessions.insert(endpoint.to_string(), Arc::new(session));
            self
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            endpoint: &str,
            _headers: &[(String, String)],
        ) -> Result<Arc<dyn ToolServerSession>> {
            match self.sessions.get(endpoint) {
                Some(session) => Ok(session.clone()),
                None => bail!("connection refused: {endpoint}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, FakeSession};
    use super::*;
    use crate::mcp::registry::ToolDescriptor;
    use crate::tools::ToolOutput;

    fn connected(id: &str, url: &str) -> ToolServerDescriptor {
        let mut descriptor = ToolServerDescriptor::remote(id, url).with_id(id);
        descriptor.status = ServerStatus::Connected;
        descriptor.tool_catalog = vec![ToolDescriptor::named("x")];
        descriptor
    }

    async fn call(tools: &ToolMap, name: &str) -> ToolOutput {
        tools
            .get(name)
            .unwrap()
            .execute(&Value::Null)
            .await
            .unwrap()
            .output
    }

    #[tokio::test]
    async fn test_failed_server_is_excluded() {
        let connector = FakeConnector::default()
            .with("https://a/mcp", FakeSession::new("a", &["alpha"]))
            .with("https://c/mcp", FakeSession::new("c", &["gamma"]));
        let aggregator = ToolAggregator::new(Arc::new(connector));

        let built = aggregator
            .build(&[
                connected("a", "https://a/mcp"),
                connected("b", "https://b/mcp"),
                connected("c", "https://c/mcp"),
            ])
            .await;

        assert_eq!(built.tools.names(), vec!["alpha", "gamma"]);
        assert_eq!(built.cleanup.session_count(), 2);
    }

    #[tokio::test]
    async fn test_list_failure_closes_session() {
        let mut broken = FakeSession::new("b", &["beta"]);
        broken.fail_list = true;
        let connector = FakeConnector::default()
            .with("https://a/mcp", FakeSession::new("a", &["alpha"]))
            .with("https://b/mcp", broken);
        let broken = connector.sessions["https://b/mcp"].clone();
        let aggregator = ToolAggregator::new(Arc::new(connector));

        let built = aggregator
            .build(&[connected("a", "https://a/mcp"), connected("b", "https://b/mcp")])
            .await;

        assert_eq!(built.tools.names(), vec!["alpha"]);
        assert_eq!(broken.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_collision_resolves_to_later_server() {
        let connector = FakeConnector::default()
            .with("https://a/mcp", FakeSession::new("a", &["format"]))
            .with("https://b/mcp", FakeSession::new("b", &["format"]));
        let aggregator = ToolAggregator::new(Arc::new(connector));

        let forward = aggregator
            .build(&[connected("a", "https://a/mcp"), connected("b", "https://b/mcp")])
            .await;
        assert_eq!(
            call(&forward.tools, "format").await,
            ToolOutput::PlainText("b:format".into())
        );

        let reverse = aggregator
            .build(&[connected("b", "https://b/mcp"), connected("a", "https://a/mcp")])
            .await;
        assert_eq!(
            call(&reverse.tools, "format").await,
            ToolOutput::PlainText("a:format".into())
        );
    }

    #[tokio::test]
    async fn test_disconnected_servers_are_skipped() {
        let connector = FakeConnector::default()
            .with("https://a/mcp", FakeSession::new("a", &["alpha"]));
        let aggregator = ToolAggregator::new(Arc::new(connector));

        let mut idle = connected("a", "https://a/mcp");
        idle.status = ServerStatus::Error;
        let built = aggregator.build(&[idle]).await;

        assert!(built.tools.is_empty());
        assert_eq!(built.cleanup.session_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_closes_each_session_once() {
        let connector = FakeConnector::default()
            .with("https://a/mcp", FakeSession::new("a", &["alpha"]))
            .with("https://b/mcp", FakeSession::new("b", &["beta"]));
        let sessions: Vec<_> = connector.sessions.values().cloned().collect();
        let aggregator = ToolAggregator::new(Arc::new(connector));

        let built = aggregator
            .build(&[connected("a", "https://a/mcp"), connected("b", "https://b/mcp")])
            .await;

        let other = built.cleanup.clone();
        let (first, second) = tokio::join!(built.cleanup.cleanup(), other.cleanup());
        assert!(first ^ second);
        assert!(!built.cleanup.cleanup().await);
        for session in sessions {
            assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        }
    }
}
