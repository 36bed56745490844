//! MCP client implementation
//!
//! Implements the Model Context Protocol client used by the health probe and
//! the per-turn tool aggregator.

use super::transport::{
    header_map, JsonRpcRequest, McpTransport, SseTransport, StreamableHttpTransport,
};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

/// MCP protocol version
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client info for initialization
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "toolchat".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server info returned during initialization
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Initialize result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

/// MCP Tool definition from server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Tool list result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Resource embedded in a tool result
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Tool call result content
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub resource: Option<EmbeddedResource>,
}

/// Tool call result
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolResultContent>,
    #[serde(default)]
    pub is_error: bool,
}

/// Wire dialect a remote server answered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    StreamableHttp,
    Sse,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::StreamableHttp => write!(f, "streamable-http"),
            Dialect::Sse => write!(f, "sse"),
        }
    }
}

/// MCP Client
pub struct McpClient {
    transport: Box<dyn McpTransport>,
    request_id: AtomicU64,
    request_timeout: Duration,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl McpClient {
    /// Create a new MCP client with the given transport
    pub fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport,
            request_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Connect to a remote endpoint, preferring the streamable dialect
    ///
    /// Any handshake failure on the streamable dialect falls back to SSE.
    /// `handshake_timeout` bounds each dialect attempt separately.
    pub async fn connect_remote(
        endpoint: &str,
        headers: &[(String, String)],
        handshake_timeout: Duration,
    ) -> Result<(Self, Dialect)> {
        let url = Url::parse(endpoint).with_context(|| format!("Invalid endpoint URL: {endpoint}"))?;
        let headers = header_map(headers)?;
        let http = reqwest::Client::builder()
            .connect_timeout(handshake_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let streamable = StreamableHttpTransport::new(http.clone(), url.clone(), headers.clone());
        let client = Self::new(Box::new(streamable)).with_request_timeout(handshake_timeout);
        let handshake = client.handshake(handshake_timeout).await;
        let streamable_error = match handshake {
            Ok(_) => return Ok((client.with_request_timeout(DEFAULT_REQUEST_TIMEOUT), Dialect::StreamableHttp)),
            Err(e) => {
                client.close().await;
                e
            }
        };
        debug!(endpoint, error = %format!("{streamable_error:#}"), "Streamable HTTP handshake failed, trying SSE");

        let transport = timeout(handshake_timeout, SseTransport::connect(http, url, headers))
            .await
            .map_err(|_| anyhow!("Timed out opening event stream"))?
            .map_err(|e| {
                anyhow!(e).context(format!(
                    "Both MCP dialects failed (streamable HTTP: {streamable_error:#})"
                ))
            })?;
        let client = Self::new(Box::new(transport)).with_request_timeout(handshake_timeout);
        let handshake = client.handshake(handshake_timeout).await;
        if let Err(e) = handshake {
            client.close().await;
            return Err(e);
        }
        Ok((client.with_request_timeout(DEFAULT_REQUEST_TIMEOUT), Dialect::Sse))
    }

    /// `initialize` plus the initialized notification, bounded as a whole
    async fn handshake(&self, limit: Duration) -> Result<InitializeResult> {
        timeout(limit, self.initialize())
            .await
            .map_err(|_| anyhow!("MCP handshake timed out after {}s", limit.as_secs_f32()))?
    }

    /// Get the next request ID
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and get the result
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("MCP client is closed");
        }

        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let response = timeout(self.request_timeout, self.transport.send_request(request))
            .await
            .map_err(|_| anyhow!("MCP request '{method}' timed out"))??;

        if let Some(error) = response.error {
            bail!("MCP error: {}", error);
        }

        let result = response.result.context("MCP response missing result")?;
        let typed_result: T =
            serde_json::from_value(result).context("Failed to parse MCP result")?;

        Ok(typed_result)
    }

    /// Initialize the connection with the MCP server
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": ClientInfo::default()
        });

        let result: InitializeResult = self
            .request("initialize", Some(params))
            .await
            .context("Failed to initialize MCP connection")?;

        self.transport
            .send_notification("notifications/initialized", None)
            .await
            .context("Failed to send initialized notification")?;

        debug!(
            server = %result.server_info.name,
            version = result.server_info.version.as_deref().unwrap_or("unknown"),
            protocol = %result.protocol_version,
            "MCP server initialized"
        );
        self.initialized.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// List available tools, following pagination cursors
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        if !self.is_initialized() {
            bail!("MCP client not initialized");
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));

            let result: ListToolsResult = self
                .request("tools/list", params)
                .await
                .context("Failed to list MCP tools")?;

            tools.extend(result.tools);

            match result.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        if !self.is_initialized() {
            bail!("MCP client not initialized");
        }

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        self.request("tools/call", Some(params))
            .await
            .with_context(|| format!("Failed to call MCP tool: {}", name))
    }

    /// Ping the server
    pub async fn ping(&self) -> Result<()> {
        let _: Value = self.request("ping", None).await?;
        Ok(())
    }

    /// Close the connection; errors are logged and later calls are no-ops
    ///
    /// Returns true when this call performed the close.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Error closing MCP transport");
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::{JsonRpcResponse, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Transport that replays canned results and records methods
    #[derive(Default)]
    struct ScriptedTransport {
        results: Mutex<VecDeque<Value>>,
        methods: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicU64>,
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.methods.lock().push(request.method.clone());
            let result = self.results.lock().pop_front().ok_or(TransportError::Closed)?;
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: Some(request.id),
                result: Some(result),
                error: None,
            })
        }

        async fn send_notification(&self, method: &str, _params: Option<Value>) -> Result<(), TransportError> {
            self.methods.lock().push(method.to_string());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn init_result() -> Value {
        serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "1.0"}
        })
    }

    #[test]
    fn test_client_info_default() {
        let info = ClientInfo::default();
        assert_eq!(info.name, "toolchat");
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let transport = ScriptedTransport::default();
        let methods = Arc::clone(&transport.methods);
        transport.results.lock().extend([
            init_result(),
            serde_json::json!({"tools": [{"name": "a"}], "nextCursor": "page2"}),
            serde_json::json!({"tools": [{"name": "b", "inputSchema": {"type": "object"}}]}),
        ]);

        let client = McpClient::new(Box::new(transport));
        client.initialize().await.unwrap();
        let tools = client.list_tools().await.unwrap();

        assert_eq!(
            tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(
            *methods.lock(),
            vec!["initialize", "notifications/initialized", "tools/list", "tools/list"]
        );
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let client = McpClient::new(Box::new(ScriptedTransport::default()));
        assert!(client.list_tools().await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = ScriptedTransport::default();
        let closes = Arc::clone(&transport.closes);
        let client = McpClient::new(Box::new(transport));

        assert!(client.close().await);
        assert!(!client.close().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(client.ping().await.is_err());
    }

    #[test]
    fn test_call_result_parses_embedded_resource() {
        let result: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [{
                "type": "resource",
                "resource": {"uri": "ui://widget/1", "mimeType": "text/html", "text": "<b>hi</b>"}
            }]
        }))
        .unwrap();
        let resource = result.content[0].resource.as_ref().unwrap();
        assert_eq!(resource.uri, "ui://widget/1");
        assert!(!result.is_error);
    }
}
