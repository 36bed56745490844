//! Bounded liveness handshake against a tool server

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::client::{McpClient, McpToolInfo};
use super::registry::ToolDescriptor;

/// Result of one probe, in the shape the UI renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn ready(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            ready: true,
            tools: Some(tools),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ready: false,
            tools: None,
            error: Some(error.into()),
        }
    }

    /// Discovered tools, empty when not ready
    pub fn into_tools(self) -> Vec<ToolDescriptor> {
        self.tools.unwrap_or_default()
    }
}

impl From<McpToolInfo> for ToolDescriptor {
    fn from(info: McpToolInfo) -> Self {
        Self {
            name: info.name,
            description: info.description,
            input_schema: (!info.input_schema.is_null()).then_some(info.input_schema),
        }
    }
}

/// Single handshake attempt; never retries and never fails past this boundary
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str, headers: &[(String, String)]) -> ProbeReport;
}

/// Probe that performs a real MCP handshake and lists tools
#[derive(Debug, Clone)]
pub struct McpHealthProbe {
    timeout: Duration,
}

impl McpHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for McpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HealthProbe for McpHealthProbe {
    async fn probe(&self, endpoint: &str, headers: &[(String, String)]) -> ProbeReport {
        let (client, dialect) = match McpClient::connect_remote(endpoint, headers, self.timeout).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(endpoint, error = %format!("{e:#}"), "Probe handshake failed");
                return ProbeReport::failed(format!("Handshake failed: {e:#}"));
            }
        };

        let listed = timeout(self.timeout, client.list_tools()).await;
        client.close().await;

        match listed {
            Ok(Ok(tools)) if tools.is_empty() => ProbeReport::failed("Server reported no tools"),
            Ok(Ok(tools)) => {
                debug!(endpoint, %dialect, tools = tools.len(), "Probe succeeded");
                ProbeReport::ready(tools.into_iter().map(ToolDescriptor::from).collect())
            }
            Ok(Err(e)) => ProbeReport::failed(format!("Failed to list tools: {e:#}")),
            Err(_) => ProbeReport::failed(format!(
                "Timed out listing tools after {}s",
                self.timeout.as_secs_f32()
            )),
        }
    }
}
