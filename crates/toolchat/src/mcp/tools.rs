//! MCP tool adapter
//!
//! Wraps a tool discovered on a server session as a [`Tool`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::aggregator::ToolServerSession;
use super::client::McpToolInfo;
use crate::tools::{Tool, ToolResult};

pub struct McpTool {
    /// Server the tool came from, for logging
    server_name: String,
    tool_info: McpToolInfo,
    session: Arc<dyn ToolServerSession>,
}

impl McpTool {
    pub fn new(
        server_name: impl Into<String>,
        tool_info: McpToolInfo,
        session: Arc<dyn ToolServerSession>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            tool_info,
            session,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.tool_info.name
    }

    fn description(&self) -> &str {
        self.tool_info.description.as_deref().unwrap_or("MCP tool")
    }

    fn input_schema(&self) -> Value {
        if self.tool_info.input_schema.is_object() {
            self.tool_info.input_schema.clone()
        } else {
            serde_json::json!({"type": "object", "properties": {}})
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        tracing::debug!(server = %self.server_name, tool = %self.tool_info.name, "Calling MCP tool");
        let result = self.session.call_tool(&self.tool_info.name, args.clone()).await?;
        Ok(result.into())
    }
}

impl std::fmt::Debug for McpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTool")
            .field("server", &self.server_name)
            .field("name", &self.tool_info.name)
            .finish()
    }
}
