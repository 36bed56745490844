//! Tool framework for model tool calling
//!
//! Tools are invoked by name from the model's tool calls. Results are
//! normalised once, at the protocol boundary, into [`ToolOutput`].

pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolchat_core::ToolDefinition;

pub use registry::ToolMap;

use crate::mcp::client::CallToolResult;

/// Normalised tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolOutput {
    PlainText(String),
    /// Structured resource, e.g. an embedded UI widget
    Resource {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl ToolOutput {
    /// Text handed back to the model
    pub fn to_model_content(&self) -> String {
        match self {
            ToolOutput::PlainText(text) => text.clone(),
            ToolOutput::Resource { uri, mime_type, text } => serde_json::json!({
                "type": "resource",
                "uri": uri,
                "mimeType": mime_type,
                "text": text,
            })
            .to_string(),
        }
    }
}

impl From<CallToolResult> for ToolOutput {
    fn from(result: CallToolResult) -> Self {
        if let Some(resource) = result.content.iter().find_map(|c| c.resource.as_ref()) {
            return ToolOutput::Resource {
                uri: resource.uri.clone(),
                mime_type: resource.mime_type.clone(),
                text: resource.text.clone(),
            };
        }

        let text = result
            .content
            .iter()
            .filter_map(|c| match c.content_type.as_str() {
                "text" => c.text.clone(),
                other => Some(format!(
                    "[{} content{}]",
                    other,
                    c.mime_type
                        .as_deref()
                        .map(|m| format!(": {m}"))
                        .unwrap_or_default()
                )),
            })
            .collect::<Vec<_>>()
            .join("\n");
        ToolOutput::PlainText(text)
    }
}

/// Result of tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,
    pub output: ToolOutput,
}

impl ToolResult {
    pub fn success(output: ToolOutput) -> Self {
        Self {
            success: true,
            output,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: ToolOutput::PlainText(error.into()),
        }
    }
}

impl From<CallToolResult> for ToolResult {
    fn from(result: CallToolResult) -> Self {
        let success = !result.is_error;
        Self {
            success,
            output: result.into(),
        }
    }
}

/// The Tool trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments
    fn input_schema(&self) -> Value;

    async fn execute(&self, args: &Value) -> Result<ToolResult>;

    /// Convert to a tool definition for the model
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.input_schema())
    }
}
