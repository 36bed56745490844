//! Per-turn mapping from tool name to implementation

use std::collections::BTreeMap;
use std::sync::Arc;

use toolchat_core::ToolDefinition;

use super::Tool;

/// Tool namespace for one turn; inserting an existing name replaces it
#[derive(Default, Clone)]
pub struct ToolMap {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, returning the one it displaced
    pub fn insert(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        self.tools.insert(tool.name().to_string(), tool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Get tool definitions for the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolMap")
            .field("tools", &self.names())
            .finish()
    }
}
