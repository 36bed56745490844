//! toolchat: chat turns over an aggregated set of MCP tool servers

pub mod agent;
pub mod commands;
pub mod mcp;
pub mod store;
pub mod tools;
