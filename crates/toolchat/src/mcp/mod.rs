//! MCP (Model Context Protocol) tool server support
//!
//! Tool servers are either remote endpoints or local commands that run inside
//! an ephemeral sandbox behind a stdio-to-SSE gateway.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 ServerLifecycleManager                  │
//! │  - start / stop / restart, one operation per server     │
//! │  - retries readiness, writes status to the registry     │
//! └──────┬──────────────────┬───────────────────┬───────────┘
//!        │                  │                   │
//!        ▼                  ▼                   ▼
//! ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐
//! │ HealthProbe  │  │ Sandbox-      │  │ ServerRegistry   │
//! │ (McpClient)  │  │ Provisioner   │  │ (KeyValueStore)  │
//! └──────────────┘  └───────────────┘  └────────┬─────────┘
//!                                               │ active + connected
//!                                               ▼
//!                                      ┌──────────────────┐
//!                                      │ ToolAggregator   │
//!                                      │ one session per  │
//!                                      │ server per turn  │
//!                                      └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use toolchat::mcp::{McpConnector, ServerLifecycleManager, ToolAggregator};
//!
//! let manager = Arc::new(ServerLifecycleManager::new(registry, probe, provisioner));
//! manager.start(&id).await;
//!
//! let aggregator = ToolAggregator::new(Arc::new(McpConnector::new(timeout)));
//! let built = aggregator.build(&manager.registry().active_descriptors()).await;
//! // ... run a turn with built.tools ...
//! built.cleanup.cleanup().await;
//!
//! manager.shutdown().await;
//! ```

pub mod aggregator;
pub mod client;
pub mod lifecycle;
pub mod probe;
pub mod registry;
pub mod sandbox;
pub mod tools;
pub mod transport;

pub use aggregator::{
    AggregatedTools, CleanupHandle, McpConnector, SessionConnector, ToolAggregator,
    ToolServerSession,
};
pub use client::{CallToolResult, Dialect, McpClient, McpToolInfo};
pub use lifecycle::ServerLifecycleManager;
pub use probe::{HealthProbe, McpHealthProbe, ProbeReport};
pub use registry::{
    DescriptorPatch, KeyValue, RegistryError, ServerId, ServerRegistry, ServerStatus,
    ToolDescriptor, ToolServerDescriptor, Transport,
};
pub use sandbox::{HttpSandboxApi, SandboxApi, SandboxHandle, SandboxProvisioner};
pub use tools::McpTool;
pub use transport::TransportError;
