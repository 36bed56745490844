//! toolchat-core: Shared library for toolchat
//!
//! Provides:
//! - Configuration loading (toolchat.toml)
//! - Chat message model
//! - Language model streaming (OpenAI-compatible)
//! - Retry policy and sleeper abstraction
//! - Server-sent event decoding

pub mod config;
pub mod message;
pub mod provider;
pub mod retry;
pub mod sse;

pub use config::{Config, ModelConfig, ProbeConfig, SandboxConfig, StorageConfig};
pub use message::{ChatMessage, FunctionCall, Role, ToolCall};
pub use provider::{
    FunctionDefinition, LanguageModel, ModelEvent, ModelStream, OpenAiClient, StepRequest,
    ToolDefinition,
};
pub use retry::{RetryConfig, Sleeper, TokioSleeper};
pub use sse::{is_event_stream_content_type, SseEvent, SseEventBuffer};
