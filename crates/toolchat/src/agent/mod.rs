//! Conversational turns
//!
//! A turn streams model output, runs tool calls against the aggregated tool
//! map and releases the per-turn tool sessions when it ends.

mod orchestrator;
mod state;

pub use orchestrator::{
    FinishHook, StreamOrchestrator, TurnEvent, TurnHandle, TurnOutcome, TurnRequest,
};
pub use state::{
    default_system_prompt, user_facing_error, TurnConfig, TurnState, GENERIC_ERROR_MESSAGE,
    RATE_LIMIT_MESSAGE,
};
