//! Turn configuration and per-turn bookkeeping

use chrono::NaiveDate;
use toolchat_core::{ChatMessage, ModelConfig};

/// Shown when the model provider reports a rate limit
pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Shown for every other generation failure
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred.";

/// Configuration for one conversational turn
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub model: String,
    /// Override for the default system prompt
    pub system_prompt: Option<String>,
    /// Maximum generation steps (tool round trips) per turn
    pub max_steps: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self::from_model_config(&ModelConfig::default())
    }
}

impl TurnConfig {
    pub fn from_model_config(config: &ModelConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_steps: config.max_steps,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// System prompt for a turn taking place on `today`
    pub fn system_prompt_for(&self, today: NaiveDate) -> String {
        match &self.system_prompt {
            Some(prompt) => prompt.clone(),
            None => default_system_prompt(today),
        }
    }
}

pub fn default_system_prompt(today: NaiveDate) -> String {
    format!(
        "You are a helpful assistant with access to a variety of tools.\n\
         \n\
         Today's date is {}.\n\
         \n\
         Choose the tool that is most relevant to the user's question. \
         You can use multiple tools in a single response and run multiple steps.\n\
         If no suitable tool is available, say you don't know, or suggest adding \
         a tool server.\n\
         Always respond to the user after using tools.\n\
         \n\
         ## Response Format\n\
         - Markdown is supported.\n\
         - Base your answer on the tool responses.",
        today.format("%Y-%m-%d")
    )
}

/// Map a generation failure to the text shown to the user
pub fn user_facing_error(error: &anyhow::Error) -> &'static str {
    if format!("{error:#}").to_lowercase().contains("rate limit") {
        RATE_LIMIT_MESSAGE
    } else {
        GENERIC_ERROR_MESSAGE
    }
}

/// Messages of a turn in progress
///
/// The system prompt is sent to the model but never reported back as part
/// of the conversation.
#[derive(Debug, Clone)]
pub struct TurnState {
    system: ChatMessage,
    pub messages: Vec<ChatMessage>,
    pub step: usize,
}

impl TurnState {
    pub fn new(system_prompt: String, conversation: Vec<ChatMessage>) -> Self {
        Self {
            system: ChatMessage::system(system_prompt),
            messages: conversation,
            step: 0,
        }
    }

    /// Full message list for the next model request
    pub fn request_messages(&self) -> Vec<ChatMessage> {
        std::iter::once(self.system.clone())
            .chain(self.messages.iter().cloned())
            .collect()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }
}
