//! Language model streaming capability
//!
//! The orchestrator only sees [`LanguageModel`]; [`OpenAiClient`] implements it
//! for any OpenAI-compatible `/chat/completions` endpoint.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use crate::message::{ChatMessage, Role, ToolCall};
use crate::sse::SseEventBuffer;

/// Function definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
}

/// Tool definition in function-calling form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Incremental output of one generation step
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// Complete tool call, emitted once its arguments are fully streamed
    ToolCall(ToolCall),
    Finished,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent>> + Send>>;

/// Inputs of a single generation step
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolDefinition],
}

/// Streaming generation capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_step(&self, request: StepRequest<'_>) -> Result<ModelStream>;
}

/// Client for OpenAI-compatible chat completion APIs
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    stream: bool,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunctionCall<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall<'a> {
    name: &'a str,
    /// Arguments travel as a JSON-encoded string
    arguments: String,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        let tool_calls = message
            .tool_calls
            .iter()
            .flatten()
            .map(|call| WireToolCall {
                id: &call.id,
                call_type: "function",
                function: WireFunctionCall {
                    name: &call.function.name,
                    arguments: call.function.arguments.to_string(),
                },
            })
            .collect();

        Self {
            role: message.role,
            content: &message.content,
            tool_calls,
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn stream_step(&self, request: StepRequest<'_>) -> Result<ModelStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: request.model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools: request.tools,
            stream: true,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to connect to model API")?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            bail!("Rate limit exceeded by model API");
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Model API returned {}: {}", status, text);
        }

        debug!(model = request.model, "Model stream opened");

        let stream = async_stream::stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer = SseEventBuffer::default();
            let mut decoder = ChunkDecoder::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("Model stream interrupted"));
                        return;
                    }
                };
                for event in buffer.push(&chunk) {
                    match decoder.decode(&event.data) {
                        Ok(events) => {
                            for ev in events {
                                yield Ok(ev);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                if decoder.is_done() {
                    return;
                }
            }

            for event in buffer.finish() {
                match decoder.decode(&event.data) {
                    Ok(events) => {
                        for ev in events {
                            yield Ok(ev);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            for ev in decoder.finish() {
                yield Ok(ev);
            }
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Turns `data:` payloads of a completion stream into [`ModelEvent`]s
#[derive(Debug, Default)]
struct ChunkDecoder {
    calls: BTreeMap<usize, PartialToolCall>,
    done: bool,
}

impl ChunkDecoder {
    fn is_done(&self) -> bool {
        self.done
    }

    fn decode(&mut self, data: &str) -> Result<Vec<ModelEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        if data.trim() == "[DONE]" {
            return Ok(self.finish());
        }

        let chunk: StreamChunk =
            serde_json::from_str(data).context("Failed to parse model stream chunk")?;
        if let Some(error) = chunk.error {
            bail!("{}", error.message);
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                if !reasoning.is_empty() {
                    events.push(ModelEvent::ReasoningDelta(reasoning));
                }
            }
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    events.push(ModelEvent::TextDelta(content));
                }
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let partial = self.calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    partial.id = Some(id);
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        partial.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        partial.arguments.push_str(&arguments);
                    }
                }
            }
        }
        Ok(events)
    }

    /// Emit accumulated tool calls and the end-of-step marker, once
    fn finish(&mut self) -> Vec<ModelEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut events: Vec<ModelEvent> = std::mem::take(&mut self.calls)
            .into_iter()
            .filter(|(_, partial)| !partial.name.is_empty())
            .map(|(index, partial)| {
                let arguments = parse_arguments(&partial.arguments);
                let id = partial.id.unwrap_or_else(|| format!("call_{}", index));
                ModelEvent::ToolCall(ToolCall::new(id, partial.name, arguments))
            })
            .collect();
        events.push(ModelEvent::Finished);
        events
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
