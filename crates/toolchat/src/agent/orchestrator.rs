//! Streamed conversational turn
//!
//! A turn runs on its own task: it streams one or more generation steps from
//! the model, dispatches tool calls against the turn's [`ToolMap`] and feeds
//! the results back until the model answers without tools or the step budget
//! runs out. Events are relayed over a channel. Whatever way the turn ends
//! (completion, failure, cancellation or a dropped receiver) the per-turn
//! [`CleanupHandle`] runs exactly once.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use toolchat_core::{ChatMessage, LanguageModel, ModelEvent, StepRequest, ToolCall};
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::state::{user_facing_error, TurnConfig, TurnState};
use crate::mcp::CleanupHandle;
use crate::tools::{ToolMap, ToolOutput, ToolResult};

const EVENT_BUFFER: usize = 64;

/// Incremental output of a turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCall),
    ToolResult {
        id: String,
        name: String,
        output: ToolOutput,
        success: bool,
    },
    /// User-facing failure message; the turn ends after it
    Error(String),
    Finished,
}

/// Called once with the finalized conversation on normal completion
pub type FinishHook = Box<dyn FnOnce(Vec<ChatMessage>) + Send>;

/// Everything one turn needs
pub struct TurnRequest {
    /// Conversation so far, without the system prompt
    pub messages: Vec<ChatMessage>,
    pub tools: ToolMap,
    pub cleanup: CleanupHandle,
    pub on_finish: Option<FinishHook>,
}

impl TurnRequest {
    pub fn new(messages: Vec<ChatMessage>, tools: ToolMap, cleanup: CleanupHandle) -> Self {
        Self {
            messages,
            tools,
            cleanup,
            on_finish: None,
        }
    }

    pub fn on_finish(mut self, hook: impl FnOnce(Vec<ChatMessage>) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Finalized conversation: input messages plus every generated record
    Completed(Vec<ChatMessage>),
    Cancelled,
    /// Carries the user-facing message
    Failed(String),
}

/// Caller side of a running turn
///
/// Dropping the handle cancels the turn.
pub struct TurnHandle {
    pub events: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
    guard: DropGuard,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Abort the turn; cleanup still runs on the turn task
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the turn task, including its cleanup
    pub async fn join(self) -> TurnOutcome {
        let TurnHandle { guard, task, .. } = self;
        let joined = task.await;
        let _ = guard.disarm();
        match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Turn task failed");
                TurnOutcome::Failed(super::state::GENERIC_ERROR_MESSAGE.to_string())
            }
        }
    }
}

/// Drives turns against a language model
pub struct StreamOrchestrator {
    model: Arc<dyn LanguageModel>,
    config: TurnConfig,
}

/// Result of driving the steps to their end
enum Drive {
    Done,
    /// The event receiver went away, which counts as cancellation
    Abandoned,
}

impl StreamOrchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, config: TurnConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Start a turn on a new task
    #[instrument(skip_all, fields(model = %self.config.model))]
    pub fn run(&self, request: TurnRequest) -> TurnHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let model = Arc::clone(&self.model);
        let config = self.config.clone();

        let task = tokio::spawn(
            async move {
                let TurnRequest {
                    messages,
                    tools,
                    cleanup,
                    on_finish,
                } = request;
                let today = chrono::Local::now().date_naive();
                let mut state = TurnState::new(config.system_prompt_for(today), messages);
                debug!(tools = tools.len(), "Turn started");

                let driven = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    _ = tx.closed() => None,
                    result = drive(model.as_ref(), &config, &mut state, &tools, &tx) => Some(result),
                };

                let outcome = match driven {
                    None | Some(Ok(Drive::Abandoned)) => {
                        info!(step = state.step, "Turn cancelled");
                        TurnOutcome::Cancelled
                    }
                    Some(Ok(Drive::Done)) => {
                        let messages = state.into_messages();
                        if let Some(hook) = on_finish {
                            hook(messages.clone());
                        }
                        let _ = tx.send(TurnEvent::Finished).await;
                        TurnOutcome::Completed(messages)
                    }
                    Some(Err(e)) => {
                        warn!(error = %format!("{e:#}"), "Turn failed");
                        let message = user_facing_error(&e).to_string();
                        let _ = tx.send(TurnEvent::Error(message.clone())).await;
                        TurnOutcome::Failed(message)
                    }
                };

                cleanup.cleanup().await;
                outcome
            }
            .in_current_span(),
        );

        TurnHandle {
            events: rx,
            guard: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }
}

/// Run generation steps until the model stops calling tools
async fn drive(
    model: &dyn LanguageModel,
    config: &TurnConfig,
    state: &mut TurnState,
    tools: &ToolMap,
    tx: &mpsc::Sender<TurnEvent>,
) -> Result<Drive> {
    let definitions = tools.definitions();

    while state.step < config.max_steps {
        state.step += 1;
        let messages = state.request_messages();
        let mut stream = model
            .stream_step(StepRequest {
                model: &config.model,
                messages: &messages,
                tools: &definitions,
            })
            .await
            .context("Failed to start generation")?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut calls = Vec::new();

        while let Some(event) = stream.next().await {
            let forwarded = match event? {
                ModelEvent::TextDelta(text) => {
                    content.push_str(&text);
                    TurnEvent::TextDelta(text)
                }
                ModelEvent::ReasoningDelta(text) => {
                    reasoning.push_str(&text);
                    TurnEvent::ReasoningDelta(text)
                }
                ModelEvent::ToolCall(call) => {
                    calls.push(call.clone());
                    TurnEvent::ToolCall(call)
                }
                ModelEvent::Finished => break,
            };
            if tx.send(forwarded).await.is_err() {
                return Ok(Drive::Abandoned);
            }
        }

        if calls.is_empty() {
            let mut message = ChatMessage::assistant(content);
            if !reasoning.is_empty() {
                message.reasoning = Some(reasoning);
            }
            state.push(message);
            return Ok(Drive::Done);
        }

        debug!(step = state.step, calls = calls.len(), "Dispatching tool calls");
        let reasoning = (!reasoning.is_empty()).then_some(reasoning);
        state.push(ChatMessage::assistant_with_tools(
            content,
            reasoning,
            calls.clone(),
        ));

        for call in calls {
            let result = dispatch(tools, &call).await;
            state.push(ChatMessage::tool_result(
                &call.id,
                result.output.to_model_content(),
            ));
            let event = TurnEvent::ToolResult {
                id: call.id,
                name: call.function.name,
                output: result.output,
                success: result.success,
            };
            if tx.send(event).await.is_err() {
                return Ok(Drive::Abandoned);
            }
        }
    }

    info!(max_steps = config.max_steps, "Step budget exhausted");
    Ok(Drive::Done)
}

async fn dispatch(tools: &ToolMap, call: &ToolCall) -> ToolResult {
    let name = &call.function.name;
    let Some(tool) = tools.get(name) else {
        warn!(tool = %name, "Model called an unknown tool");
        return ToolResult::error(format!("Tool not found: {name}"));
    };

    match tool.execute(&call.function.arguments).await {
        Ok(result) => result,
        Err(e) => {
            warn!(tool = %name, error = %format!("{e:#}"), "Tool execution failed");
            ToolResult::error(format!("Tool execution failed: {e:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::{GENERIC_ERROR_MESSAGE, RATE_LIMIT_MESSAGE};
    use crate::mcp::aggregator::testing::{FakeConnector, FakeSession};
    use crate::mcp::registry::{ServerStatus, ToolDescriptor, ToolServerDescriptor};
    use crate::mcp::{AggregatedTools, ToolAggregator};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use toolchat_core::{ModelStream, Role};

    enum Step {
        Events(Vec<Result<ModelEvent>>),
        /// Emit the events, then never finish
        Hang(Vec<ModelEvent>),
        Refuse(&'static str),
    }

    /// Model replaying scripted steps and recording what it was sent
    #[derive(Default)]
    struct ScriptedModel {
        steps: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<(Vec<ChatMessage>, Vec<String>)>>,
    }

    impl ScriptedModel {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream_step(&self, request: StepRequest<'_>) -> Result<ModelStream> {
            self.requests.lock().push((
                request.messages.to_vec(),
                request.tools.iter().map(|t| t.function.name.clone()).collect(),
            ));
            let step = self
                .steps
                .lock()
                .pop_front()
                .unwrap_or_else(|| Step::Events(vec![Ok(ModelEvent::TextDelta("again".into()))]));
            match step {
                Step::Events(events) => Ok(Box::pin(stream::iter(events))),
                Step::Hang(events) => Ok(Box::pin(
                    stream::iter(events.into_iter().map(Ok::<_, anyhow::Error>))
                        .chain(stream::pending()),
                )),
                Step::Refuse(message) => Err(anyhow!(message)),
            }
        }
    }

    fn text(s: &str) -> Result<ModelEvent> {
        Ok(ModelEvent::TextDelta(s.into()))
    }

    fn call(id: &str, name: &str) -> Result<ModelEvent> {
        Ok(ModelEvent::ToolCall(ToolCall::new(
            id,
            name,
            serde_json::json!({"q": 1}),
        )))
    }

    async fn weather_tools() -> (AggregatedTools, Arc<FakeSession>) {
        let connector =
            FakeConnector::default().with("https://w/mcp", FakeSession::new("w", &["weather"]));
        let session = connector.sessions["https://w/mcp"].clone();
        let mut descriptor = ToolServerDescriptor::remote("w", "https://w/mcp").with_id("w");
        descriptor.status = ServerStatus::Connected;
        descriptor.tool_catalog = vec![ToolDescriptor::named("weather")];
        let built = ToolAggregator::new(Arc::new(connector))
            .build(&[descriptor])
            .await;
        (built, session)
    }

    fn orchestrator(model: Arc<ScriptedModel>) -> StreamOrchestrator {
        StreamOrchestrator::new(model, TurnConfig::default().with_system_prompt("sys"))
    }

    async fn collect(handle: &mut TurnHandle) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let model = ScriptedModel::new(vec![Step::Events(vec![
            Ok(ModelEvent::ReasoningDelta("thinking".into())),
            text("Hel"),
            text("lo"),
            Ok(ModelEvent::Finished),
        ])]);
        let finished = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&finished);

        let request = TurnRequest::new(
            vec![ChatMessage::user("hi")],
            ToolMap::new(),
            CleanupHandle::empty(),
        )
        .on_finish(move |messages| sink.lock().push(messages));
        let mut handle = orchestrator(model.clone()).run(request);

        let events = collect(&mut handle).await;
        assert_eq!(
            events,
            vec![
                TurnEvent::ReasoningDelta("thinking".into()),
                TurnEvent::TextDelta("Hel".into()),
                TurnEvent::TextDelta("lo".into()),
                TurnEvent::Finished,
            ]
        );

        let TurnOutcome::Completed(messages) = handle.join().await else {
            panic!("turn did not complete");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[1].reasoning.as_deref(), Some("thinking"));

        let finished = finished.lock();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0], messages);

        let requests = model.requests.lock();
        assert_eq!(requests[0].0[0].role, Role::System);
        assert_eq!(requests[0].0[0].content, "sys");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let (built, session) = weather_tools().await;
        let cleanup = built.cleanup.clone();
        let model = ScriptedModel::new(vec![
            Step::Events(vec![call("c1", "weather"), Ok(ModelEvent::Finished)]),
            Step::Events(vec![text("Sunny"), Ok(ModelEvent::Finished)]),
        ]);

        let request = TurnRequest::new(vec![ChatMessage::user("weather?")], built.tools, built.cleanup);
        let mut handle = orchestrator(model.clone()).run(request);
        let events = collect(&mut handle).await;

        assert!(events.contains(&TurnEvent::ToolResult {
            id: "c1".into(),
            name: "weather".into(),
            output: ToolOutput::PlainText("w:weather".into()),
            success: true,
        }));
        assert_eq!(events.last(), Some(&TurnEvent::Finished));

        let TurnOutcome::Completed(messages) = handle.join().await else {
            panic!("turn did not complete");
        };
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[2].content, "w:weather");

        // The second step saw the tool result and the tool definitions
        let requests = model.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0.len(), 4);
        assert_eq!(requests[1].1, vec!["weather".to_string()]);

        assert!(cleanup.is_done());
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert!(!cleanup.cleanup().await);
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_error_result() {
        let model = ScriptedModel::new(vec![
            Step::Events(vec![call("c1", "missing")]),
            Step::Events(vec![text("sorry")]),
        ]);
        let request = TurnRequest::new(vec![ChatMessage::user("x")], ToolMap::new(), CleanupHandle::empty());
        let mut handle = orchestrator(model).run(request);
        let events = collect(&mut handle).await;

        assert!(events.contains(&TurnEvent::ToolResult {
            id: "c1".into(),
            name: "missing".into(),
            output: ToolOutput::PlainText("Tool not found: missing".into()),
            success: false,
        }));
        assert!(matches!(handle.join().await, TurnOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_cancel_runs_cleanup_once() {
        let (built, session) = weather_tools().await;
        let cleanup = built.cleanup.clone();
        let model = ScriptedModel::new(vec![Step::Hang(vec![ModelEvent::TextDelta("partial".into())])]);
        let finished = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&finished);

        let request = TurnRequest::new(vec![ChatMessage::user("x")], built.tools, built.cleanup)
            .on_finish(move |_| *sink.lock() += 1);
        let mut handle = orchestrator(model).run(request);

        assert_eq!(handle.next_event().await, Some(TurnEvent::TextDelta("partial".into())));
        handle.cancel();
        // A second trigger racing the first is harmless
        handle.cancel();

        assert_eq!(handle.join().await, TurnOutcome::Cancelled);
        assert!(cleanup.is_done());
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert!(!cleanup.cleanup().await);
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*finished.lock(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_cancellation() {
        let (built, session) = weather_tools().await;
        let model = ScriptedModel::new(vec![Step::Events(
            (0..(EVENT_BUFFER * 2)).map(|_| text("x")).collect(),
        )]);
        let request = TurnRequest::new(vec![ChatMessage::user("x")], built.tools, built.cleanup);
        let mut handle = orchestrator(model).run(request);
        handle.events.close();

        assert_eq!(handle.join().await, TurnOutcome::Cancelled);
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_runs_cleanup() {
        let (built, session) = weather_tools().await;
        let cleanup = built.cleanup.clone();
        let model = ScriptedModel::new(vec![Step::Hang(vec![])]);

        let request = TurnRequest::new(vec![ChatMessage::user("x")], built.tools, built.cleanup);
        let handle = orchestrator(model).run(request);
        tokio::task::yield_now().await;
        drop(handle);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while session.closes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(cleanup.is_done());
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_error_is_friendly() {
        let (built, session) = weather_tools().await;
        let model = ScriptedModel::new(vec![Step::Events(vec![
            text("par"),
            Err(anyhow!("Rate Limit exceeded by model API")),
        ])]);
        let finished = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&finished);

        let request = TurnRequest::new(vec![ChatMessage::user("x")], built.tools, built.cleanup)
            .on_finish(move |_| *sink.lock() += 1);
        let mut handle = orchestrator(model).run(request);
        let events = collect(&mut handle).await;

        assert_eq!(
            events.last(),
            Some(&TurnEvent::Error(RATE_LIMIT_MESSAGE.to_string()))
        );
        assert_eq!(
            handle.join().await,
            TurnOutcome::Failed(RATE_LIMIT_MESSAGE.to_string())
        );
        assert_eq!(*finished.lock(), 0);
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_request_is_generic_error() {
        let model = ScriptedModel::new(vec![Step::Refuse("connection reset")]);
        let request = TurnRequest::new(vec![ChatMessage::user("x")], ToolMap::new(), CleanupHandle::empty());
        let handle = orchestrator(model).run(request);

        assert_eq!(
            handle.join().await,
            TurnOutcome::Failed(GENERIC_ERROR_MESSAGE.to_string())
        );
    }

    #[tokio::test]
    async fn test_step_budget_ends_turn() {
        let (built, _session) = weather_tools().await;
        let model = ScriptedModel::new(
            (0..5)
                .map(|i| Step::Events(vec![call(&format!("c{i}"), "weather")]))
                .collect(),
        );
        let config = TurnConfig::default().with_max_steps(3);
        let request = TurnRequest::new(vec![ChatMessage::user("loop")], built.tools, built.cleanup);
        let handle = StreamOrchestrator::new(model.clone(), config).run(request);

        let TurnOutcome::Completed(messages) = handle.join().await else {
            panic!("turn did not complete");
        };
        assert_eq!(model.requests.lock().len(), 3);
        // user + 3 x (assistant call + tool result)
        assert_eq!(messages.len(), 7);
    }
}
