//! End-to-end MCP dialect handling against in-process axum servers

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use toolchat::mcp::{
    Dialect, HealthProbe, McpClient, McpConnector, McpHealthProbe, ServerStatus, ToolAggregator,
    ToolServerDescriptor,
};
use toolchat::tools::ToolOutput;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal MCP method handling shared by both fake servers
fn answer(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let result = match request["method"].as_str()? {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "1.0.0"}
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "echo",
                "description": "Echo the input",
                "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
            }]
        }),
        "tools/call" => json!({
            "content": [{"type": "text", "text": request["params"]["arguments"]["text"].clone()}]
        }),
        "ping" => json!({}),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[derive(Default)]
struct StreamableState {
    /// Session header seen on each request after the first
    sessions: Mutex<Vec<Option<String>>>,
    deletes: AtomicUsize,
    /// Answer requests as single-event streams instead of JSON bodies
    as_event_stream: bool,
}

async fn streamable_post(
    State(state): State<Arc<StreamableState>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let initializing = request["method"] == "initialize";
    if !initializing {
        state.sessions.lock().push(session);
    }

    let Some(response) = answer(&request) else {
        return StatusCode::ACCEPTED.into_response();
    };
    let mut reply = if state.as_event_stream {
        (
            [("content-type", "text/event-stream")],
            format!("event: message\ndata: {}\n\n", response),
        )
            .into_response()
    } else {
        Json(response).into_response()
    };
    if initializing {
        reply
            .headers_mut()
            .insert("mcp-session-id", "session-1".parse().unwrap());
    }
    reply
}

async fn streamable_delete(State(state): State<Arc<StreamableState>>) -> StatusCode {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn streamable_server(as_event_stream: bool) -> (String, Arc<StreamableState>) {
    let state = Arc::new(StreamableState {
        as_event_stream,
        ..Default::default()
    });
    let app = Router::new()
        .route("/mcp", post(streamable_post).delete(streamable_delete))
        .with_state(Arc::clone(&state));
    let addr = serve(app).await;
    (format!("http://{addr}/mcp"), state)
}

struct SseState {
    /// Announced in the `endpoint` event
    endpoint: String,
    outbox: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

async fn sse_stream(
    State(state): State<Arc<SseState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    *state.outbox.lock() = Some(tx);

    let endpoint = stream::once(futures::future::ready(Ok::<_, Infallible>(Event::default()
        .event("endpoint")
        .data(state.endpoint.clone()))));
    let messages = stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        Some((
            Ok::<_, Infallible>(Event::default().event("message").data(message.to_string())),
            rx,
        ))
    });
    Sse::new(endpoint.chain(messages))
}

async fn sse_post(State(state): State<Arc<SseState>>, Json(request): Json<Value>) -> StatusCode {
    if let Some(response) = answer(&request) {
        if let Some(outbox) = state.outbox.lock().as_ref() {
            let _ = outbox.send(response);
        }
    }
    StatusCode::ACCEPTED
}

/// Server that only speaks the legacy dialect: POST to the stream URL is refused
async fn sse_only_server(endpoint: &str) -> String {
    let state = Arc::new(SseState {
        endpoint: endpoint.to_string(),
        outbox: Mutex::new(None),
    });
    let app = Router::new()
        .route("/mcp", get(sse_stream))
        .route("/messages", post(sse_post))
        .with_state(state);
    let addr = serve(app).await;
    format!("http://{addr}/mcp")
}

/// Streamable server that answers `initialize` and then stalls
///
/// With `stall_requests` every other request hangs; otherwise requests are
/// answered and only the session DELETE hangs.
async fn stalling_server(stall_requests: bool) -> String {
    let handler = move |Json(request): Json<Value>| async move {
        let initializing = request["method"] == "initialize";
        if stall_requests && !initializing {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        match answer(&request) {
            Some(response) => (
                [("mcp-session-id", "session-slow")],
                Json(response),
            )
                .into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        }
    };
    let app = Router::new().route(
        "/mcp",
        post(handler).delete(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::OK
        }),
    );
    let addr = serve(app).await;
    format!("http://{addr}/mcp")
}

#[tokio::test]
async fn stalled_initialized_notification_fails_health_check_in_time() {
    let url = stalling_server(true).await;

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        McpHealthProbe::new(Duration::from_secs(1)).probe(&url, &[]),
    )
    .await
    .expect("health check must respect its own timeout");
    assert!(!report.ready);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn stalled_session_delete_does_not_delay_health_check() {
    let url = stalling_server(false).await;

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        McpHealthProbe::new(Duration::from_secs(1)).probe(&url, &[]),
    )
    .await
    .expect("closing must not wait on the server");
    assert!(report.ready, "{:?}", report.error);
}

#[tokio::test]
async fn streamable_http_dialect_keeps_session() {
    let (url, state) = streamable_server(false).await;

    let (client, dialect) = McpClient::connect_remote(&url, &[], TIMEOUT).await.unwrap();
    assert_eq!(dialect, Dialect::StreamableHttp);

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    assert!(client.close().await);
    assert!(!client.close().await);

    let sessions = state.sessions.lock().clone();
    assert!(!sessions.is_empty());
    assert!(sessions.iter().all(|s| s.as_deref() == Some("session-1")));
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streamable_http_event_stream_responses() {
    let (url, _state) = streamable_server(true).await;

    let (client, dialect) = McpClient::connect_remote(&url, &[], TIMEOUT).await.unwrap();
    assert_eq!(dialect, Dialect::StreamableHttp);

    let result = client
        .call_tool("echo", json!({"text": "hello"}))
        .await
        .unwrap();
    assert_eq!(result.content[0].text.as_deref(), Some("hello"));
    client.close().await;
}

#[tokio::test]
async fn falls_back_to_sse_dialect() {
    let url = sse_only_server("/messages?session=abc").await;

    let (client, dialect) = McpClient::connect_remote(&url, &[], TIMEOUT).await.unwrap();
    assert_eq!(dialect, Dialect::Sse);

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "echo");
    let result = client
        .call_tool("echo", json!({"text": "over sse"}))
        .await
        .unwrap();
    assert_eq!(result.content[0].text.as_deref(), Some("over sse"));
    client.close().await;
}

#[tokio::test]
async fn probe_reports_ready_for_both_dialects() {
    let probe = McpHealthProbe::new(TIMEOUT);

    let (streamable, _state) = streamable_server(false).await;
    let report = probe.probe(&streamable, &[]).await;
    assert!(report.ready, "{:?}", report.error);
    assert_eq!(report.tools.unwrap()[0].name, "echo");

    let legacy = sse_only_server("/messages").await;
    let report = probe.probe(&legacy, &[]).await;
    assert!(report.ready, "{:?}", report.error);
    let tools = report.tools.unwrap();
    assert_eq!(tools[0].description.as_deref(), Some("Echo the input"));
}

#[tokio::test]
async fn sse_endpoint_on_foreign_origin_is_refused() {
    let url = sse_only_server("http://elsewhere.invalid/messages").await;

    let report = McpHealthProbe::new(TIMEOUT).probe(&url, &[]).await;
    assert!(!report.ready);
    assert!(report.error.unwrap().contains("origin"));
}

#[tokio::test]
async fn unreachable_server_is_not_ready() {
    let report = McpHealthProbe::new(Duration::from_secs(1))
        .probe("http://127.0.0.1:9/mcp", &[])
        .await;
    assert!(!report.ready);
    assert!(report.tools.is_none());
}

#[tokio::test]
async fn aggregator_opens_sessions_over_both_dialects() {
    let (streamable, state) = streamable_server(false).await;
    let legacy = sse_only_server("/messages").await;

    let mut first = ToolServerDescriptor::remote("first", &streamable).with_id("first");
    first.status = ServerStatus::Connected;
    let mut second = ToolServerDescriptor::remote("second", &legacy).with_id("second");
    second.status = ServerStatus::Connected;

    let aggregator = ToolAggregator::new(Arc::new(McpConnector::new(TIMEOUT)));
    let built = aggregator.build(&[first, second]).await;
    assert_eq!(built.tools.names(), vec!["echo"]);
    assert_eq!(built.cleanup.session_count(), 2);

    let result = built
        .tools
        .get("echo")
        .unwrap()
        .execute(&json!({"text": "merged"}))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, ToolOutput::PlainText("merged".into()));

    assert!(built.cleanup.cleanup().await);
    assert!(!built.cleanup.cleanup().await);
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
}
