//! MCP transport layer
//!
//! JSON-RPC 2.0 over the two remote dialects:
//! - streamable HTTP: every message is a POST, the reply is either JSON or a
//!   short event stream carrying the response
//! - legacy SSE: a long-lived GET stream announces a POST endpoint in its
//!   first `endpoint` event; responses come back on the stream

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use toolchat_core::sse::{is_event_stream_content_type, SseEvent, SseEventBuffer};
use tracing::{debug, trace, warn};
use url::Url;

const SESSION_HEADER: &str = "mcp-session-id";

/// Upper bound on the session DELETE sent when closing
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The server refused the request; for the streamable dialect this is
    /// the signal to fall back to SSE
    #[error("server rejected request with status {0}")]
    Rejected(StatusCode),
    #[error("transport closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => serde_json::json!({ "jsonrpc": "2.0", "method": method }),
    }
}

/// Parse a stream payload as a JSON-RPC response; server-initiated
/// requests and notifications yield `None`
fn parse_response(data: &str) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(data).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn response_for(data: &str, id: u64) -> Option<JsonRpcResponse> {
    parse_response(data).filter(|response| response.id == Some(id))
}

/// Build a header map from materialised pairs
pub fn header_map(pairs: &[(String, String)]) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (key, value) in pairs {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TransportError::Protocol(format!("invalid header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Protocol(format!("invalid value for header '{key}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Close the transport; calling it again is a no-op
    async fn close(&self) -> Result<(), TransportError>;
}

/// Streamable HTTP transport
pub struct StreamableHttpTransport {
    endpoint: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(client: reqwest::Client, endpoint: Url, headers: HeaderMap) -> Self {
        Self {
            endpoint,
            headers,
            client,
            session_id: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Rejected(response.status()));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let id = request.id;
        let body = serde_json::to_value(&request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let response = self.post(&body).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let mut events = Box::pin(response.bytes_stream());
            let mut buffer = SseEventBuffer::default();
            while let Some(chunk) = events.next().await {
                for event in buffer.push(&chunk?) {
                    if let Some(response) = response_for(&event.data, id) {
                        return Ok(response);
                    }
                }
            }
            for event in buffer.finish() {
                if let Some(response) = response_for(&event.data, id) {
                    return Ok(response);
                }
            }
            return Err(TransportError::Protocol(
                "event stream ended before the response arrived".to_string(),
            ));
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON-RPC response: {e}")))
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.post(&notification(method, params)).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // End the server-side session when one was assigned
        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let request = self
                .client
                .delete(self.endpoint.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .send();
            match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, request).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, "Failed to terminate MCP session"),
                Err(_) => debug!("Timed out terminating MCP session"),
            }
        }
        Ok(())
    }
}

type PendingMap = DashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// Legacy SSE transport
pub struct SseTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    post_url: Url,
    pending: Arc<PendingMap>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event
    pub async fn connect(
        client: reqwest::Client,
        url: Url,
        headers: HeaderMap,
    ) -> Result<Self, TransportError> {
        let response = client
            .get(url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Rejected(response.status()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !is_event_stream_content_type(content_type) {
            return Err(TransportError::Protocol(format!(
                "expected text/event-stream, got '{content_type}'"
            )));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut buffer = SseEventBuffer::default();
        let mut early = Vec::new();
        let endpoint = 'outer: loop {
            let Some(chunk) = stream.next().await else {
                return Err(TransportError::Protocol(
                    "event stream ended before the endpoint event".to_string(),
                ));
            };
            let mut events = buffer.push(&chunk?).into_iter();
            while let Some(event) = events.next() {
                if event.kind() == "endpoint" {
                    early.extend(events);
                    break 'outer event.data;
                }
            }
        };

        let post_url = url
            .join(endpoint.trim())
            .map_err(|e| TransportError::Protocol(format!("invalid endpoint '{endpoint}': {e}")))?;
        if post_url.origin() != url.origin() {
            return Err(TransportError::Protocol(format!(
                "endpoint origin {} does not match {}",
                post_url.origin().ascii_serialization(),
                url.origin().ascii_serialization()
            )));
        }
        debug!(endpoint = %post_url, "SSE transport connected");

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));
        for event in early {
            dispatch(&pending, &event);
        }
        let reader = tokio::spawn(read_events(
            stream,
            buffer,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        Ok(Self {
            client,
            headers,
            post_url,
            pending,
            connected,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn post(&self, body: &Value) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Rejected(response.status()));
        }
        Ok(())
    }
}

fn dispatch(pending: &PendingMap, event: &SseEvent) {
    if event.kind() != "message" {
        return;
    }
    let Some(response) = parse_response(&event.data) else {
        trace!(data = %event.data, "Ignoring non-response SSE message");
        return;
    };
    if let Some((_, sender)) = response.id.and_then(|id| pending.remove(&id)) {
        let _ = sender.send(response);
    }
}

async fn read_events<S, B>(
    mut stream: S,
    mut buffer: SseEventBuffer,
    pending: Arc<PendingMap>,
    connected: Arc<AtomicBool>,
) where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for event in buffer.push(bytes.as_ref()) {
                    dispatch(&pending, &event);
                }
            }
            Err(e) => {
                warn!(error = %e, "SSE stream failed");
                break;
            }
        }
    }
    for event in buffer.finish() {
        dispatch(&pending, &event);
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with `Closed`
    pending.clear();
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let body = serde_json::to_value(&request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Err(e) = self.post(&body).await {
            self.pending.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.post(&notification(method, params)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.clear();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
