//! The hot-reload control plane.
//!
//! A single HTTP listener on the loopback interface accepts reload requests
//! from external build tools, fans them out to connected in-page runtimes
//! over WebSocket, and tracks acknowledgements. Dispatch is serialized per
//! control through a latest-wins queue: at most one reload is in flight per
//! control, and enqueueing while one is pending replaces the pending slot.

pub mod messages;

use crate::common::{self, ERROR, RELOAD, SERVER, SUCCESS};
use crate::intercept::NO_CACHE;
use crate::runtime;
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL, CONTENT_TYPE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{extract, Json, Router};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use messages::{
    to_reload_ack, to_reload_request, AckStatus, InboundFrame, OutboundFrame, ReloadAck,
    ReloadMessage, ReloadRequest,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// How long a dispatched reload may stay unanswered.
pub const RELOAD_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Error recorded when a dispatched reload is never acknowledged.
pub const TIMEOUT_ERROR: &str = "Timed out waiting for runtime ACK";

/// Shared state of the control plane.
///
/// All mutation happens under one mutex, which is never held across an
/// await point: HTTP handlers, WebSocket frames and timeout callbacks are
/// serializable with respect to one another.
pub struct ControlPlane {
    fallback_control: String,
    state: Mutex<PlaneState>,
}

#[derive(Default)]
struct PlaneState {
    closed: bool,
    next_seq: u64,
    next_client: u64,
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    queues: HashMap<String, ControlQueue>,
    last_ack: BTreeMap<String, ReloadAck>,
}

#[derive(Default)]
struct ControlQueue {
    current: Option<ReloadMessage>,
    pending: Option<ReloadMessage>,
    timeout: Option<JoinHandle<()>>,
}

impl ControlPlane {
    pub fn new(fallback_control: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            fallback_control: fallback_control.into(),
            state: Mutex::new(PlaneState::default()),
        })
    }

    pub fn fallback_control(&self) -> &str {
        &self.fallback_control
    }

    fn lock(&self) -> MutexGuard<'_, PlaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a reload request, returning the assigned message id.
    ///
    /// The pending slot for the control is overwritten: only the newest
    /// reload survives until the queue drains.
    pub fn enqueue_reload(self: &Arc<Self>, request: ReloadRequest) -> String {
        let mut state = self.lock();
        state.next_seq += 1;
        let message = ReloadMessage {
            id: format!("r-{}-{}", common::now_epoch_ms(), state.next_seq),
            control_name: request.control_name,
            build_id: request.build_id,
            trigger: request.trigger,
            changed_files: request.changed_files,
            timestamp: common::now_epoch_ms(),
        };
        let id = message.id.clone();
        let control = message.control_name.clone();

        let queue = state.queues.entry(control.clone()).or_default();
        if let Some(replaced) = queue.pending.replace(message) {
            tracing::debug!(
                "pending reload {} for {control} replaced before dispatch",
                replaced.id
            );
        }
        self.process_queue(&mut state, &control);
        id
    }

    /// Promote the pending reload to in-flight and broadcast it.
    fn process_queue(self: &Arc<Self>, state: &mut PlaneState, control: &str) {
        if state.closed {
            return;
        }
        let queue = state.queues.entry(control.to_owned()).or_default();
        if queue.current.is_some() {
            return;
        }
        let message = match queue.pending.take() {
            Some(message) => message,
            None => return,
        };
        queue.current = Some(message.clone());

        let plane = self.clone();
        let timeout_control = control.to_owned();
        let timeout_id = message.id.clone();
        queue.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(RELOAD_TIMEOUT).await;
            plane.on_timeout(&timeout_control, &timeout_id);
        }));

        let text = match serde_json::to_string(&OutboundFrame::Reload(message.clone())) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("error serializing reload frame: {err}");
                return;
            }
        };
        state.clients.retain(|_, tx| tx.send(text.clone()).is_ok());
        tracing::info!(
            "{RELOAD}reload {} (build {}) dispatched to {} client(s)",
            message.id,
            message.build_id,
            state.clients.len()
        );
    }

    /// Timeout callback; only acts when the dispatched reload is still the
    /// active one, tolerating late cancellations after an ACK arrived.
    fn on_timeout(self: &Arc<Self>, control: &str, id: &str) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let queue = match state.queues.get_mut(control) {
            Some(queue) => queue,
            None => return,
        };
        match &queue.current {
            Some(current) if current.id == id => {}
            _ => return,
        }
        let message = match queue.current.take() {
            Some(message) => message,
            None => return,
        };
        queue.timeout = None;

        let now = common::now_epoch_ms();
        tracing::warn!(
            "{ERROR}reload {} for {control} timed out after {:?}",
            message.id,
            RELOAD_TIMEOUT
        );
        let ack = ReloadAck {
            id: message.id,
            control_name: message.control_name,
            build_id: message.build_id,
            status: AckStatus::Failed,
            instances_total: 0,
            instances_reloaded: 0,
            duration_ms: (now - message.timestamp).max(0) as u64,
            error: Some(TIMEOUT_ERROR.to_owned()),
            timestamp: now,
        };
        state.last_ack.insert(control.to_owned(), ack);
        self.process_queue(&mut state, control);
    }

    /// Record an ACK and, when it answers the active reload, drain the queue.
    ///
    /// The last-ACK record is updated even for stale ACKs, so the most
    /// recently received outcome always wins for observability.
    pub fn complete_ack(self: &Arc<Self>, ack: ReloadAck) {
        let mut state = self.lock();
        let control = ack.control_name.clone();
        state.last_ack.insert(control.clone(), ack.clone());

        let queue = match state.queues.get_mut(&control) {
            Some(queue) => queue,
            None => {
                tracing::warn!("stale ACK {} for {control}: no reload was dispatched", ack.id);
                return;
            }
        };
        let current = match &queue.current {
            Some(current) => current,
            None => {
                tracing::warn!("stale ACK {} for {control}: no reload in flight", ack.id);
                return;
            }
        };
        if current.id != ack.id {
            tracing::warn!(
                "stale ACK {} for {control}: in-flight reload is {}",
                ack.id,
                current.id
            );
            return;
        }

        if let Some(timeout) = queue.timeout.take() {
            timeout.abort();
        }
        queue.current = None;

        match ack.status {
            AckStatus::Success => tracing::info!(
                "{SUCCESS}reload {} (build {}) applied: {}/{} instance(s) in {} ms",
                ack.id,
                ack.build_id,
                ack.instances_reloaded,
                ack.instances_total,
                ack.duration_ms
            ),
            AckStatus::Partial | AckStatus::Failed => tracing::warn!(
                "{ERROR}reload {} (build {}) {}: {}/{} instance(s) in {} ms{}",
                ack.id,
                ack.build_id,
                match ack.status {
                    AckStatus::Partial => "partially applied",
                    _ => "failed",
                },
                ack.instances_reloaded,
                ack.instances_total,
                ack.duration_ms,
                ack.error
                    .as_deref()
                    .map(|error| format!(": {error}"))
                    .unwrap_or_default()
            ),
        }

        self.process_queue(&mut state, &control);
    }

    /// Handle a raw inbound WebSocket text frame; malformed frames are
    /// silently ignored.
    pub fn inbound_text(self: &Arc<Self>, text: &str) {
        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        match frame {
            InboundFrame::Ack(payload) => match to_reload_ack(&payload) {
                Ok(ack) => self.complete_ack(ack),
                Err(err) => tracing::debug!("ignoring malformed ACK frame: {err}"),
            },
        }
    }

    /// Snapshot of the latest ACK per control.
    pub fn last_acks(&self) -> BTreeMap<String, ReloadAck> {
        self.lock().last_ack.clone()
    }

    fn register_client(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(id, tx);
        (id, rx)
    }

    fn unregister_client(&self, id: u64) {
        self.lock().clients.remove(&id);
    }

    /// Tear down all control-plane state: cancel every armed timeout and
    /// disconnect every client. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for queue in state.queues.values_mut() {
            if let Some(timeout) = queue.timeout.take() {
                timeout.abort();
            }
            queue.current = None;
            queue.pending = None;
        }
        // Dropping the senders ends each client task, closing its socket.
        state.clients.clear();
    }
}

/// Run the control-plane listener until the shutdown channel fires.
///
/// Resolves only once the listener socket has been released.
pub async fn serve(
    plane: Arc<ControlPlane>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| common::bind_error(err, "hot-reload control plane", port))?;

    tracing::info!("{SERVER}hot-reload control plane listening at http://{addr}");

    let close_plane = plane.clone();
    axum::serve(listener, router(plane.clone()))
        .with_graceful_shutdown(async move {
            // Any event on this channel, even a drop, should trigger shutdown.
            let _res = shutdown_rx.recv().await;
            tracing::debug!("control plane is shutting down");
            // Disconnect the clients now, otherwise the graceful shutdown
            // would wait for their sockets forever.
            close_plane.close();
        })
        .await
        .context("error running control-plane server")?;

    plane.close();
    Ok(())
}

pub(crate) fn router(plane: Arc<ControlPlane>) -> Router {
    // Unknown paths and unexpected methods both answer with a JSON 404.
    Router::new()
        .route("/health", get(health).fallback(not_found))
        .route("/runtime.js", get(runtime_js).fallback(not_found))
        .route("/last-ack", get(last_ack).fallback(not_found))
        .route("/reload", post(reload).fallback(not_found))
        .route("/ack", post(ack).fallback(not_found))
        .route("/ws", get(ws_upgrade).fallback(not_found))
        .fallback(not_found)
        .layer(axum::middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(plane)
}

async fn cors(request: extract::Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "type": "pcf-dev-proxy-hmr"}))
}

async fn runtime_js() -> impl IntoResponse {
    (
        [
            (
                CONTENT_TYPE,
                HeaderValue::from_static("application/javascript; charset=utf-8"),
            ),
            (CACHE_CONTROL, HeaderValue::from_static(NO_CACHE)),
        ],
        format!("{}\n", runtime::runtime_source()),
    )
}

async fn last_ack(State(plane): State<Arc<ControlPlane>>) -> impl IntoResponse {
    Json(plane.last_acks())
}

async fn reload(State(plane): State<Arc<ControlPlane>>, body: Bytes) -> Response {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let request = to_reload_request(&value, plane.fallback_control());
    let id = plane.enqueue_reload(request);
    Json(json!({"accepted": true, "id": id})).into_response()
}

async fn ack(State(plane): State<Arc<ControlPlane>>, body: Bytes) -> Response {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(response) => return response,
    };
    match to_reload_ack(&value) {
        Ok(ack) => {
            plane.complete_ack(ack);
            Json(json!({"ok": true})).into_response()
        }
        Err(err) => bad_request(err.to_string()),
    }
}

fn parse_body(body: &Bytes) -> Result<Value, Response> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice::<Value>(body)
        .map_err(|err| bad_request(format!("invalid JSON body: {err}")))
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message})),
    )
        .into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not found"})),
    )
        .into_response()
}

async fn ws_upgrade(State(plane): State<Arc<ControlPlane>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, plane))
}

async fn handle_ws(socket: WebSocket, plane: Arc<ControlPlane>) {
    let (client_id, mut outbound) = plane.register_client();
    tracing::debug!("hot-reload client {client_id} connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // The plane dropped our sender: shutting down.
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => plane.inbound_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    plane.unregister_client(client_id);
    tracing::debug!("hot-reload client {client_id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(build_id: &str) -> ReloadRequest {
        ReloadRequest {
            control_name: "cc_Test.Control".into(),
            build_id: build_id.into(),
            trigger: "manual".into(),
            changed_files: None,
        }
    }

    fn parse_dispatch(text: &str) -> ReloadMessage {
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["type"], "pcf-hmr:reload");
        serde_json::from_value(value["payload"].clone()).unwrap()
    }

    fn ack_for(message: &ReloadMessage, duration_ms: u64) -> ReloadAck {
        ReloadAck {
            id: message.id.clone(),
            control_name: message.control_name.clone(),
            build_id: message.build_id.clone(),
            status: AckStatus::Success,
            instances_total: 1,
            instances_reloaded: 1,
            duration_ms,
            error: None,
            timestamp: common::now_epoch_ms(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_latest() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();

        plane.enqueue_reload(request("b1"));
        plane.enqueue_reload(request("b2"));
        plane.enqueue_reload(request("b3"));

        // Exactly one dispatch: the first reload went straight in flight.
        let first = parse_dispatch(&rx.try_recv().unwrap());
        assert_eq!(first.build_id, "b1");
        assert!(rx.try_recv().is_err());

        // Completing the in-flight reload drains the newest pending one;
        // the overwritten b2 is never dispatched.
        plane.complete_ack(ack_for(&first, 42));
        let second = parse_dispatch(&rx.try_recv().unwrap());
        assert_eq!(second.build_id, "b3");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique_and_ordered() {
        let plane = ControlPlane::new("cc_Test.Control");
        let a = plane.enqueue_reload(request("b1"));
        let b = plane.enqueue_reload(request("b2"));
        assert_ne!(a, b);
        assert!(a.starts_with("r-"));
        let seq = |id: &str| {
            id.rsplit('-')
                .next()
                .unwrap()
                .parse::<u64>()
                .unwrap()
        };
        assert!(seq(&a) < seq(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_synthesizes_failed_ack_and_drains() {
        let plane = ControlPlane::new("cc_Test.Control");
        plane.enqueue_reload(request("b1"));
        plane.enqueue_reload(request("b2"));

        tokio::time::sleep(RELOAD_TIMEOUT + Duration::from_millis(10)).await;

        let acks = plane.last_acks();
        let ack = acks.get("cc_Test.Control").unwrap();
        assert_eq!(ack.status, AckStatus::Failed);
        assert_eq!(ack.error.as_deref(), Some(TIMEOUT_ERROR));

        // The pending b2 was promoted after the timeout; let it expire too.
        tokio::time::sleep(RELOAD_TIMEOUT + Duration::from_millis(10)).await;
        let acks = plane.last_acks();
        assert_eq!(acks.get("cc_Test.Control").unwrap().build_id, "b2");
    }

    #[tokio::test(start_paused = true)]
    async fn ack_cancels_timeout() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();
        plane.enqueue_reload(request("b1"));
        let message = parse_dispatch(&rx.try_recv().unwrap());
        plane.complete_ack(ack_for(&message, 5));

        tokio::time::sleep(RELOAD_TIMEOUT + Duration::from_millis(10)).await;

        // No synthesized failure may overwrite the successful ACK.
        let acks = plane.last_acks();
        let ack = acks.get("cc_Test.Control").unwrap();
        assert_eq!(ack.status, AckStatus::Success);
        assert_eq!(ack.duration_ms, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ack_is_recorded_but_does_not_dispatch() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();
        plane.enqueue_reload(request("b1"));
        let message = parse_dispatch(&rx.try_recv().unwrap());

        plane.complete_ack(ack_for(&message, 5));
        // A duplicate of the same ACK arrives after the queue went idle.
        plane.complete_ack(ack_for(&message, 99));

        // Last-write-wins on the record, no extra dispatch.
        let acks = plane.last_acks();
        assert_eq!(acks.get("cc_Test.Control").unwrap().duration_ms, 99);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_ack_keeps_reload_in_flight() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();
        plane.enqueue_reload(request("b1"));
        let message = parse_dispatch(&rx.try_recv().unwrap());

        let mut stale = ack_for(&message, 1);
        stale.id = "r-0-0".into();
        plane.complete_ack(stale);

        // Still in flight: the matching ACK completes it normally.
        plane.complete_ack(ack_for(&message, 2));
        let acks = plane.last_acks();
        assert_eq!(acks.get("cc_Test.Control").unwrap().duration_ms, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn last_acks_snapshot_is_deterministic() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();
        plane.enqueue_reload(request("b1"));
        let message = parse_dispatch(&rx.try_recv().unwrap());
        plane.complete_ack(ack_for(&message, 3));

        let first = serde_json::to_string(&plane.last_acks()).unwrap();
        let second = serde_json::to_string(&plane.last_acks()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn queues_are_independent_per_control() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();

        plane.enqueue_reload(request("b1"));
        let mut other = request("o1");
        other.control_name = "cc_Other.Control".into();
        plane.enqueue_reload(other);

        // Both controls dispatch immediately: one in-flight slot each.
        let first = parse_dispatch(&rx.try_recv().unwrap());
        let second = parse_dispatch(&rx.try_recv().unwrap());
        assert_ne!(first.control_name, second.control_name);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_timeouts_and_clients() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();
        plane.enqueue_reload(request("b1"));
        let _ = rx.try_recv().unwrap();

        plane.close();
        // Sender side is gone.
        assert!(rx.recv().await.is_none());

        // The armed timeout was aborted: no synthesized ACK appears.
        tokio::time::sleep(RELOAD_TIMEOUT + Duration::from_millis(10)).await;
        assert!(plane.last_acks().is_empty());

        // Re-entrant close is a no-op.
        plane.close();
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_ws_frames_complete_acks() {
        let plane = ControlPlane::new("cc_Test.Control");
        let (_client, mut rx) = plane.register_client();
        plane.enqueue_reload(request("b1"));
        let message = parse_dispatch(&rx.try_recv().unwrap());

        // Garbage frames are ignored.
        plane.inbound_text("not json");
        plane.inbound_text(r#"{"type":"pcf-hmr:unknown","payload":{}}"#);

        let frame = json!({
            "type": "pcf-hmr:ack",
            "payload": {
                "id": message.id,
                "controlName": message.control_name,
                "buildId": message.build_id,
                "status": "success",
                "instancesTotal": 2,
                "instancesReloaded": 2,
                "durationMs": 120,
            },
        });
        plane.inbound_text(&frame.to_string());

        let acks = plane.last_acks();
        let ack = acks.get("cc_Test.Control").unwrap();
        assert_eq!(ack.status, AckStatus::Success);
        assert_eq!(ack.instances_reloaded, 2);
    }
}
