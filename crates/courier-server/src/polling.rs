//! HTTP long-polling transport and its session supervisor.
//!
//! Polling clients have no open connection to push to, so their deliver
//! capability buffers pushes in a per-session outbound queue (request
//! replies go to a dedicated slot) and their liveness
//! is an explicit expiry deadline reset on every valid request. A session
//! is ACTIVE until either the client stops polling past the deadline or
//! the process ends; expiry tears it down exactly like a transport close.

use crate::http::AppState;
use crate::metrics;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_core::{generate_polling_token, Broker, Deliver, SessionId};
use courier_protocol::{ConnectResponse, Outbound, RelayError, Request, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Queue = Arc<Mutex<Vec<Outbound>>>;
type ReplySlot = Arc<Mutex<Option<Outbound>>>;

struct PollingSession {
    session_id: SessionId,
    queue: Queue,
    reply: ReplySlot,
    deadline: Instant,
    timer: JoinHandle<()>,
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// A resolved polling session, valid for one request.
pub struct PollingHandle {
    /// The broker session behind the polling token.
    pub session_id: SessionId,
    queue: Queue,
    reply: ReplySlot,
}

impl PollingHandle {
    /// Take the reply to the request the router just dispatched.
    ///
    /// Replies land in a dedicated slot, not the push queue, so a publish
    /// from another session interleaving with the dispatch can never
    /// displace them.
    pub fn take_reply(&self) -> Option<Outbound> {
        lock(&self.reply).take()
    }

    /// Atomically drain the whole push queue, oldest first.
    pub fn drain(&self) -> Vec<Outbound> {
        std::mem::take(&mut *lock(&self.queue))
    }
}

/// Supervises polling sessions: token resolution, outbound queues and the
/// per-session expiry timer.
pub struct PollingSupervisor {
    sessions: Mutex<HashMap<String, PollingSession>>,
    expiry: Duration,
    broker: Arc<Broker>,
}

impl PollingSupervisor {
    /// Create a supervisor over `broker` with the given session expiry.
    #[must_use]
    pub fn new(broker: Arc<Broker>, expiry: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            expiry,
            broker,
        })
    }

    /// Create a new polling session. A token in the query authenticates
    /// the session at connect time.
    pub fn connect(
        self: &Arc<Self>,
        auth_token: Option<&str>,
        source_address: Option<String>,
    ) -> ConnectResponse {
        let queue: Queue = Arc::new(Mutex::new(Vec::new()));
        let reply: ReplySlot = Arc::new(Mutex::new(None));
        let push_sink = Arc::clone(&queue);
        let reply_sink = Arc::clone(&reply);
        let deliver: Deliver = Box::new(move |envelope| match envelope {
            Outbound::Response(_) => *lock(&reply_sink) = Some(envelope),
            Outbound::Push(_) => lock(&push_sink).push(envelope),
        });

        let info = self.broker.create_client(deliver, auth_token, source_address);
        let token = generate_polling_token();
        let deadline = Instant::now() + self.expiry;

        let mut sessions = lock(&self.sessions);
        sessions.insert(
            token.clone(),
            PollingSession {
                session_id: info.session_id,
                queue,
                reply,
                deadline,
                timer: self.arm(token.clone(), deadline),
            },
        );
        metrics::set_polling_sessions(sessions.len());
        drop(sessions);

        info!(session = %info.session_id, identity = %info.identity, "polling session connected");

        ConnectResponse {
            ok: true,
            motd: self.broker.config().motd.clone(),
            uuid: info.identity,
            token,
        }
    }

    /// Resolve a polling token to its session, resetting the expiry
    /// deadline. Returns `None` for unknown or expired tokens, with no
    /// state mutation.
    pub fn touch(self: &Arc<Self>, token: &str) -> Option<PollingHandle> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(token)?;

        session.deadline = Instant::now() + self.expiry;
        session.timer.abort();
        session.timer = self.arm(token.to_string(), session.deadline);

        Some(PollingHandle {
            session_id: session.session_id,
            queue: Arc::clone(&session.queue),
            reply: Arc::clone(&session.reply),
        })
    }

    /// Number of live polling sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn arm(self: &Arc<Self>, token: String, deadline: Instant) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            supervisor.expire(&token);
        })
    }

    fn expire(&self, token: &str) {
        let mut sessions = lock(&self.sessions);
        // An abort from touch() only lands at an await point, so a timer
        // that fired concurrently with a renewal re-checks the deadline.
        match sessions.get(token) {
            None => return,
            Some(session) if Instant::now() < session.deadline => return,
            Some(_) => {}
        }

        let Some(session) = sessions.remove(token) else {
            return;
        };
        metrics::set_polling_sessions(sessions.len());
        drop(sessions);

        debug!(session = %session.session_id, "polling session expired");
        self.broker.destroy_client(session.session_id);
        metrics::set_active_channels(self.broker.stats().channel_count);
    }
}

/// The long-polling HTTP routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/connect", get(connect_handler))
        .route("/open", post(open_handler))
        .route("/close", post(close_handler))
        .route("/send", post(send_handler))
        .route("/auth", post(auth_handler))
        .route("/update", post(update_handler))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

/// Request body for every polling POST.
#[derive(Debug, Deserialize)]
struct PollingBody {
    token: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    channel: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    meta: Option<Value>,
}

impl PollingBody {
    fn request_id(&self) -> i64 {
        self.id.as_ref().and_then(Value::as_i64).unwrap_or(1)
    }

    fn to_request(&self, kind: &'static str) -> Request {
        Request {
            kind: Some(kind.to_string()),
            id: self.id.clone(),
            channel: self.channel.clone(),
            message: self.message.clone(),
            meta: self.meta.clone(),
            token: self.token.clone().map(Value::String),
        }
    }
}

async fn connect_handler(
    Query(query): Query<ConnectQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Json<ConnectResponse> {
    Json(
        state
            .polling
            .connect(query.token.as_deref(), Some(addr.to_string())),
    )
}

async fn open_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PollingBody>,
) -> HttpResponse {
    run_op(&state, &body, "open")
}

async fn close_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PollingBody>,
) -> HttpResponse {
    run_op(&state, &body, "close")
}

async fn send_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PollingBody>,
) -> HttpResponse {
    run_op(&state, &body, "send")
}

async fn auth_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PollingBody>,
) -> HttpResponse {
    run_op(&state, &body, "auth")
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PollingBody>,
) -> HttpResponse {
    let Some(handle) = resolve(&state, &body) else {
        return unauthorized(&body);
    };

    let queue = handle.drain();
    let uuid = state
        .broker
        .identity_of(handle.session_id)
        .unwrap_or_default();

    let mut response = Response::ok(body.request_id(), uuid);
    response.queue = Some(queue);
    Json(response).into_response()
}

/// Run a router operation for a polling session and return the reply the
/// router delivered for it.
fn run_op(state: &Arc<AppState>, body: &PollingBody, kind: &'static str) -> HttpResponse {
    let Some(handle) = resolve(state, body) else {
        return unauthorized(body);
    };

    state
        .broker
        .process_request(handle.session_id, body.to_request(kind));
    metrics::set_active_channels(state.broker.stats().channel_count);
    metrics::record_message("inbound");

    match handle.take_reply() {
        Some(envelope) => Json(envelope).into_response(),
        // The session expired between resolution and dispatch, so the
        // router had nobody to answer.
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": RelayError::InvalidPollingToken.to_string()})),
        )
            .into_response(),
    }
}

fn resolve(state: &Arc<AppState>, body: &PollingBody) -> Option<PollingHandle> {
    state.polling.touch(body.token.as_deref()?)
}

fn unauthorized(body: &PollingBody) -> HttpResponse {
    if body.token.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": RelayError::MissingField.to_string()})),
        )
            .into_response();
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"ok": false, "error": RelayError::InvalidPollingToken.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::BrokerConfig;
    use courier_protocol::{ChannelKey, Push};
    use serde_json::json;

    fn setup(expiry_secs: u64) -> (Arc<Broker>, Arc<PollingSupervisor>) {
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let supervisor =
            PollingSupervisor::new(Arc::clone(&broker), Duration::from_secs(expiry_secs));
        (broker, supervisor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_destroys_session_and_memberships() {
        let (broker, supervisor) = setup(5);

        let connected = supervisor.connect(None, None);
        let handle = supervisor.touch(&connected.token).unwrap();
        broker
            .subscribe(handle.session_id, ChannelKey::from("room1"))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;

        // The session is gone, its token invalid, its memberships released.
        assert!(supervisor.touch(&connected.token).is_none());
        assert_eq!(supervisor.session_count(), 0);
        assert_eq!(broker.stats().client_count, 0);
        assert!(!broker.channel_exists(&ChannelKey::from("room1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_deadline() {
        let (broker, supervisor) = setup(5);
        let connected = supervisor.connect(None, None);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            assert!(supervisor.touch(&connected.token).is_some());
        }
        assert_eq!(broker.stats().client_count, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(supervisor.touch(&connected.token).is_none());
        assert_eq!(broker.stats().client_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_drains_queue_in_order() {
        let (broker, supervisor) = setup(60);

        let connected = supervisor.connect(None, None);
        let handle = supervisor.touch(&connected.token).unwrap();
        broker
            .subscribe(handle.session_id, ChannelKey::from("room1"))
            .unwrap();

        let publisher = broker.create_client(Box::new(|_| {}), None, None);
        broker
            .publish(publisher.session_id, "room1".into(), json!(1), None)
            .unwrap();
        broker
            .publish(publisher.session_id, "room1".into(), json!(2), None)
            .unwrap();

        let drained = handle.drain();
        assert_eq!(drained.len(), 2);
        let payloads: Vec<&Value> = drained
            .iter()
            .map(|envelope| match envelope {
                Outbound::Push(Push::Message { message, .. }) => message,
                other => panic!("expected message push, got {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec![&json!(1), &json!(2)]);

        // Atomic: the queue is empty immediately afterwards.
        assert!(handle.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_op_reply_lands_in_slot_not_queue() {
        let (broker, supervisor) = setup(60);

        let connected = supervisor.connect(None, None);
        let handle = supervisor.touch(&connected.token).unwrap();

        broker.process_request(
            handle.session_id,
            serde_json::from_value(json!({"type": "open", "channel": "room1", "id": 6})).unwrap(),
        );

        match handle.take_reply() {
            Some(Outbound::Response(response)) => {
                assert!(response.ok);
                assert_eq!(response.id, 6);
            }
            other => panic!("expected response, got {other:?}"),
        }
        // Taken exactly once, and not visible to the next update.
        assert!(handle.take_reply().is_none());
        assert!(handle.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_not_displaced_by_interleaved_publish() {
        let (broker, supervisor) = setup(60);

        let connected = supervisor.connect(None, None);
        let handle = supervisor.touch(&connected.token).unwrap();
        broker
            .subscribe(handle.session_id, ChannelKey::from("room1"))
            .unwrap();

        broker.process_request(
            handle.session_id,
            serde_json::from_value(json!({"type": "send", "channel": "room1", "id": 8})).unwrap(),
        );

        // A publish from another session lands before the reply is taken.
        let publisher = broker.create_client(Box::new(|_| {}), None, None);
        broker
            .publish(
                publisher.session_id,
                "room1".into(),
                json!("interleaved"),
                None,
            )
            .unwrap();

        // The HTTP reply is still the response to the send, and the
        // interleaved push stays queued for the next update.
        match handle.take_reply() {
            Some(Outbound::Response(response)) => {
                assert!(response.ok);
                assert_eq!(response.id, 8);
            }
            other => panic!("expected response, got {other:?}"),
        }
        let queued = handle.drain();
        assert_eq!(queued.len(), 1);
        match &queued[0] {
            Outbound::Push(Push::Message { message, .. }) => {
                assert_eq!(*message, json!("interleaved"));
            }
            other => panic!("expected message push, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_op_on_destroyed_session_yields_no_reply() {
        let (broker, supervisor) = setup(60);

        let connected = supervisor.connect(None, None);
        let handle = supervisor.touch(&connected.token).unwrap();
        broker.destroy_client(handle.session_id);

        broker.process_request(
            handle.session_id,
            serde_json::from_value(json!({"type": "ping"})).unwrap(),
        );
        assert!(handle.take_reply().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_token_authenticates() {
        let (_broker, supervisor) = setup(60);

        let connected = supervisor.connect(Some("t1"), None);
        assert_eq!(connected.uuid, courier_core::derive_identity("t1"));
        assert!(connected.token.starts_with('$'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_token_is_rejected_without_mutation() {
        let (broker, supervisor) = setup(60);
        let _connected = supervisor.connect(None, None);

        assert!(supervisor.touch("$bogus").is_none());
        assert_eq!(supervisor.session_count(), 1);
        assert_eq!(broker.stats().client_count, 1);
    }
}
