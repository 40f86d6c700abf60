//! HTTP surface: health endpoint, WebSocket transport and mounting point
//! for the long-polling routes.

use crate::config::Config;
use crate::metrics::{self, ConnectionGuard};
use crate::polling::{self, PollingSupervisor};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use courier_core::{Broker, Deliver};
use courier_protocol::{Outbound, Push, RelayError, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared state for every HTTP handler.
pub struct AppState {
    /// The broker all transports feed into.
    pub broker: Arc<Broker>,
    /// Long-polling session supervisor.
    pub polling: Arc<PollingSupervisor>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP server until it fails.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server exits.
pub async fn run_http_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.http_addr()?;
    let mut router = Router::new().route("/health", get(health_handler));

    if state.config.transport.websocket {
        router = router.route(&state.config.transport.websocket_path, get(ws_handler));
    }
    if state.config.transport.polling {
        router = router.merge(polling::routes());
    }

    let router = router.with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": stats.client_count,
        "channels": stats.channel_count,
        "subscriptions": stats.total_subscriptions,
        "polling_sessions": state.polling.session_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let _guard = ConnectionGuard::new("websocket");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let deliver: Deliver = {
        let out_tx = out_tx.clone();
        // A send after the socket task exits just drops the envelope.
        Box::new(move |envelope| {
            let _ = out_tx.send(envelope);
        })
    };

    let info = state
        .broker
        .create_client(deliver, None, Some(addr.to_string()));
    info!(session = %info.session_id, identity = %info.identity, %addr, "websocket connected");

    let _ = out_tx.send(Outbound::Push(Push::Motd {
        motd: state.broker.config().motd.clone(),
        uuid: info.identity.clone(),
    }));

    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval(Duration::from_secs(
        state.config.heartbeat.ping_interval_secs,
    ));
    ping.tick().await;

    loop {
        tokio::select! {
            Some(envelope) = out_rx.recv() => {
                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        metrics::record_message("outbound");
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(session = %info.session_id, %error, "envelope encode failed"),
                }
            }
            _ = ping.tick() => {
                let Some(uuid) = state.broker.identity_of(info.session_id) else {
                    break;
                };
                let _ = out_tx.send(Outbound::Push(Push::Ping { uuid }));
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message("inbound");
                        state.broker.process_frame(info.session_id, &text);
                        metrics::set_active_channels(state.broker.stats().channel_count);
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            metrics::record_message("inbound");
                            state.broker.process_frame(info.session_id, text);
                            metrics::set_active_channels(state.broker.stats().channel_count);
                        }
                        Err(_) => {
                            metrics::record_error("invalid_format");
                            let _ = out_tx.send(Outbound::Response(Response::err(
                                1,
                                state
                                    .broker
                                    .identity_of(info.session_id)
                                    .unwrap_or_default(),
                                RelayError::InvalidFormat,
                            )));
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        debug!(session = %info.session_id, %error, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.broker.destroy_client(info.session_id);
    metrics::set_active_channels(state.broker.stats().channel_count);
    info!(session = %info.session_id, "websocket disconnected");
}
