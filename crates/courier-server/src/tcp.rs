//! Raw TCP transport: newline-delimited JSON frames over a plain socket.

use crate::http::AppState;
use crate::metrics::{self, ConnectionGuard};
use courier_core::Deliver;
use courier_protocol::{Outbound, Push};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Run the TCP accept loop until it fails.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn run_tcp_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.tcp_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("TCP server listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_tcp(stream, peer, state).await;
                });
            }
            Err(error) => {
                warn!(%error, "TCP accept failed");
            }
        }
    }
}

async fn handle_tcp(stream: TcpStream, peer: SocketAddr, state: Arc<AppState>) {
    let _guard = ConnectionGuard::new("tcp");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let deliver: Deliver = {
        let out_tx = out_tx.clone();
        Box::new(move |envelope| {
            let _ = out_tx.send(envelope);
        })
    };

    let info = state
        .broker
        .create_client(deliver, None, Some(peer.to_string()));
    info!(session = %info.session_id, identity = %info.identity, %peer, "tcp connected");

    let _ = out_tx.send(Outbound::Push(Push::Motd {
        motd: state.broker.config().motd.clone(),
        uuid: info.identity.clone(),
    }));

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut ping = tokio::time::interval(Duration::from_secs(
        state.config.heartbeat.ping_interval_secs,
    ));
    ping.tick().await;

    loop {
        tokio::select! {
            Some(envelope) = out_rx.recv() => {
                match serde_json::to_vec(&envelope) {
                    Ok(mut bytes) => {
                        bytes.push(b'\n');
                        metrics::record_message("outbound");
                        if writer.write_all(&bytes).await.is_err() {
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
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        metrics::record_message("inbound");
                        state.broker.process_frame(info.session_id, line);
                        metrics::set_active_channels(state.broker.stats().channel_count);
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(session = %info.session_id, %error, "tcp read failed");
                        break;
                    }
                }
            }
        }
    }

    state.broker.destroy_client(info.session_id);
    metrics::set_active_channels(state.broker.stats().channel_count);
    info!(session = %info.session_id, "tcp disconnected");
}
