use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use murmur_types::events::GatewayEvent;

use crate::auth::AuthService;
use crate::dispatcher::Dispatcher;
use crate::session::{Flow, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_HEARTBEATS: u8 = 2;

/// A connection that has not joined within this window is closed.
pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer gets to flush queued events after the reader is done.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drive one WebSocket until either side goes away.
///
/// The writer task drains the session's outbound queue and owns the
/// heartbeat. The reader runs inline and feeds text frames to the session.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    auth: Arc<dyn AuthService>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let mut session = Session::new(dispatcher, auth, tx);
    let conn_id = session.id();

    debug!(%conn_id, "WebSocket connected");

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(%conn_id, error = %e, "Failed to encode event, skipping");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                            warn!(%conn_id, "Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sender.close().await;
    });

    let mut identify_deadline = pin!(tokio::time::sleep(IDENTIFY_TIMEOUT));
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut send_task => {
                writer_done = true;
                break;
            }
            _ = &mut identify_deadline, if !session.is_joined() => {
                warn!(%conn_id, "Client failed to identify in time, closing");
                break;
            }
            frame = receiver.next() => {
                let Some(Ok(msg)) = frame else { break };
                match msg {
                    Message::Text(text) => {
                        if session.handle_text(text.as_str()).await == Flow::Close {
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        pong_received.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        debug!(%conn_id, "Ignoring binary frame");
                    }
                    Message::Ping(_) => {}
                }
            }
        }
    }

    // Leave the registry first so nothing is queued for a dead connection,
    // then drop the last sender so the writer drains and exits.
    session.close().await;
    drop(session);

    if !writer_done && tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    info!(%conn_id, "WebSocket disconnected");
}
