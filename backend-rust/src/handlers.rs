use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use grading_types::{DashboardCommand, DashboardMessage, DeviceMessage, IngestReply};
use serde_json::{json, Value};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::ingest;
use crate::state::SharedState;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, msg: &T) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("unserialisable outbound message: {e}");
            true
        }
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "devices": state.connected_devices().await,
        "clients": state.broadcaster.client_count().await,
    }))
}

// ─── Device endpoint (/device) ───────────────────────────────────────────────

pub async fn device_ws(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_device(socket, state))
}

/// Wait for `identify`; anything else (or nothing in time) closes the socket.
async fn await_identify(socket: &mut WebSocket, limit: Duration) -> Option<grading_types::DeviceIdentity> {
    loop {
        let frame = match timeout(limit, socket.recv()).await {
            Err(_) => {
                warn!("Device did not identify within {}s", limit.as_secs());
                return None;
            }
            Ok(None) | Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => {
                return match serde_json::from_str::<DeviceMessage>(&text) {
                    Ok(DeviceMessage::Identify { identity }) if !identity.device_id.trim().is_empty() => Some(identity),
                    Ok(_) => {
                        warn!("Device sent a message before identify, closing");
                        None
                    }
                    Err(e) => {
                        debug!("malformed identify: {e}");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

async fn handle_device(mut socket: WebSocket, state: SharedState) {
    let limit = Duration::from_secs(state.config.identify_timeout_s);
    let Some(identity) = await_identify(&mut socket, limit).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let device_id = identity.device_id.clone();
    let welcome = ingest::register_device(&state, identity).await;
    if !send_json(&mut socket, &welcome).await {
        ingest::mark_disconnected(&state, &device_id).await;
        return;
    }

    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let reply: Option<IngestReply> = match serde_json::from_str::<DeviceMessage>(&text) {
            Ok(msg) => ingest::handle_device_message(&state, &device_id, msg).await,
            Err(e) => {
                debug!("Device {device_id}: malformed frame: {e}");
                ingest::nack_unparseable(&text, &e)
            }
        };
        if let Some(reply) = reply {
            if !send_json(&mut socket, &reply).await {
                break;
            }
        }
    }
    ingest::mark_disconnected(&state, &device_id).await;
}

// ─── Dashboard endpoint (/ws) ────────────────────────────────────────────────

pub async fn dashboard_ws(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_dashboard(socket, state))
}

async fn handle_dashboard(mut socket: WebSocket, state: SharedState) {
    let (client_id, mut outbound) = state.broadcaster.register().await;

    // Current state immediately on connect
    let latest = state.latest.read().await.overall.clone().map(Box::new);
    if !send_json(&mut socket, &DashboardMessage::LatestSample { record: latest }).await {
        state.broadcaster.deregister(&client_id).await;
        return;
    }

    let idle = Duration::from_secs(state.config.client_idle_timeout_s);
    let mut deadline = Instant::now() + idle;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // Relay fan-out frames; None means the broadcaster pruned us
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            // Commands from the dashboard
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {
                        deadline = Instant::now() + idle;
                        awaiting_pong = false;
                        continue;
                    }
                };
                deadline = Instant::now() + idle;
                awaiting_pong = false;
                match serde_json::from_str::<DashboardCommand>(&text) {
                    Ok(DashboardCommand::Heartbeat) | Ok(DashboardCommand::Ping) => {
                        if !send_json(&mut socket, &DashboardMessage::Pong).await {
                            break;
                        }
                    }
                    Ok(DashboardCommand::Pong) => {}
                    Ok(DashboardCommand::Subscribe { filters }) => {
                        info!("Dashboard client {client_id} subscribed: {filters:?}");
                        state.broadcaster.update_filter(&client_id, Some(filters)).await;
                    }
                    Ok(DashboardCommand::Unsubscribe) => {
                        state.broadcaster.update_filter(&client_id, None).await;
                    }
                    Err(e) => debug!("Dashboard client {client_id}: unknown command: {e}"),
                }
            }
            // Keep-alive: ping after idle, drop if the ping goes unanswered
            _ = sleep_until(deadline) => {
                if awaiting_pong {
                    warn!("Dashboard client {client_id} timed out");
                    break;
                }
                if !send_json(&mut socket, &DashboardMessage::Ping).await {
                    break;
                }
                awaiting_pong = true;
                deadline = Instant::now() + idle;
            }
        }
    }

    state.broadcaster.deregister(&client_id).await;
}
