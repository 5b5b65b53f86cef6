use std::convert::Infallible;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

use crate::agents::types::AuthPromptKind;
use crate::agents::AgentRegistry;
use crate::hub::{AgentSnapshot, Envelope, HubFrame, SubscriptionFilters, SubscriptionHub};
use crate::storage::Persistence;

/// State shared by every subscriber connection.
pub struct WsState {
    pub hub: Arc<SubscriptionHub>,
    pub registry: Arc<AgentRegistry>,
    pub persistence: Arc<Persistence>,
    pub snapshot_message_count: usize,
}

pub fn ws_route(
    state: Arc<WsState>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::path!("ws")
        .and(warp::ws())
        .and(warp::any().map(move || state.clone()))
        .map(|ws: warp::ws::Ws, state: Arc<WsState>| {
            ws.on_upgrade(move |socket| handle_connection(socket, state))
        })
}

async fn handle_connection(socket: WebSocket, state: Arc<WsState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer task; control replies and hub envelopes share it.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Tenant binding is fixed by the first subscribe frame.
    let mut tenant: Option<String> = None;
    let mut subscriber_id: Option<String> = None;
    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Subscriber socket error");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        let Ok(text) = frame.to_str() else { continue };
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            let _ = send_json(&out_tx, &json!({"frame": "error", "error": "bad frame"})).await;
            continue;
        };

        match value.get("type").and_then(|v| v.as_str()) {
            Some("subscribe") => {
                if subscriber_id.is_some() {
                    let _ = send_json(
                        &out_tx,
                        &json!({"frame": "error", "error": "already subscribed"}),
                    )
                    .await;
                    continue;
                }
                let Some(requested) = value.get("tenant").and_then(|v| v.as_str()) else {
                    let _ = send_json(
                        &out_tx,
                        &json!({"frame": "error", "error": "subscribe needs tenant"}),
                    )
                    .await;
                    continue;
                };
                let filters = SubscriptionFilters {
                    patterns: value
                        .get("filters")
                        .and_then(|v| v.as_array())
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                .collect()
                        })
                        .unwrap_or_default(),
                };

                let (id, rx) = state.hub.subscribe(requested, filters).await;
                tenant = Some(requested.to_string());
                subscriber_id = Some(id);

                // Initial snapshot: current statuses plus recent messages.
                let snapshot = build_snapshot(&state, requested).await;
                let _ = send_json(
                    &out_tx,
                    &serde_json::to_value(&HubFrame::Snapshot { agents: snapshot })
                        .unwrap_or(json!({})),
                )
                .await;

                forwarder = Some(spawn_forwarder(rx, out_tx.clone()));
                info!(tenant = %requested, "Subscriber attached");
            }
            Some("unsubscribe") => {
                if let Some(id) = subscriber_id.take() {
                    state.hub.unsubscribe(&id).await;
                }
                if let Some(task) = forwarder.take() {
                    task.abort();
                }
                tenant = None;
            }
            Some("authSubmit") => {
                let Some(bound_tenant) = tenant.as_deref() else {
                    let _ = send_json(
                        &out_tx,
                        &json!({"frame": "error", "error": "subscribe first"}),
                    )
                    .await;
                    continue;
                };
                let agent_id = value.get("agentId").and_then(|v| v.as_str()).unwrap_or("");
                let kind = value
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .and_then(AuthPromptKind::parse);
                let auth_value = value.get("value").and_then(|v| v.as_str()).unwrap_or("");

                let outcome = match kind {
                    Some(kind) => match state.registry.get(bound_tenant, agent_id).await {
                        Ok(handle) => handle.submit_auth(kind, auth_value).await,
                        Err(e) => Err(e),
                    },
                    None => Err(crate::utils::HubError::Validation(
                        "unknown auth kind".into(),
                    )),
                };
                let reply = match outcome {
                    Ok(()) => json!({"frame": "authAccepted", "agentId": agent_id}),
                    Err(e) => json!({
                        "frame": "error",
                        "agentId": agent_id,
                        "error": e.to_string(),
                        "code": e.code(),
                    }),
                };
                let _ = send_json(&out_tx, &reply).await;
            }
            Some("ping") => {
                let _ = send_json(
                    &out_tx,
                    &serde_json::to_value(&HubFrame::Pong).unwrap_or(json!({})),
                )
                .await;
            }
            other => {
                warn!(frame = ?other, "Unknown subscriber frame");
                let _ = send_json(
                    &out_tx,
                    &json!({"frame": "error", "error": "unknown frame type"}),
                )
                .await;
            }
        }
    }

    if let Some(id) = subscriber_id {
        state.hub.unsubscribe(&id).await;
    }
    if let Some(task) = forwarder {
        task.abort();
    }
    writer.abort();
    debug!("Subscriber connection closed");
}

fn spawn_forwarder(
    mut rx: mpsc::Receiver<Envelope>,
    out_tx: mpsc::Sender<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    if out_tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize envelope"),
            }
        }
    })
}

async fn build_snapshot(state: &Arc<WsState>, tenant: &str) -> Vec<AgentSnapshot> {
    let mut snapshots = Vec::new();
    for handle in state.registry.list(tenant).await {
        let Ok(status) = handle.status().await else {
            continue;
        };
        let recent = state
            .persistence
            .recent_messages_by_chat(&handle.agent_id, 10, state.snapshot_message_count)
            .await
            .unwrap_or_default();
        snapshots.push(AgentSnapshot {
            agent_id: handle.agent_id.clone(),
            state: status.record.state,
            recent_messages: recent,
        });
    }
    snapshots
}

async fn send_json(out_tx: &mpsc::Sender<Message>, value: &Value) -> Result<(), Infallible> {
    let _ = out_tx.send(Message::text(value.to_string())).await;
    Ok(())
}
