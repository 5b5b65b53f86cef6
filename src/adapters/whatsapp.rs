use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::agents::types::{
    now_ms, prefixed_message_id, AccountInfo, AdapterEvent, AuthPromptKind, Direction, MediaRef,
    MessageKind, Platform, SendCommand, SendReceipt, UnifiedMessage,
};
use crate::adapters::{classify_http_error, ChatSendGate, PlatformAdapter, SendPause};
use crate::media::{MediaBlob, MediaCache};
use crate::utils::HubError;

/// WhatsApp Web transport behind a session gateway (WAHA-style HTTP API).
///
/// The gateway owns the actual WhatsApp Web protocol; this adapter drives its
/// session lifecycle, relays the QR handshake upward and long-polls the event
/// feed. Auth state lives gateway-side, so `submit_auth_value` never applies.
pub struct WhatsAppAdapter {
    agent_id: String,
    base_url: String,
    session: String,
    http: reqwest::Client,
    media: Arc<MediaCache>,
    send_gate: ChatSendGate,
    send_pause: SendPause,
    event_queue: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl WhatsAppAdapter {
    pub fn new(
        agent_id: &str,
        transport_config: &Value,
        media: Arc<MediaCache>,
        event_queue: usize,
    ) -> Result<Self, HubError> {
        let base_url = transport_config
            .get("gatewayUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("whatsapp config requires 'gatewayUrl'".into()))?
            .trim_end_matches('/')
            .to_string();
        let session = transport_config
            .get("session")
            .and_then(|v| v.as_str())
            .unwrap_or(agent_id)
            .to_string();

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = transport_config.get("apiKey").and_then(|v| v.as_str()) {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(api_key) {
                headers.insert("X-Api-Key", value);
            }
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(40))
            .build()
            .map_err(|e| HubError::Fatal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            agent_id: agent_id.to_string(),
            base_url,
            session,
            http,
            media,
            send_gate: ChatSendGate::new(),
            send_pause: SendPause::new(),
            event_queue,
            shutdown: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/sessions/{}/{}", self.base_url, self.session, path)
    }

    async fn get_json(&self, path: &str) -> Result<Value, HubError> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| classify_http_error("whatsapp gateway", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("whatsapp gateway", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("whatsapp gateway body", &e))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, HubError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| classify_http_error("whatsapp gateway", &e))?;

        if response.status().as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5_000);
            self.send_pause
                .pause_for(Duration::from_millis(retry_after_ms))
                .await;
            return Err(HubError::Busy { retry_after_ms });
        }

        let response = response
            .error_for_status()
            .map_err(|e| classify_http_error("whatsapp gateway", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("whatsapp gateway body", &e))
    }

    async fn bringup_loop(
        adapter: Arc<WhatsAppGatewayClient>,
        agent_id: String,
        tx: mpsc::Sender<AdapterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut announced_ready = false;
        let mut last_qr: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let status = match adapter.status().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "WhatsApp status poll failed");
                    let _ = tx
                        .send(AdapterEvent::Disconnected {
                            reason: e.to_string(),
                            recoverable: e.is_transient(),
                        })
                        .await;
                    return;
                }
            };

            let phase = status.get("status").and_then(|v| v.as_str()).unwrap_or("");
            match phase {
                "SCAN_QR" => {
                    if let Ok(qr) = adapter.qr().await {
                        if last_qr.as_deref() != Some(qr.as_str()) {
                            let bytes = general_purpose::STANDARD
                                .decode(&qr)
                                .unwrap_or_else(|_| qr.clone().into_bytes());
                            if tx.send(AdapterEvent::QrIssued { bytes }).await.is_err() {
                                return;
                            }
                            last_qr = Some(qr);
                        }
                    }
                }
                "WORKING" => {
                    if !announced_ready {
                        let info = AccountInfo {
                            account_id: status
                                .pointer("/me/id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            username: None,
                            display_name: status
                                .pointer("/me/pushName")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                        };
                        info!(agent_id = %agent_id, account = %info.account_id,
                              "WhatsApp session authenticated");
                        let _ = tx.send(AdapterEvent::Authenticated { info: info.clone() }).await;
                        let _ = tx.send(AdapterEvent::Ready { info }).await;
                        announced_ready = true;
                        last_qr = None;
                    }

                    // Session is live: drain the event feed until it breaks.
                    if !Self::event_loop(&adapter, &agent_id, &tx, &mut shutdown).await {
                        return;
                    }
                    announced_ready = false;
                }
                "FAILED" => {
                    let _ = tx
                        .send(AdapterEvent::Disconnected {
                            reason: "gateway reported session failure".into(),
                            recoverable: false,
                        })
                        .await;
                    return;
                }
                other => {
                    debug!(agent_id = %agent_id, phase = %other, "WhatsApp session starting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Long-poll the gateway event feed. Returns false when the caller should
    /// stop entirely, true to fall back into status polling.
    async fn event_loop(
        adapter: &WhatsAppGatewayClient,
        agent_id: &str,
        tx: &mpsc::Sender<AdapterEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut consecutive_errors: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return false;
            }

            let events = tokio::select! {
                r = adapter.events() => r,
                _ = shutdown.changed() => continue,
            };

            match events {
                Ok(events) => {
                    consecutive_errors = 0;
                    for event in events {
                        match normalize_gateway_event(agent_id, &event) {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    return false;
                                }
                            }
                            None => {
                                warn!(agent_id = %agent_id, "Dropped malformed gateway event");
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(agent_id = %agent_id, error = %e, consecutive_errors,
                          "WhatsApp event poll failed");
                    if consecutive_errors >= 5 {
                        // Fall back to status polling; a dead session is
                        // reported from there.
                        return true;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

/// Thin, clonable view over the gateway endpoints used by the background
/// tasks.
struct WhatsAppGatewayClient {
    http: reqwest::Client,
    base_url: String,
    session: String,
}

impl WhatsAppGatewayClient {
    fn url(&self, path: &str) -> String {
        format!("{}/api/sessions/{}/{}", self.base_url, self.session, path)
    }

    async fn status(&self) -> Result<Value, HubError> {
        let response = self
            .http
            .get(self.url("status"))
            .send()
            .await
            .map_err(|e| classify_http_error("whatsapp status", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("whatsapp status", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("whatsapp status body", &e))
    }

    async fn qr(&self) -> Result<String, HubError> {
        let response = self
            .http
            .get(self.url("qr"))
            .send()
            .await
            .map_err(|e| classify_http_error("whatsapp qr", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("whatsapp qr", &e))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| classify_http_error("whatsapp qr body", &e))?;
        value
            .get("qr")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| HubError::Transient("gateway returned empty qr".into()))
    }

    async fn events(&self) -> Result<Vec<Value>, HubError> {
        let response = self
            .http
            .get(format!("{}?timeout=25", self.url("events")))
            .send()
            .await
            .map_err(|e| classify_http_error("whatsapp events", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("whatsapp events", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("whatsapp events body", &e))
    }
}

#[async_trait]
impl PlatformAdapter for WhatsAppAdapter {
    fn platform(&self) -> Platform {
        Platform::Whatsapp
    }

    async fn initialize(&self) -> Result<mpsc::Receiver<AdapterEvent>, HubError> {
        self.post_json("start", &json!({})).await?;

        let (tx, rx) = mpsc::channel(self.event_queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let client = Arc::new(WhatsAppGatewayClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            session: self.session.clone(),
        });
        let agent_id = self.agent_id.clone();
        tokio::spawn(async move {
            Self::bringup_loop(client, agent_id, tx, shutdown_rx).await;
        });

        Ok(rx)
    }

    async fn submit_auth_value(&self, _kind: AuthPromptKind, _value: &str) -> Result<(), HubError> {
        // QR bring-up happens on the paired phone, not through a prompt.
        Err(HubError::NoPromptPending(self.agent_id.clone()))
    }

    async fn send(&self, command: SendCommand) -> Result<SendReceipt, HubError> {
        let _guard = self.send_gate.acquire(command.chat_id()).await;
        self.send_pause.wait_if_paused().await;

        let (path, body) = match &command {
            SendCommand::Text { chat_id, body, reply_to } => (
                "messages/text",
                json!({"chatId": chat_id, "text": body, "replyTo": reply_to.as_ref().map(|r| native_id(r))}),
            ),
            SendCommand::Media {
                chat_id,
                media_key,
                mime_type,
                caption,
                file_name,
            } => {
                self.media.pin(&self.agent_id, media_key).await;
                let blob = self.media.get(&self.agent_id, media_key).await.ok().flatten();
                let result = match blob {
                    Some(blob) => Ok(json!({
                        "chatId": chat_id,
                        "mimeType": mime_type,
                        "dataBase64": general_purpose::STANDARD.encode(&blob.bytes),
                        "fileName": file_name.clone().or(blob.original_name),
                        "caption": caption,
                    })),
                    None => Err(HubError::Validation(format!(
                        "media key {} not in cache",
                        media_key
                    ))),
                };
                self.media.unpin(&self.agent_id, media_key).await;
                ("messages/media", result?)
            }
            SendCommand::Location {
                chat_id,
                latitude,
                longitude,
                name,
            } => (
                "messages/location",
                json!({"chatId": chat_id, "latitude": latitude, "longitude": longitude, "name": name}),
            ),
            SendCommand::Contact { chat_id, name, phone } => (
                "messages/contact",
                json!({"chatId": chat_id, "name": name, "phone": phone}),
            ),
            SendCommand::Buttons { chat_id, body, buttons } => (
                "messages/buttons",
                json!({"chatId": chat_id, "text": body, "buttons": buttons}),
            ),
            SendCommand::Poll {
                chat_id,
                question,
                options,
            } => (
                "messages/poll",
                json!({"chatId": chat_id, "question": question, "options": options}),
            ),
            SendCommand::Reaction {
                chat_id,
                message_id,
                emoji,
            } => (
                "messages/reaction",
                json!({"chatId": chat_id, "messageId": native_id(message_id), "emoji": emoji}),
            ),
            SendCommand::Forward {
                chat_id,
                from_chat_id,
                message_id,
            } => (
                "messages/forward",
                json!({"chatId": chat_id, "fromChatId": from_chat_id, "messageId": native_id(message_id)}),
            ),
            SendCommand::Edit {
                chat_id,
                message_id,
                body,
            } => (
                "messages/edit",
                json!({"chatId": chat_id, "messageId": native_id(message_id), "text": body}),
            ),
            SendCommand::Delete { chat_id, message_id } => (
                "messages/delete",
                json!({"chatId": chat_id, "messageId": native_id(message_id)}),
            ),
        };

        let response = self.post_json(path, &body).await?;
        let platform_message_id = response
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(SendReceipt {
            platform_message_id,
            sent_at: now_ms(),
        })
    }

    async fn download_media(&self, media_ref: &MediaRef) -> Result<MediaBlob, HubError> {
        let native = native_id(&media_ref.message_id);
        let response = self
            .http
            .get(self.url(&format!("media/{}", native)))
            .send()
            .await
            .map_err(|e| classify_http_error("whatsapp media", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("whatsapp media", &e))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_http_error("whatsapp media body", &e))?;

        Ok(MediaBlob {
            bytes: bytes.to_vec(),
            mime_type,
            original_name: media_ref
                .meta
                .get("fileName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }

    async fn shutdown(&self, reason: &str) -> Result<(), HubError> {
        info!(agent_id = %self.agent_id, reason = %reason, "WhatsApp adapter shutting down");
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        // Stop the gateway session but keep its pairing state for reconnects.
        let _ = self.post_json("stop", &json!({})).await;
        Ok(())
    }
}

fn native_id(unified_id: &str) -> &str {
    unified_id.strip_prefix("wa:").unwrap_or(unified_id)
}

/// Normalize one gateway event. Returns `None` for malformed payloads, which
/// are dropped with a warning rather than crashing the adapter.
fn normalize_gateway_event(agent_id: &str, event: &Value) -> Option<AdapterEvent> {
    let event_type = event.get("type")?.as_str()?;
    let payload = event.get("payload")?;

    match event_type {
        "message" => {
            let native_id = payload.get("id")?.as_str()?;
            let chat_id = payload.get("from")?.as_str()?;
            let kind = MessageKind::parse(
                payload.get("type").and_then(|v| v.as_str()).unwrap_or("text"),
            );
            let has_media = payload
                .get("hasMedia")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            Some(AdapterEvent::InboundMessage(UnifiedMessage {
                id: prefixed_message_id(Platform::Whatsapp, native_id),
                agent_id: agent_id.to_string(),
                platform: Platform::Whatsapp,
                direction: Direction::Inbound,
                chat_id: chat_id.to_string(),
                sender_id: payload
                    .get("author")
                    .and_then(|v| v.as_str())
                    .unwrap_or(chat_id)
                    .to_string(),
                sender_name: payload
                    .get("pushName")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                body: payload
                    .get("body")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                timestamp: payload
                    .get("timestamp")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(now_ms),
                kind,
                has_media,
                from_me: payload
                    .get("fromMe")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                reply_to: payload
                    .get("replyTo")
                    .and_then(|v| v.as_str())
                    .map(|r| prefixed_message_id(Platform::Whatsapp, r)),
                meta: json!({
                    "mimeType": payload.get("mimeType"),
                    "fileName": payload.get("fileName"),
                }),
            }))
        }
        "message.edited" => Some(AdapterEvent::MessageEdited {
            message_id: prefixed_message_id(Platform::Whatsapp, payload.get("id")?.as_str()?),
            chat_id: payload.get("from")?.as_str()?.to_string(),
            new_body: payload
                .get("body")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            edited_at: payload
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(now_ms),
        }),
        "message.deleted" => Some(AdapterEvent::MessageDeleted {
            message_id: prefixed_message_id(Platform::Whatsapp, payload.get("id")?.as_str()?),
            chat_id: payload.get("from")?.as_str()?.to_string(),
        }),
        "typing" => Some(AdapterEvent::Typing {
            chat_id: payload.get("from")?.as_str()?.to_string(),
            sender_id: payload
                .get("author")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        other => {
            debug!(event_type = %other, "Ignoring unsupported gateway event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_inbound_message() {
        let event = json!({
            "type": "message",
            "payload": {
                "id": "3EB0538DA65",
                "from": "123@c.us",
                "pushName": "Alice",
                "body": "hello world",
                "type": "text",
                "timestamp": 1700000000000i64,
                "fromMe": false
            }
        });

        let normalized = normalize_gateway_event("agent-1", &event).unwrap();
        match normalized {
            AdapterEvent::InboundMessage(msg) => {
                assert_eq!(msg.id, "wa:3EB0538DA65");
                assert_eq!(msg.chat_id, "123@c.us");
                assert_eq!(msg.sender_name, "Alice");
                assert_eq!(msg.kind, MessageKind::Text);
                assert!(!msg.from_me);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn normalizing_twice_is_deterministic() {
        let event = json!({
            "type": "message",
            "payload": {
                "id": "X1",
                "from": "5@c.us",
                "body": "hi",
                "type": "text",
                "timestamp": 1700000000001i64
            }
        });

        let a = normalize_gateway_event("agent-1", &event);
        let b = normalize_gateway_event("agent-1", &event);
        match (a, b) {
            (Some(AdapterEvent::InboundMessage(m1)), Some(AdapterEvent::InboundMessage(m2))) => {
                assert_eq!(m1, m2)
            }
            _ => panic!("expected inbound messages"),
        }
    }

    #[test]
    fn malformed_event_is_dropped() {
        let event = json!({"type": "message", "payload": {"body": "no id or chat"}});
        assert!(normalize_gateway_event("agent-1", &event).is_none());
    }

    #[test]
    fn unknown_media_kind_degrades() {
        let event = json!({
            "type": "message",
            "payload": {
                "id": "m2",
                "from": "9@c.us",
                "type": "hologram",
                "timestamp": 1i64
            }
        });
        match normalize_gateway_event("agent-1", &event).unwrap() {
            AdapterEvent::InboundMessage(msg) => assert_eq!(msg.kind, MessageKind::Unknown),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
