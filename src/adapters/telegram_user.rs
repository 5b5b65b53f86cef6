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

/// User-account transport behind an MTProto bridge (tdlib-style HTTP facade).
///
/// Bring-up is interactive: the bridge walks `waitPhone → waitCode →
/// waitPassword → authorized` and each wait state surfaces as an auth prompt
/// event; the admin surface answers through `submit_auth_value`.
pub struct TelegramUserAdapter {
    agent_id: String,
    base_url: String,
    api_id: i64,
    api_hash: String,
    phone: Option<String>,
    http: reqwest::Client,
    media: Arc<MediaCache>,
    send_gate: ChatSendGate,
    send_pause: SendPause,
    event_queue: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    /// Prompt currently open on the bridge, if any.
    pending_prompt: Arc<Mutex<Option<AuthPromptKind>>>,
    /// Last accepted submission; re-submitting it is a no-op, not an error.
    last_accepted: Arc<Mutex<Option<(AuthPromptKind, String)>>>,
}

impl TelegramUserAdapter {
    pub fn new(
        agent_id: &str,
        transport_config: &Value,
        media: Arc<MediaCache>,
        event_queue: usize,
    ) -> Result<Self, HubError> {
        let base_url = transport_config
            .get("bridgeUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("telegram-user config requires 'bridgeUrl'".into()))?
            .trim_end_matches('/')
            .to_string();
        let api_id = transport_config
            .get("apiId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HubError::Validation("telegram-user config requires 'apiId'".into()))?;
        let api_hash = transport_config
            .get("apiHash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("telegram-user config requires 'apiHash'".into()))?
            .to_string();
        let phone = transport_config
            .get("phone")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(40))
            .build()
            .map_err(|e| HubError::Fatal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            agent_id: agent_id.to_string(),
            base_url,
            api_id,
            api_hash,
            phone,
            http,
            media,
            send_gate: ChatSendGate::new(),
            send_pause: SendPause::new(),
            event_queue,
            shutdown: Mutex::new(None),
            pending_prompt: Arc::new(Mutex::new(None)),
            last_accepted: Arc::new(Mutex::new(None)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.agent_id, path)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, HubError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| classify_http_error("mtproto bridge", &e))?;

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
            .map_err(|e| classify_http_error("mtproto bridge", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("mtproto bridge body", &e))
    }

    async fn auth_loop(
        client: Arc<BridgeClient>,
        agent_id: String,
        pending_prompt: Arc<Mutex<Option<AuthPromptKind>>>,
        tx: mpsc::Sender<AdapterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_prompt: Option<AuthPromptKind> = None;
        let mut announced_ready = false;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let status = match client.status().await {
                Ok(s) => s,
                Err(e) => {
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
            let prompt = match phase {
                "waitPhone" => Some(AuthPromptKind::Phone),
                "waitCode" => Some(AuthPromptKind::Code),
                "waitPassword" => Some(AuthPromptKind::Password),
                _ => None,
            };

            match (phase, prompt) {
                (_, Some(kind)) => {
                    *pending_prompt.lock().await = Some(kind);
                    if last_prompt != Some(kind) {
                        debug!(agent_id = %agent_id, kind = %kind, "Auth prompt required");
                        if tx
                            .send(AdapterEvent::AuthPromptRequired { kind })
                            .await
                            .is_err()
                        {
                            return;
                        }
                        last_prompt = Some(kind);
                    }
                }
                ("authorized", None) => {
                    *pending_prompt.lock().await = None;
                    last_prompt = None;
                    if !announced_ready {
                        let info = AccountInfo {
                            account_id: status
                                .pointer("/me/id")
                                .and_then(|v| v.as_i64())
                                .map(|v| v.to_string())
                                .unwrap_or_default(),
                            username: status
                                .pointer("/me/username")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            display_name: status
                                .pointer("/me/firstName")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                        };
                        info!(agent_id = %agent_id, account = %info.account_id,
                              "MTProto session authorized");
                        let _ = tx.send(AdapterEvent::Authenticated { info: info.clone() }).await;
                        let _ = tx.send(AdapterEvent::Ready { info }).await;
                        announced_ready = true;
                    }

                    if !Self::event_loop(&client, &agent_id, &tx, &mut shutdown).await {
                        return;
                    }
                    announced_ready = false;
                }
                ("authFailed", None) => {
                    let _ = tx
                        .send(AdapterEvent::Disconnected {
                            reason: "bridge rejected credentials".into(),
                            recoverable: false,
                        })
                        .await;
                    return;
                }
                (other, None) => {
                    debug!(agent_id = %agent_id, phase = %other, "Bridge session starting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn event_loop(
        client: &BridgeClient,
        agent_id: &str,
        tx: &mpsc::Sender<AdapterEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut consecutive_errors: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return false;
            }

            let updates = tokio::select! {
                r = client.updates() => r,
                _ = shutdown.changed() => continue,
            };

            match updates {
                Ok(updates) => {
                    consecutive_errors = 0;
                    for update in updates {
                        match normalize_bridge_update(agent_id, &update) {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    return false;
                                }
                            }
                            None => {
                                warn!(agent_id = %agent_id, "Dropped malformed bridge update");
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(agent_id = %agent_id, error = %e, consecutive_errors,
                          "Bridge update poll failed");
                    if consecutive_errors >= 5 {
                        return true;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    agent_id: String,
}

impl BridgeClient {
    fn url(&self, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.agent_id, path)
    }

    async fn status(&self) -> Result<Value, HubError> {
        let response = self
            .http
            .get(self.url("status"))
            .send()
            .await
            .map_err(|e| classify_http_error("mtproto status", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("mtproto status", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("mtproto status body", &e))
    }

    async fn updates(&self) -> Result<Vec<Value>, HubError> {
        let response = self
            .http
            .get(format!("{}?timeout=25", self.url("updates")))
            .send()
            .await
            .map_err(|e| classify_http_error("mtproto updates", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("mtproto updates", &e))?;
        response
            .json()
            .await
            .map_err(|e| classify_http_error("mtproto updates body", &e))
    }
}

#[async_trait]
impl PlatformAdapter for TelegramUserAdapter {
    fn platform(&self) -> Platform {
        Platform::TelegramUser
    }

    async fn initialize(&self) -> Result<mpsc::Receiver<AdapterEvent>, HubError> {
        self.post_json(
            "start",
            &json!({
                "apiId": self.api_id,
                "apiHash": self.api_hash,
                "phone": self.phone,
            }),
        )
        .await?;

        let (tx, rx) = mpsc::channel(self.event_queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let client = Arc::new(BridgeClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            agent_id: self.agent_id.clone(),
        });
        let agent_id = self.agent_id.clone();
        let pending = self.pending_prompt.clone();
        tokio::spawn(async move {
            Self::auth_loop(client, agent_id, pending, tx, shutdown_rx).await;
        });

        Ok(rx)
    }

    async fn submit_auth_value(&self, kind: AuthPromptKind, value: &str) -> Result<(), HubError> {
        {
            let last = self.last_accepted.lock().await;
            if last.as_ref() == Some(&(kind, value.to_string())) {
                debug!(agent_id = %self.agent_id, kind = %kind,
                       "Duplicate auth submission after success, ignoring");
                return Ok(());
            }
        }

        let pending = { *self.pending_prompt.lock().await };
        match pending {
            Some(open) if open == kind => {}
            Some(open) => {
                return Err(HubError::Validation(format!(
                    "prompt mismatch: bridge waits for {}, got {}",
                    open, kind
                )))
            }
            None => return Err(HubError::NoPromptPending(self.agent_id.clone())),
        }

        let response = self
            .post_json("auth", &json!({"kind": kind.as_str(), "value": value}))
            .await?;

        let accepted = response
            .get("accepted")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !accepted {
            return Err(HubError::AuthFailed(format!(
                "bridge rejected {} value",
                kind
            )));
        }

        *self.pending_prompt.lock().await = None;
        *self.last_accepted.lock().await = Some((kind, value.to_string()));
        Ok(())
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
        Ok(SendReceipt {
            platform_message_id: response
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
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
            .map_err(|e| classify_http_error("mtproto media", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("mtproto media", &e))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_http_error("mtproto media body", &e))?;

        Ok(MediaBlob {
            bytes: bytes.to_vec(),
            mime_type,
            original_name: None,
        })
    }

    async fn shutdown(&self, reason: &str) -> Result<(), HubError> {
        info!(agent_id = %self.agent_id, reason = %reason, "MTProto adapter shutting down");
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        let _ = self.post_json("stop", &json!({})).await;
        Ok(())
    }
}

fn native_id(unified_id: &str) -> &str {
    unified_id.strip_prefix("tgu:").unwrap_or(unified_id)
}

fn normalize_bridge_update(agent_id: &str, update: &Value) -> Option<AdapterEvent> {
    let update_type = update.get("type")?.as_str()?;
    let payload = update.get("payload")?;

    match update_type {
        "message" => {
            let native = payload.get("id")?;
            let native = match native {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let chat_id = payload.get("chatId")?;
            let chat_id = match chat_id {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };

            Some(AdapterEvent::InboundMessage(UnifiedMessage {
                id: prefixed_message_id(Platform::TelegramUser, &native),
                agent_id: agent_id.to_string(),
                platform: Platform::TelegramUser,
                direction: Direction::Inbound,
                chat_id,
                sender_id: payload
                    .get("senderId")
                    .map(json_id_to_string)
                    .unwrap_or_default(),
                sender_name: payload
                    .get("senderName")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                body: payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                timestamp: payload
                    .get("timestamp")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(now_ms),
                kind: MessageKind::parse(
                    payload.get("kind").and_then(|v| v.as_str()).unwrap_or("text"),
                ),
                has_media: payload
                    .get("hasMedia")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                from_me: payload
                    .get("outgoing")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                reply_to: payload
                    .get("replyTo")
                    .filter(|v| !v.is_null())
                    .map(|v| prefixed_message_id(Platform::TelegramUser, &json_id_to_string(v))),
                meta: json!({"mimeType": payload.get("mimeType")}),
            }))
        }
        "message.edited" => Some(AdapterEvent::MessageEdited {
            message_id: prefixed_message_id(
                Platform::TelegramUser,
                &json_id_to_string(payload.get("id")?),
            ),
            chat_id: json_id_to_string(payload.get("chatId")?),
            new_body: payload
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            edited_at: payload
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(now_ms),
        }),
        "message.deleted" => Some(AdapterEvent::MessageDeleted {
            message_id: prefixed_message_id(
                Platform::TelegramUser,
                &json_id_to_string(payload.get("id")?),
            ),
            chat_id: json_id_to_string(payload.get("chatId")?),
        }),
        "typing" => Some(AdapterEvent::Typing {
            chat_id: json_id_to_string(payload.get("chatId")?),
            sender_id: payload
                .get("senderId")
                .map(json_id_to_string)
                .unwrap_or_default(),
        }),
        other => {
            debug!(update_type = %other, "Ignoring unsupported bridge update");
            None
        }
    }
}

fn json_id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_are_normalized() {
        let update = json!({
            "type": "message",
            "payload": {
                "id": 991,
                "chatId": -100123,
                "senderId": 42,
                "senderName": "Bob",
                "text": "hey",
                "timestamp": 1700000000000i64
            }
        });

        match normalize_bridge_update("agent-1", &update).unwrap() {
            AdapterEvent::InboundMessage(msg) => {
                assert_eq!(msg.id, "tgu:991");
                assert_eq!(msg.chat_id, "-100123");
                assert_eq!(msg.sender_id, "42");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn update_without_chat_is_dropped() {
        let update = json!({"type": "message", "payload": {"id": 1, "text": "x"}});
        assert!(normalize_bridge_update("agent-1", &update).is_none());
    }
}
