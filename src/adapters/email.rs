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

/// IMAP/SMTP transport behind a JSON mail gateway.
///
/// The gateway handles the mailbox protocols; this adapter polls for new
/// mail and maps each thread counterpart to a chat. Conversational chat
/// features with no mail equivalent (reactions, edits, polls) are rejected
/// as validation errors.
pub struct EmailAdapter {
    agent_id: String,
    base_url: String,
    account: String,
    poll_interval: Duration,
    http: reqwest::Client,
    media: Arc<MediaCache>,
    send_gate: ChatSendGate,
    send_pause: SendPause,
    event_queue: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl EmailAdapter {
    pub fn new(
        agent_id: &str,
        transport_config: &Value,
        media: Arc<MediaCache>,
        event_queue: usize,
    ) -> Result<Self, HubError> {
        let base_url = transport_config
            .get("gatewayUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("email config requires 'gatewayUrl'".into()))?
            .trim_end_matches('/')
            .to_string();
        let account = transport_config
            .get("account")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("email config requires 'account'".into()))?
            .to_string();
        let poll_interval = Duration::from_secs(
            transport_config
                .get("pollIntervalSecs")
                .and_then(|v| v.as_u64())
                .unwrap_or(15),
        );

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = transport_config.get("token").and_then(|v| v.as_str()) {
            if let Ok(value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HubError::Fatal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            agent_id: agent_id.to_string(),
            base_url,
            account,
            poll_interval,
            http,
            media,
            send_gate: ChatSendGate::new(),
            send_pause: SendPause::new(),
            event_queue,
            shutdown: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/accounts/{}/{}", self.base_url, self.account, path)
    }

    async fn poll_loop(
        http: reqwest::Client,
        base_url: String,
        account: String,
        agent_id: String,
        poll_interval: Duration,
        tx: mpsc::Sender<AdapterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut cursor: Option<String> = None;
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut url = format!("{}/accounts/{}/messages", base_url, account);
            if let Some(c) = &cursor {
                url.push_str(&format!("?since={}", c));
            }

            let result = async {
                let response = http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| classify_http_error("mail poll", &e))?
                    .error_for_status()
                    .map_err(|e| classify_http_error("mail poll", &e))?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| classify_http_error("mail poll body", &e))
            }
            .await;

            match result {
                Ok(page) => {
                    consecutive_errors = 0;
                    if let Some(next) = page.get("cursor").and_then(|v| v.as_str()) {
                        cursor = Some(next.to_string());
                    }
                    let empty = Vec::new();
                    let messages = page
                        .get("messages")
                        .and_then(|v| v.as_array())
                        .unwrap_or(&empty);
                    for mail in messages {
                        match normalize_mail(&agent_id, mail) {
                            Some(message) => {
                                if tx.send(AdapterEvent::InboundMessage(message)).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                warn!(agent_id = %agent_id, "Dropped malformed mail payload");
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(agent_id = %agent_id, error = %e, consecutive_errors, "Mail poll failed");
                    if consecutive_errors >= 5 {
                        let _ = tx
                            .send(AdapterEvent::Disconnected {
                                reason: format!("mail poll failed: {}", e),
                                recoverable: e.is_transient(),
                            })
                            .await;
                        return;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

#[async_trait]
impl PlatformAdapter for EmailAdapter {
    fn platform(&self) -> Platform {
        Platform::Email
    }

    async fn initialize(&self) -> Result<mpsc::Receiver<AdapterEvent>, HubError> {
        // Token probe: the gateway authenticates against IMAP on our behalf.
        let response = self
            .http
            .get(self.url("profile"))
            .send()
            .await
            .map_err(|e| classify_http_error("mail profile", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("mail profile", &e))?;
        let profile: Value = response
            .json()
            .await
            .map_err(|e| classify_http_error("mail profile body", &e))?;

        let info = AccountInfo {
            account_id: self.account.clone(),
            username: Some(self.account.clone()),
            display_name: profile
                .get("displayName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        };
        info!(agent_id = %self.agent_id, account = %self.account, "Mail account authenticated");

        let (tx, rx) = mpsc::channel(self.event_queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let _ = tx.send(AdapterEvent::Authenticated { info: info.clone() }).await;
        let _ = tx.send(AdapterEvent::Ready { info }).await;

        tokio::spawn(Self::poll_loop(
            self.http.clone(),
            self.base_url.clone(),
            self.account.clone(),
            self.agent_id.clone(),
            self.poll_interval,
            tx,
            shutdown_rx,
        ));

        Ok(rx)
    }

    async fn submit_auth_value(&self, _kind: AuthPromptKind, _value: &str) -> Result<(), HubError> {
        Err(HubError::NoPromptPending(self.agent_id.clone()))
    }

    async fn send(&self, command: SendCommand) -> Result<SendReceipt, HubError> {
        let _guard = self.send_gate.acquire(command.chat_id()).await;
        self.send_pause.wait_if_paused().await;

        let body = match &command {
            SendCommand::Text { chat_id, body, reply_to } => json!({
                "to": chat_id,
                "text": body,
                "inReplyTo": reply_to.as_ref().map(|r| native_id(r)),
            }),
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
                        "to": chat_id,
                        "text": caption,
                        "attachments": [{
                            "mimeType": mime_type,
                            "fileName": file_name.clone().or(blob.original_name),
                            "dataBase64": general_purpose::STANDARD.encode(&blob.bytes),
                        }],
                    })),
                    None => Err(HubError::Validation(format!(
                        "media key {} not in cache",
                        media_key
                    ))),
                };
                self.media.unpin(&self.agent_id, media_key).await;
                result?
            }
            SendCommand::Location {
                chat_id,
                latitude,
                longitude,
                name,
            } => json!({
                "to": chat_id,
                "text": format!(
                    "Location: {} ({}, {})",
                    name.clone().unwrap_or_default(),
                    latitude,
                    longitude
                ),
            }),
            SendCommand::Contact { chat_id, name, phone } => json!({
                "to": chat_id,
                "text": format!("Contact: {} <{}>", name, phone),
            }),
            other => {
                return Err(HubError::Validation(format!(
                    "send kind '{}' not supported on email transport",
                    other.kind_str()
                )))
            }
        };

        let response = self
            .http
            .post(self.url("send"))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_http_error("mail send", &e))?;

        if response.status().as_u16() == 429 {
            let retry_after_ms = 30_000;
            self.send_pause
                .pause_for(Duration::from_millis(retry_after_ms))
                .await;
            return Err(HubError::Busy { retry_after_ms });
        }

        let response = response
            .error_for_status()
            .map_err(|e| classify_http_error("mail send", &e))?;
        let result: Value = response
            .json()
            .await
            .map_err(|e| classify_http_error("mail send body", &e))?;

        Ok(SendReceipt {
            platform_message_id: result
                .get("messageId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            sent_at: now_ms(),
        })
    }

    async fn download_media(&self, media_ref: &MediaRef) -> Result<MediaBlob, HubError> {
        let attachment_id = media_ref
            .meta
            .get("attachmentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("media ref missing attachmentId".into()))?;

        let response = self
            .http
            .get(self.url(&format!("attachments/{}", attachment_id)))
            .send()
            .await
            .map_err(|e| classify_http_error("mail attachment", &e))?
            .error_for_status()
            .map_err(|e| classify_http_error("mail attachment", &e))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_http_error("mail attachment body", &e))?;

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
        info!(agent_id = %self.agent_id, reason = %reason, "Email adapter shutting down");
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        Ok(())
    }
}

fn native_id(unified_id: &str) -> &str {
    unified_id.strip_prefix("em:").unwrap_or(unified_id)
}

fn normalize_mail(agent_id: &str, mail: &Value) -> Option<UnifiedMessage> {
    let native_id = mail.get("id")?.as_str()?;
    let from = mail.pointer("/from/email")?.as_str()?;
    let has_attachments = mail
        .get("attachments")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);

    Some(UnifiedMessage {
        id: prefixed_message_id(Platform::Email, native_id),
        agent_id: agent_id.to_string(),
        platform: Platform::Email,
        direction: Direction::Inbound,
        chat_id: from.to_string(),
        sender_id: from.to_string(),
        sender_name: mail
            .pointer("/from/name")
            .and_then(|v| v.as_str())
            .unwrap_or(from)
            .to_string(),
        body: mail
            .get("textBody")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        timestamp: mail
            .get("receivedAt")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(now_ms),
        kind: if has_attachments {
            MessageKind::Document
        } else {
            MessageKind::Text
        },
        has_media: has_attachments,
        from_me: false,
        reply_to: mail
            .get("inReplyTo")
            .and_then(|v| v.as_str())
            .map(|r| prefixed_message_id(Platform::Email, r)),
        meta: json!({
            "subject": mail.get("subject"),
            "attachments": mail.get("attachments"),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mail_to_unified_message() {
        let mail = json!({
            "id": "m-77",
            "from": {"email": "alice@example.com", "name": "Alice"},
            "subject": "Hi",
            "textBody": "hello from mail",
            "receivedAt": 1700000000000i64,
            "attachments": []
        });

        let msg = normalize_mail("agent-1", &mail).unwrap();
        assert_eq!(msg.id, "em:m-77");
        assert_eq!(msg.chat_id, "alice@example.com");
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.meta["subject"], "Hi");
    }

    #[test]
    fn mail_with_attachments_is_document() {
        let mail = json!({
            "id": "m-78",
            "from": {"email": "bob@example.com"},
            "attachments": [{"id": "a1", "mimeType": "application/pdf"}],
            "receivedAt": 1i64
        });

        let msg = normalize_mail("agent-1", &mail).unwrap();
        assert_eq!(msg.kind, MessageKind::Document);
        assert!(msg.has_media);
    }

    #[test]
    fn mail_without_sender_is_dropped() {
        let mail = json!({"id": "m-79", "textBody": "orphan"});
        assert!(normalize_mail("agent-1", &mail).is_none());
    }
}
