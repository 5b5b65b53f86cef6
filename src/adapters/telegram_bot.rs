use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId,
    ReactionType, ReplyParameters, UpdateKind,
};
use teloxide::RequestError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::agents::types::{
    now_ms, prefixed_message_id, AccountInfo, AdapterEvent, AuthPromptKind, Direction, MediaRef,
    MessageKind, Platform, SendCommand, SendReceipt, UnifiedMessage,
};
use crate::adapters::{classify_http_error, ChatSendGate, PlatformAdapter, SendPause};
use crate::media::{MediaBlob, MediaCache};
use crate::utils::HubError;

/// Bot-API transport. The session is just the bot token; bring-up is a
/// `getMe` probe, so no QR or interactive prompt is ever issued.
pub struct TelegramBotAdapter {
    agent_id: String,
    token: String,
    bot: Bot,
    http: reqwest::Client,
    media: Arc<MediaCache>,
    send_gate: ChatSendGate,
    send_pause: SendPause,
    event_queue: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl TelegramBotAdapter {
    pub fn new(
        agent_id: &str,
        transport_config: &serde_json::Value,
        media: Arc<MediaCache>,
        event_queue: usize,
    ) -> Result<Self, HubError> {
        let token = transport_config
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("telegram-bot config requires 'token'".into()))?
            .to_string();

        Ok(Self {
            agent_id: agent_id.to_string(),
            bot: Bot::new(token.clone()),
            token,
            http: reqwest::Client::new(),
            media,
            send_gate: ChatSendGate::new(),
            send_pause: SendPause::new(),
            event_queue,
            shutdown: Mutex::new(None),
        })
    }

    fn map_request_error(&self, err: RequestError) -> HubError {
        match err {
            RequestError::RetryAfter(secs) => HubError::Busy {
                retry_after_ms: secs.duration().as_millis() as u64,
            },
            RequestError::Network(e) => HubError::Transient(format!("telegram network: {}", e)),
            RequestError::Api(api) => {
                let text = api.to_string();
                if text.contains("Unauthorized") || text.contains("bot was blocked") {
                    HubError::AuthFailed(format!("telegram api: {}", text))
                } else {
                    HubError::Validation(format!("telegram api: {}", text))
                }
            }
            other => HubError::Transient(format!("telegram: {}", other)),
        }
    }

    async fn poll_loop(
        bot: Bot,
        agent_id: String,
        me_id: i64,
        tx: mpsc::Sender<AdapterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut offset: i32 = 0;
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                debug!(agent_id = %agent_id, "Telegram poll loop stopping");
                return;
            }

            let updates = tokio::select! {
                r = bot.get_updates().offset(offset).timeout(25) => r,
                _ = shutdown.changed() => continue,
            };

            match updates {
                Ok(updates) => {
                    consecutive_errors = 0;
                    for update in updates {
                        offset = offset.max(update.id.0 as i32 + 1);
                        if let Some(event) = normalize_update(&agent_id, me_id, update) {
                            // Backpressure: a full supervisor mailbox pauses
                            // consumption from the Bot API.
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(RequestError::Api(api)) if api.to_string().contains("Unauthorized") => {
                    let _ = tx
                        .send(AdapterEvent::Disconnected {
                            reason: "bot token rejected".into(),
                            recoverable: false,
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(agent_id = %agent_id, error = %e, consecutive_errors,
                          "Telegram getUpdates failed");
                    if consecutive_errors >= 5 {
                        let _ = tx
                            .send(AdapterEvent::Disconnected {
                                reason: format!("polling failed: {}", e),
                                recoverable: true,
                            })
                            .await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

#[async_trait]
impl PlatformAdapter for TelegramBotAdapter {
    fn platform(&self) -> Platform {
        Platform::TelegramBot
    }

    async fn initialize(&self) -> Result<mpsc::Receiver<AdapterEvent>, HubError> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let info = AccountInfo {
            account_id: me.id.0.to_string(),
            username: me.username.clone(),
            display_name: Some(me.first_name.clone()),
        };
        info!(agent_id = %self.agent_id, bot = ?info.username, "Telegram bot authenticated");

        let (tx, rx) = mpsc::channel(self.event_queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        // Token probe succeeded: the session is live immediately.
        let _ = tx.send(AdapterEvent::Authenticated { info: info.clone() }).await;
        let _ = tx.send(AdapterEvent::Ready { info: info.clone() }).await;

        let bot = self.bot.clone();
        let agent_id = self.agent_id.clone();
        let me_id = me.id.0 as i64;
        tokio::spawn(async move {
            Self::poll_loop(bot, agent_id, me_id, tx, shutdown_rx).await;
        });

        Ok(rx)
    }

    async fn submit_auth_value(&self, _kind: AuthPromptKind, _value: &str) -> Result<(), HubError> {
        // Token-based transport never raises prompts.
        Err(HubError::NoPromptPending(self.agent_id.clone()))
    }

    async fn send(&self, command: SendCommand) -> Result<SendReceipt, HubError> {
        let chat_id = parse_chat_id(command.chat_id())?;
        let _guard = self.send_gate.acquire(command.chat_id()).await;
        self.send_pause.wait_if_paused().await;

        let result = match &command {
            SendCommand::Text { body, reply_to, .. } => {
                let mut request = self.bot.send_message(chat_id, body.clone());
                if let Some(reply) = reply_to {
                    if let Ok(native) = parse_native_message_id(reply) {
                        request = request.reply_parameters(ReplyParameters::new(MessageId(native)));
                    }
                }
                request.await.map(|m| m.id.0.to_string())
            }
            SendCommand::Media {
                media_key,
                mime_type,
                caption,
                file_name,
                ..
            } => {
                self.media.pin(&self.agent_id, media_key).await;
                let blob = self.media.get(&self.agent_id, media_key).await.ok().flatten();
                let result = match blob {
                    Some(blob) => {
                        let mut input = InputFile::memory(blob.bytes);
                        if let Some(name) = file_name.clone().or(blob.original_name) {
                            input = input.file_name(name);
                        }
                        if mime_type.starts_with("image/") {
                            let mut req = self.bot.send_photo(chat_id, input);
                            if !caption.is_empty() {
                                req = req.caption(caption.clone());
                            }
                            req.await.map(|m| m.id.0.to_string())
                        } else if mime_type.starts_with("video/") {
                            let mut req = self.bot.send_video(chat_id, input);
                            if !caption.is_empty() {
                                req = req.caption(caption.clone());
                            }
                            req.await.map(|m| m.id.0.to_string())
                        } else if mime_type.starts_with("audio/") {
                            let mut req = self.bot.send_audio(chat_id, input);
                            if !caption.is_empty() {
                                req = req.caption(caption.clone());
                            }
                            req.await.map(|m| m.id.0.to_string())
                        } else {
                            let mut req = self.bot.send_document(chat_id, input);
                            if !caption.is_empty() {
                                req = req.caption(caption.clone());
                            }
                            req.await.map(|m| m.id.0.to_string())
                        }
                    }
                    None => {
                        self.media.unpin(&self.agent_id, media_key).await;
                        return Err(HubError::Validation(format!(
                            "media key {} not in cache",
                            media_key
                        )));
                    }
                };
                self.media.unpin(&self.agent_id, media_key).await;
                result
            }
            SendCommand::Location {
                latitude, longitude, ..
            } => self
                .bot
                .send_location(chat_id, *latitude, *longitude)
                .await
                .map(|m| m.id.0.to_string()),
            SendCommand::Contact { name, phone, .. } => self
                .bot
                .send_contact(chat_id, phone.clone(), name.clone())
                .await
                .map(|m| m.id.0.to_string()),
            SendCommand::Buttons { body, buttons, .. } => {
                let keyboard = InlineKeyboardMarkup::new(vec![buttons
                    .iter()
                    .map(|label| InlineKeyboardButton::callback(label.clone(), label.clone()))
                    .collect::<Vec<_>>()]);
                self.bot
                    .send_message(chat_id, body.clone())
                    .reply_markup(keyboard)
                    .await
                    .map(|m| m.id.0.to_string())
            }
            SendCommand::Poll {
                question, options, ..
            } => self
                .bot
                .send_poll(
                    chat_id,
                    question.clone(),
                    options.iter().cloned().collect::<Vec<_>>(),
                )
                .await
                .map(|m| m.id.0.to_string()),
            SendCommand::Reaction {
                message_id, emoji, ..
            } => {
                let native = parse_native_message_id(message_id)?;
                self.bot
                    .set_message_reaction(chat_id, MessageId(native))
                    .reaction(vec![ReactionType::Emoji {
                        emoji: emoji.clone(),
                    }])
                    .await
                    .map(|_| message_id.clone())
            }
            SendCommand::Forward {
                from_chat_id,
                message_id,
                ..
            } => {
                let from = parse_chat_id(from_chat_id)?;
                let native = parse_native_message_id(message_id)?;
                self.bot
                    .forward_message(chat_id, from, MessageId(native))
                    .await
                    .map(|m| m.id.0.to_string())
            }
            SendCommand::Edit {
                message_id, body, ..
            } => {
                let native = parse_native_message_id(message_id)?;
                self.bot
                    .edit_message_text(chat_id, MessageId(native), body.clone())
                    .await
                    .map(|m| m.id.0.to_string())
            }
            SendCommand::Delete { message_id, .. } => {
                let native = parse_native_message_id(message_id)?;
                self.bot
                    .delete_message(chat_id, MessageId(native))
                    .await
                    .map(|_| message_id.clone())
            }
        };

        match result {
            Ok(native_id) => Ok(SendReceipt {
                platform_message_id: native_id,
                sent_at: now_ms(),
            }),
            Err(RequestError::RetryAfter(secs)) => {
                self.send_pause.pause_for(secs.duration()).await;
                Err(HubError::Busy {
                    retry_after_ms: secs.duration().as_millis() as u64,
                })
            }
            Err(e) => Err(self.map_request_error(e)),
        }
    }

    async fn download_media(&self, media_ref: &MediaRef) -> Result<MediaBlob, HubError> {
        let file_id = media_ref
            .meta
            .get("fileId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("media ref missing fileId".into()))?;

        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| self.map_request_error(e))?;

        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.token, file.path
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_http_error("telegram file download", &e))?;
        let response = response
            .error_for_status()
            .map_err(|e| classify_http_error("telegram file download", &e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_http_error("telegram file body", &e))?;

        let mime_type = media_ref
            .meta
            .get("mimeType")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();

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
        info!(agent_id = %self.agent_id, reason = %reason, "Telegram bot adapter shutting down");
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        Ok(())
    }
}

fn parse_chat_id(raw: &str) -> Result<ChatId, HubError> {
    raw.parse::<i64>()
        .map(ChatId)
        .map_err(|_| HubError::Validation(format!("invalid telegram chat id: {}", raw)))
}

/// Strip the platform prefix from a unified message ID and parse the
/// Bot-API-native numeric part.
fn parse_native_message_id(unified_id: &str) -> Result<i32, HubError> {
    let native = unified_id.rsplit(':').next().unwrap_or(unified_id);
    native
        .parse::<i32>()
        .map_err(|_| HubError::Validation(format!("invalid telegram message id: {}", unified_id)))
}

/// The normalizer: converts one Bot API update into a unified event. Pure
/// data transformation; malformed updates yield `None` and are dropped.
fn normalize_update(agent_id: &str, me_id: i64, update: Update) -> Option<AdapterEvent> {
    match update.kind {
        UpdateKind::Message(msg) => {
            Some(AdapterEvent::InboundMessage(normalize_message(agent_id, me_id, &msg)))
        }
        UpdateKind::EditedMessage(msg) => Some(AdapterEvent::MessageEdited {
            message_id: prefixed_message_id(Platform::TelegramBot, &msg.id.0.to_string()),
            chat_id: msg.chat.id.0.to_string(),
            new_body: msg.text().or(msg.caption()).unwrap_or_default().to_string(),
            edited_at: now_ms(),
        }),
        UpdateKind::CallbackQuery(q) => {
            let chat_id = q
                .message
                .as_ref()
                .map(|m| m.chat().id.0.to_string())
                .unwrap_or_default();
            let message = UnifiedMessage {
                id: prefixed_message_id(Platform::TelegramBot, &format!("cb-{}", q.id)),
                agent_id: agent_id.to_string(),
                platform: Platform::TelegramBot,
                direction: Direction::Inbound,
                chat_id,
                sender_id: q.from.id.0.to_string(),
                sender_name: q.from.full_name(),
                body: q.data.clone().unwrap_or_default(),
                timestamp: now_ms(),
                kind: MessageKind::Callback,
                has_media: false,
                from_me: false,
                reply_to: q
                    .message
                    .as_ref()
                    .map(|m| prefixed_message_id(Platform::TelegramBot, &m.id().0.to_string())),
                meta: json!({"callbackQueryId": q.id}),
            };
            Some(AdapterEvent::InboundMessage(message))
        }
        _ => None,
    }
}

fn normalize_message(agent_id: &str, me_id: i64, msg: &Message) -> UnifiedMessage {
    let (kind, has_media, file_meta) = classify_payload(msg);
    let sender_id = msg
        .from
        .as_ref()
        .map(|u| u.id.0.to_string())
        .unwrap_or_default();
    let sender_name = msg.from.as_ref().map(|u| u.full_name()).unwrap_or_default();
    let from_me = msg
        .from
        .as_ref()
        .map(|u| u.id.0 as i64 == me_id)
        .unwrap_or(false);

    let body = msg
        .text()
        .or(msg.caption())
        .map(|s| s.to_string())
        .unwrap_or_else(|| body_for_kind(kind, msg));

    UnifiedMessage {
        id: prefixed_message_id(Platform::TelegramBot, &msg.id.0.to_string()),
        agent_id: agent_id.to_string(),
        platform: Platform::TelegramBot,
        direction: Direction::Inbound,
        chat_id: msg.chat.id.0.to_string(),
        sender_id,
        sender_name,
        body,
        timestamp: msg.date.timestamp_millis(),
        kind,
        has_media,
        from_me,
        reply_to: msg
            .reply_to_message()
            .map(|r| prefixed_message_id(Platform::TelegramBot, &r.id.0.to_string())),
        meta: file_meta,
    }
}

fn classify_payload(msg: &Message) -> (MessageKind, bool, serde_json::Value) {
    if msg.text().is_some() {
        (MessageKind::Text, false, json!({}))
    } else if let Some(photos) = msg.photo() {
        let file_id = photos.last().map(|p| p.file.id.clone()).unwrap_or_default();
        (
            MessageKind::Image,
            true,
            json!({"fileId": file_id, "mimeType": "image/jpeg"}),
        )
    } else if let Some(video) = msg.video() {
        (
            MessageKind::Video,
            true,
            json!({"fileId": video.file.id, "mimeType": video.mime_type.as_ref().map(|m| m.to_string()).unwrap_or_else(|| "video/mp4".into())}),
        )
    } else if let Some(voice) = msg.voice() {
        (
            MessageKind::Voice,
            true,
            json!({"fileId": voice.file.id, "mimeType": "audio/ogg"}),
        )
    } else if let Some(audio) = msg.audio() {
        (
            MessageKind::Audio,
            true,
            json!({"fileId": audio.file.id, "mimeType": audio.mime_type.as_ref().map(|m| m.to_string()).unwrap_or_else(|| "audio/mpeg".into())}),
        )
    } else if let Some(doc) = msg.document() {
        (
            MessageKind::Document,
            true,
            json!({
                "fileId": doc.file.id,
                "mimeType": doc.mime_type.as_ref().map(|m| m.to_string()).unwrap_or_else(|| "application/octet-stream".into()),
                "fileName": doc.file_name,
            }),
        )
    } else if let Some(sticker) = msg.sticker() {
        (
            MessageKind::Sticker,
            true,
            json!({"fileId": sticker.file.id, "mimeType": "image/webp"}),
        )
    } else if msg.location().is_some() {
        (MessageKind::Location, false, json!({}))
    } else if msg.contact().is_some() {
        (MessageKind::Contact, false, json!({}))
    } else if msg.poll().is_some() {
        (MessageKind::Poll, false, json!({}))
    } else {
        (MessageKind::Unknown, false, json!({}))
    }
}

fn body_for_kind(kind: MessageKind, msg: &Message) -> String {
    match kind {
        MessageKind::Location => msg
            .location()
            .map(|l| format!("{},{}", l.latitude, l.longitude))
            .unwrap_or_default(),
        MessageKind::Contact => msg
            .contact()
            .map(|c| format!("{} {}", c.first_name, c.phone_number))
            .unwrap_or_default(),
        MessageKind::Poll => msg.poll().map(|p| p.question.clone()).unwrap_or_default(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_parsing() {
        assert!(parse_chat_id("12345").is_ok());
        assert!(parse_chat_id("-1001234").is_ok());
        assert!(parse_chat_id("not-a-chat").is_err());
    }

    #[test]
    fn native_message_id_strips_prefix() {
        assert_eq!(parse_native_message_id("tgb:77").unwrap(), 77);
        assert_eq!(parse_native_message_id("77").unwrap(), 77);
        assert!(parse_native_message_id("tgb:abc").is_err());
    }
}
