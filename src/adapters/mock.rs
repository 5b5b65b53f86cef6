use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::agents::types::{
    now_ms, AdapterEvent, AuthPromptKind, MediaRef, Platform, SendCommand, SendReceipt,
};
use crate::adapters::{ChatSendGate, PlatformAdapter};
use crate::media::MediaBlob;
use crate::utils::HubError;

/// Scriptable in-process adapter used by the integration tests.
///
/// `initialize` replays a scripted event sequence; further events can be
/// injected at any time, and auth submissions pop scripted continuations the
/// way a real interactive bring-up would.
pub struct MockAdapter {
    platform: Platform,
    initial_events: Mutex<Vec<AdapterEvent>>,
    auth_continuations: Mutex<VecDeque<(AuthPromptKind, Vec<AdapterEvent>)>>,
    pending_prompt: Mutex<Option<AuthPromptKind>>,
    accepted: Mutex<Option<(AuthPromptKind, String)>>,
    sent: Mutex<Vec<SendCommand>>,
    send_counter: AtomicU64,
    fail_next_sends: AtomicU32,
    send_delay: Mutex<Option<Duration>>,
    tx: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
    send_gate: ChatSendGate,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            initial_events: Mutex::new(Vec::new()),
            auth_continuations: Mutex::new(VecDeque::new()),
            pending_prompt: Mutex::new(None),
            accepted: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            send_counter: AtomicU64::new(0),
            fail_next_sends: AtomicU32::new(0),
            send_delay: Mutex::new(None),
            tx: Mutex::new(None),
            send_gate: ChatSendGate::new(),
        }
    }

    /// Events replayed when `initialize` is called.
    pub async fn script_initial(&self, events: Vec<AdapterEvent>) {
        *self.initial_events.lock().await = events;
    }

    /// Continuation emitted when the matching auth kind is submitted.
    pub async fn script_auth(&self, kind: AuthPromptKind, continuation: Vec<AdapterEvent>) {
        self.auth_continuations
            .lock()
            .await
            .push_back((kind, continuation));
    }

    /// Push an event into the live stream after initialization.
    pub async fn inject(&self, event: AdapterEvent) {
        if let AdapterEvent::AuthPromptRequired { kind } = &event {
            *self.pending_prompt.lock().await = Some(*kind);
        }
        let tx = self.tx.lock().await;
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(event).await;
        }
    }

    pub async fn sent_commands(&self) -> Vec<SendCommand> {
        self.sent.lock().await.clone()
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.fail_next_sends.store(count, Ordering::SeqCst);
    }

    pub async fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().await = Some(delay);
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn initialize(&self) -> Result<mpsc::Receiver<AdapterEvent>, HubError> {
        let initial = self.initial_events.lock().await.clone();
        let (tx, rx) = mpsc::channel(std::cmp::max(64, initial.len() + 4));

        for event in initial {
            if let AdapterEvent::AuthPromptRequired { kind } = &event {
                *self.pending_prompt.lock().await = Some(*kind);
            }
            let _ = tx.send(event).await;
        }

        *self.tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn submit_auth_value(&self, kind: AuthPromptKind, value: &str) -> Result<(), HubError> {
        {
            let accepted = self.accepted.lock().await;
            if accepted.as_ref() == Some(&(kind, value.to_string())) {
                return Ok(());
            }
        }

        let pending = { *self.pending_prompt.lock().await };
        if pending != Some(kind) {
            return Err(HubError::NoPromptPending("mock".into()));
        }

        let continuation = {
            let mut continuations = self.auth_continuations.lock().await;
            match continuations.front() {
                Some((expected, _)) if *expected == kind => continuations.pop_front(),
                _ => None,
            }
        };

        *self.pending_prompt.lock().await = None;
        *self.accepted.lock().await = Some((kind, value.to_string()));

        if let Some((_, events)) = continuation {
            for event in events {
                self.inject(event).await;
            }
        }
        Ok(())
    }

    async fn send(&self, command: SendCommand) -> Result<SendReceipt, HubError> {
        let _guard = self.send_gate.acquire(command.chat_id()).await;

        if self
            .fail_next_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(HubError::Transient("scripted send failure".into()));
        }

        let delay = { *self.send_delay.lock().await };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.sent.lock().await.push(command);
        let n = self.send_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            platform_message_id: format!("m{}", n),
            sent_at: now_ms(),
        })
    }

    async fn download_media(&self, _media_ref: &MediaRef) -> Result<MediaBlob, HubError> {
        Ok(MediaBlob {
            bytes: b"mock-media-bytes".to_vec(),
            mime_type: "application/octet-stream".to_string(),
            original_name: None,
        })
    }

    async fn shutdown(&self, _reason: &str) -> Result<(), HubError> {
        self.tx.lock().await.take();
        Ok(())
    }
}

/// Convenience constructor: a bot-style adapter that authenticates
/// immediately with the given account id and username.
pub async fn ready_bot(account_id: &str, username: &str) -> Arc<MockAdapter> {
    let adapter = Arc::new(MockAdapter::new(Platform::TelegramBot));
    let info = crate::agents::types::AccountInfo {
        account_id: account_id.to_string(),
        username: Some(username.to_string()),
        display_name: Some(username.to_string()),
    };
    adapter
        .script_initial(vec![
            AdapterEvent::Authenticated { info: info.clone() },
            AdapterEvent::Ready { info },
        ])
        .await;
    adapter
}
