pub mod email;
pub mod mock;
pub mod telegram_bot;
pub mod telegram_user;
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::agents::types::{
    AdapterEvent, AuthPromptKind, MediaRef, Platform, SendCommand, SendReceipt,
};
use crate::media::MediaBlob;
use crate::utils::HubError;

/// Contract every transport variant implements.
///
/// `initialize` starts the external session and hands back the upward event
/// stream; the adapter owns its own I/O tasks and funnels every emission
/// through that stream. All sends for one chat are single-flight: the N-th
/// successful send for a chat is observed by the external service before the
/// (N+1)-th.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn initialize(&self) -> Result<mpsc::Receiver<AdapterEvent>, HubError>;

    /// Resolve an outstanding auth prompt. Fails with `NoPromptPending` when
    /// none is open; resubmitting after success is a no-op.
    async fn submit_auth_value(&self, kind: AuthPromptKind, value: &str) -> Result<(), HubError>;

    async fn send(&self, command: SendCommand) -> Result<SendReceipt, HubError>;

    async fn download_media(&self, media_ref: &MediaRef) -> Result<MediaBlob, HubError>;

    async fn shutdown(&self, reason: &str) -> Result<(), HubError>;
}

/// Per-chat single-flight gate shared by all adapter variants.
///
/// Holding the guard serializes sends for one `chat_id` while leaving other
/// chats free to proceed.
pub struct ChatSendGate {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatSendGate {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Default for ChatSendGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Upstream rate-limit pause shared by the send path of an adapter. When the
/// transport signals a retry-after, sends wait out the window instead of
/// hammering the service.
pub struct SendPause {
    until: Mutex<Option<Instant>>,
}

impl SendPause {
    pub fn new() -> Self {
        Self {
            until: Mutex::new(None),
        }
    }

    pub async fn pause_for(&self, duration: Duration) {
        let mut until = self.until.lock().await;
        let target = Instant::now() + duration;
        if until.map(|u| u < target).unwrap_or(true) {
            warn!(pause_ms = duration.as_millis() as u64, "Send queue paused by rate limit");
            *until = Some(target);
        }
    }

    pub async fn wait_if_paused(&self) {
        let target = { *self.until.lock().await };
        if let Some(target) = target {
            let now = Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
            let mut until = self.until.lock().await;
            if until.map(|u| u <= Instant::now()).unwrap_or(false) {
                *until = None;
            }
        }
    }
}

impl Default for SendPause {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a reqwest failure onto the hub error taxonomy: network trouble and
/// 5xx are transient, 401/403 surface as auth failures.
pub fn classify_http_error(context: &str, err: &reqwest::Error) -> HubError {
    if let Some(status) = err.status() {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return HubError::AuthFailed(format!("{}: {}", context, status));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return HubError::Transient(format!("{}: {}", context, status));
        }
        return HubError::Validation(format!("{}: {}", context, status));
    }
    HubError::Transient(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn chat_gate_serializes_per_chat() {
        let gate = Arc::new(ChatSendGate::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = gate.acquire("chat-1").await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_chats_do_not_block() {
        let gate = Arc::new(ChatSendGate::new());
        let guard_a = gate.acquire("a").await;

        // A second chat acquires immediately even while "a" is held.
        let acquired =
            tokio::time::timeout(Duration::from_millis(50), gate.acquire("b")).await;
        assert!(acquired.is_ok());
        drop(guard_a);
    }

    #[tokio::test]
    async fn send_pause_delays_until_window_passes() {
        let pause = SendPause::new();
        pause.pause_for(Duration::from_millis(20)).await;

        let start = Instant::now();
        pause.wait_if_paused().await;
        assert!(start.elapsed() >= Duration::from_millis(15));

        // Second wait is a no-op once the window has cleared.
        let start = Instant::now();
        pause.wait_if_paused().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
