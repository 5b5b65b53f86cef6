use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::PlatformAdapter;
use crate::agents::types::{
    AdapterEvent, AgentRecord, AgentState, AuthPromptKind, Direction, MediaRef, MessageKind,
    Platform, SendCommand, SendReceipt, UnifiedMessage,
};
use crate::flows::TriggerWork;
use crate::hub::{agent_topic, HubFrame, SubscriptionHub};
use crate::log_state_transition;
use crate::media::MediaCache;
use crate::ratelimit::{Acquire, RateLimiter, Scope};
use crate::storage::{ArtifactStatus, Persistence, SessionStore};
use crate::utils::{HubError, HubMetrics};

/// Reconnect and queue tuning for one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconnect_cap: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub command_queue: usize,
    pub shutdown_grace: Duration,
    pub archive_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_cap: 10,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            command_queue: 256,
            shutdown_grace: Duration::from_secs(5),
            archive_after: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Everything a supervisor needs from the rest of the hub.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub persistence: Arc<Persistence>,
    pub media: Arc<MediaCache>,
    pub hub: Arc<SubscriptionHub>,
    pub sessions: Arc<SessionStore>,
    pub metrics: Arc<HubMetrics>,
    pub limiter: Arc<RateLimiter>,
    pub trigger_tx: mpsc::Sender<TriggerWork>,
}

/// Snapshot answered to `status()` calls.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub record: AgentRecord,
    pub qr: Option<String>,
    pub pending_prompt: Option<AuthPromptKind>,
}

/// Commands accepted on the supervisor mailbox. The supervisor itself is
/// single-threaded over its own state; these are the only way in.
pub enum SupervisorCommand {
    Connect {
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    SubmitAuth {
        kind: AuthPromptKind,
        value: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Send {
        command: SendCommand,
        reply: oneshot::Sender<Result<SendReceipt, HubError>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    SetSwarm {
        enabled: bool,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    CrossAgentInvoke {
        source_agent_id: String,
        flow_name: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value, HubError>>,
    },
    TenantBroadcast {
        topic: String,
        payload: Value,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable address of one supervisor. Sends are admission-controlled: a full
/// mailbox answers `Busy` instead of blocking the caller.
#[derive(Clone)]
pub struct AgentHandle {
    pub agent_id: String,
    pub tenant: String,
    pub platform: Platform,
    pub browser_session: Option<String>,
    tx: mpsc::Sender<SupervisorCommand>,
}

impl AgentHandle {
    pub async fn connect(&self) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SupervisorCommand::Connect { reply }).await?;
        rx.await.map_err(|_| supervisor_gone())?
    }

    pub async fn disconnect(&self) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SupervisorCommand::Disconnect { reply }).await?;
        rx.await.map_err(|_| supervisor_gone())?
    }

    pub async fn submit_auth(&self, kind: AuthPromptKind, value: &str) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SupervisorCommand::SubmitAuth {
            kind,
            value: value.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| supervisor_gone())?
    }

    pub async fn send(&self, command: SendCommand) -> Result<SendReceipt, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(SupervisorCommand::Send { command, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::Busy { retry_after_ms: 500 },
                mpsc::error::TrySendError::Closed(_) => supervisor_gone(),
            })?;
        rx.await.map_err(|_| supervisor_gone())?
    }

    pub async fn status(&self) -> Result<StatusReport, HubError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SupervisorCommand::Status { reply }).await?;
        rx.await.map_err(|_| supervisor_gone())
    }

    pub async fn set_swarm(&self, enabled: bool) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SupervisorCommand::SetSwarm { enabled, reply })
            .await?;
        rx.await.map_err(|_| supervisor_gone())?
    }

    /// Deliver a cross-agent invocation and hand the reply slot back to the
    /// caller, which owns the timeout.
    pub async fn invoke_cross_agent(
        &self,
        source_agent_id: &str,
        flow_name: &str,
        payload: Value,
    ) -> Result<oneshot::Receiver<Result<Value, HubError>>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SupervisorCommand::CrossAgentInvoke {
            source_agent_id: source_agent_id.to_string(),
            flow_name: flow_name.to_string(),
            payload,
            reply,
        })
        .await?;
        Ok(rx)
    }

    pub async fn tenant_broadcast(&self, topic: &str, payload: Value) {
        let _ = self
            .tx
            .try_send(SupervisorCommand::TenantBroadcast {
                topic: topic.to_string(),
                payload,
            });
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.deliver(SupervisorCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn deliver(&self, command: SupervisorCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| supervisor_gone())
    }
}

fn supervisor_gone() -> HubError {
    HubError::Fatal("supervisor task is gone".into())
}

enum LoopAction {
    Continue,
    Connected(mpsc::Receiver<AdapterEvent>),
    DropStream,
    Break,
}

/// One supervisor per agent: owns the adapter, the state machine and the
/// ingest pipeline for that agent.
pub struct AgentSupervisor {
    record: AgentRecord,
    adapter: Arc<dyn PlatformAdapter>,
    deps: SupervisorDeps,
    config: SupervisorConfig,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    last_qr: Option<Vec<u8>>,
    pending_prompt: Option<AuthPromptKind>,
    ready_gauge_held: bool,
    last_activity: Instant,
}

impl AgentSupervisor {
    /// Spawn the supervisor task and return its handle.
    pub fn spawn(
        record: AgentRecord,
        adapter: Arc<dyn PlatformAdapter>,
        deps: SupervisorDeps,
        config: SupervisorConfig,
    ) -> AgentHandle {
        let (tx, rx) = mpsc::channel(config.command_queue);
        let handle = AgentHandle {
            agent_id: record.agent_id.clone(),
            tenant: record.tenant.clone(),
            platform: record.platform,
            browser_session: record.browser_session.clone(),
            tx,
        };

        let supervisor = Self {
            record,
            adapter,
            deps,
            config,
            reconnect_attempts: 0,
            reconnect_at: None,
            last_qr: None,
            pending_prompt: None,
            ready_gauge_held: false,
            last_activity: Instant::now(),
        };
        tokio::spawn(supervisor.run(rx));
        handle
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<SupervisorCommand>) {
        let mut events: Option<mpsc::Receiver<AdapterEvent>> = None;
        let mut idle_check = tokio::time::interval(Duration::from_secs(3600));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(agent_id = %self.record.agent_id, platform = %self.record.platform,
              "Supervisor started");

        loop {
            let reconnect_at = self.reconnect_at;
            let action = tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut command_rx).await,
                    None => LoopAction::Break,
                },
                event = recv_or_pending(&mut events) => match event {
                    Some(event) => self.handle_adapter_event(event).await,
                    None => {
                        // Stream ended without a disconnect event.
                        debug!(agent_id = %self.record.agent_id, "Adapter stream closed");
                        self.on_disconnected("adapter stream closed".into(), true).await
                    }
                },
                _ = sleep_until_or_pending(reconnect_at) => {
                    self.reconnect_at = None;
                    self.try_connect().await
                }
                _ = idle_check.tick() => {
                    self.maybe_archive().await
                }
            };

            match action {
                LoopAction::Continue => {}
                LoopAction::Connected(rx) => events = Some(rx),
                LoopAction::DropStream => events = None,
                LoopAction::Break => break,
            }
        }

        info!(agent_id = %self.record.agent_id, "Supervisor stopped");
    }

    async fn handle_command(
        &mut self,
        command: SupervisorCommand,
        command_rx: &mut mpsc::Receiver<SupervisorCommand>,
    ) -> LoopAction {
        match command {
            SupervisorCommand::Connect { reply } => {
                self.last_activity = Instant::now();
                if matches!(
                    self.record.state,
                    AgentState::Ready | AgentState::Swarming | AgentState::Isolated
                ) {
                    let _ = reply.send(Ok(()));
                    return LoopAction::Continue;
                }
                self.reconnect_attempts = 0;
                let action = self.try_connect().await;
                let result = match &action {
                    LoopAction::Connected(_) => Ok(()),
                    _ => Err(HubError::Transient("connection attempt failed".into())),
                };
                let _ = reply.send(result);
                action
            }
            SupervisorCommand::Disconnect { reply } => {
                self.last_activity = Instant::now();
                self.reconnect_at = None;
                let _ = self.adapter.shutdown("disconnect requested").await;
                self.transition(AgentState::Disconnected).await;
                let _ = reply.send(Ok(()));
                LoopAction::DropStream
            }
            SupervisorCommand::SubmitAuth { kind, value, reply } => {
                self.last_activity = Instant::now();
                let result = self.adapter.submit_auth_value(kind, &value).await;
                if result.is_ok() {
                    self.pending_prompt = None;
                }
                let _ = reply.send(result);
                LoopAction::Continue
            }
            SupervisorCommand::Send { command, reply } => {
                self.last_activity = Instant::now();
                let result = self.handle_send(command).await;
                let _ = reply.send(result);
                LoopAction::Continue
            }
            SupervisorCommand::Status { reply } => {
                let _ = reply.send(StatusReport {
                    record: self.record.clone(),
                    qr: self
                        .last_qr
                        .as_ref()
                        .map(|bytes| general_purpose::STANDARD.encode(bytes)),
                    pending_prompt: self.pending_prompt,
                });
                LoopAction::Continue
            }
            SupervisorCommand::SetSwarm { enabled, reply } => {
                let target = if enabled {
                    AgentState::Swarming
                } else {
                    AgentState::Ready
                };
                if self.record.state.can_transition_to(target) {
                    self.record.swarm_enabled = enabled;
                    self.transition(target).await;
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(HubError::Validation(format!(
                        "cannot move from {} to {}",
                        self.record.state, target
                    ))));
                }
                LoopAction::Continue
            }
            SupervisorCommand::CrossAgentInvoke {
                source_agent_id,
                flow_name,
                payload,
                reply,
            } => {
                self.last_activity = Instant::now();
                let work = TriggerWork::CrossAgent {
                    target_agent_id: self.record.agent_id.clone(),
                    source_agent_id,
                    tenant: self.record.tenant.clone(),
                    flow_name,
                    payload,
                    reply,
                };
                if let Err(e) = self.deps.trigger_tx.send(work).await {
                    error!(agent_id = %self.record.agent_id, error = %e,
                           "Flow engine queue closed");
                }
                LoopAction::Continue
            }
            SupervisorCommand::TenantBroadcast { topic, payload } => {
                let work = TriggerWork::Broadcast {
                    agent_id: self.record.agent_id.clone(),
                    tenant: self.record.tenant.clone(),
                    topic,
                    payload,
                };
                let _ = self.deps.trigger_tx.send(work).await;
                LoopAction::Continue
            }
            SupervisorCommand::Shutdown { reply } => {
                self.drain_and_shutdown(command_rx).await;
                let _ = reply.send(());
                LoopAction::Break
            }
        }
    }

    /// Drain queued sends for up to the grace window, then close the adapter.
    async fn drain_and_shutdown(&mut self, command_rx: &mut mpsc::Receiver<SupervisorCommand>) {
        let deadline = Instant::now() + self.config.shutdown_grace;

        while Instant::now() < deadline {
            match command_rx.try_recv() {
                Ok(SupervisorCommand::Send { command, reply }) => {
                    let result = self.handle_send(command).await;
                    let _ = reply.send(result);
                }
                Ok(SupervisorCommand::Status { reply }) => {
                    let _ = reply.send(StatusReport {
                        record: self.record.clone(),
                        qr: None,
                        pending_prompt: self.pending_prompt,
                    });
                }
                Ok(SupervisorCommand::Shutdown { reply }) => {
                    let _ = reply.send(());
                }
                Ok(_) => {
                    // Control commands during shutdown are dropped.
                }
                Err(_) => break,
            }
        }

        let _ = self.adapter.shutdown("hub shutting down").await;
        if self.record.state.can_transition_to(AgentState::Disconnected) {
            self.transition(AgentState::Disconnected).await;
        }
    }

    async fn try_connect(&mut self) -> LoopAction {
        if matches!(
            self.record.state,
            AgentState::Failed | AgentState::Archived
        ) {
            return LoopAction::Continue;
        }

        self.transition(AgentState::Authenticating).await;

        match self.adapter.initialize().await {
            Ok(rx) => {
                debug!(agent_id = %self.record.agent_id, "Adapter initialized");
                LoopAction::Connected(rx)
            }
            Err(e) if e.is_transient() => {
                warn!(agent_id = %self.record.agent_id, error = %e, "Adapter init failed");
                self.schedule_reconnect().await
            }
            Err(e) => {
                error!(agent_id = %self.record.agent_id, error = %e,
                       "Adapter init failed fatally");
                let _ = self.deps.sessions.revoke(&self.record.agent_id).await;
                self.transition(AgentState::Failed).await;
                LoopAction::Continue
            }
        }
    }

    /// Exponential backoff with full jitter; `reconnect_cap` consecutive
    /// failures park the agent in `failed`.
    async fn schedule_reconnect(&mut self) -> LoopAction {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.reconnect_cap {
            error!(agent_id = %self.record.agent_id, attempts = self.reconnect_attempts,
                   "Reconnect cap exhausted");
            self.transition(AgentState::Failed).await;
            return LoopAction::Continue;
        }

        let exp = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(self.reconnect_attempts - 1))
            .min(self.config.backoff_cap);
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        let delay = Duration::from_millis(jittered.max(50));

        debug!(agent_id = %self.record.agent_id, attempt = self.reconnect_attempts,
               delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + delay);
        LoopAction::Continue
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) -> LoopAction {
        self.last_activity = Instant::now();
        match event {
            AdapterEvent::QrIssued { bytes } => {
                self.last_qr = Some(bytes.clone());
                let mut artifact = self
                    .deps
                    .sessions
                    .fresh(&self.record.agent_id, self.record.platform);
                artifact.status = ArtifactStatus::Pending;
                let _ = self.deps.sessions.save(&artifact).await;

                self.publish(
                    &agent_topic(&self.record.agent_id, "qr"),
                    HubFrame::Qr {
                        agent_id: self.record.agent_id.clone(),
                        bytes: general_purpose::STANDARD.encode(&bytes),
                    },
                )
                .await;
                LoopAction::Continue
            }
            AdapterEvent::AuthPromptRequired { kind } => {
                self.pending_prompt = Some(kind);
                if let Ok(Some(mut artifact)) =
                    self.deps.sessions.load(&self.record.agent_id).await
                {
                    artifact.status = ArtifactStatus::AwaitingUserInput(kind);
                    let _ = self.deps.sessions.save(&artifact).await;
                } else {
                    let mut artifact = self
                        .deps
                        .sessions
                        .fresh(&self.record.agent_id, self.record.platform);
                    artifact.status = ArtifactStatus::AwaitingUserInput(kind);
                    let _ = self.deps.sessions.save(&artifact).await;
                }

                self.publish(
                    &agent_topic(&self.record.agent_id, "auth"),
                    HubFrame::AuthPrompt {
                        agent_id: self.record.agent_id.clone(),
                        kind,
                    },
                )
                .await;
                LoopAction::Continue
            }
            AdapterEvent::Authenticated { info } => {
                // QR is cleared from state the moment auth completes.
                self.last_qr = None;
                self.pending_prompt = None;

                let mut artifact = self
                    .deps
                    .sessions
                    .fresh(&self.record.agent_id, self.record.platform);
                artifact.status = ArtifactStatus::Complete;
                artifact.blob = serde_json::to_vec(&info).unwrap_or_default();
                if let Err(e) = self.deps.sessions.save(&artifact).await {
                    error!(agent_id = %self.record.agent_id, error = %e,
                           "Failed to persist session artifact");
                }
                LoopAction::Continue
            }
            AdapterEvent::Ready { info } => {
                debug!(agent_id = %self.record.agent_id, account = %info.account_id,
                       "Transport session ready");
                self.reconnect_attempts = 0;
                self.transition(AgentState::Ready).await;
                LoopAction::Continue
            }
            AdapterEvent::InboundMessage(message) => {
                self.ingest_message(message).await;
                LoopAction::Continue
            }
            AdapterEvent::MessageEdited {
                message_id,
                new_body,
                ..
            } => {
                let _ = self
                    .deps
                    .persistence
                    .append_tombstone(&self.record.agent_id, &message_id, "edit", Some(&new_body))
                    .await;
                LoopAction::Continue
            }
            AdapterEvent::MessageDeleted { message_id, .. } => {
                let _ = self
                    .deps
                    .persistence
                    .append_tombstone(&self.record.agent_id, &message_id, "delete", None)
                    .await;
                LoopAction::Continue
            }
            AdapterEvent::Typing { chat_id, sender_id } => {
                debug!(agent_id = %self.record.agent_id, chat_id = %chat_id,
                       sender_id = %sender_id, "Typing notification");
                LoopAction::Continue
            }
            AdapterEvent::Disconnected { reason, recoverable } => {
                self.on_disconnected(reason, recoverable).await
            }
            AdapterEvent::FatalError { reason } => {
                error!(agent_id = %self.record.agent_id, reason = %reason, "Adapter fatal error");
                self.transition(AgentState::Failed).await;
                LoopAction::DropStream
            }
        }
    }

    async fn on_disconnected(&mut self, reason: String, recoverable: bool) -> LoopAction {
        warn!(agent_id = %self.record.agent_id, reason = %reason, recoverable,
              "Agent disconnected");
        self.transition(AgentState::Disconnected).await;

        if recoverable {
            self.schedule_reconnect().await;
        } else {
            let _ = self.deps.sessions.revoke(&self.record.agent_id).await;
            self.transition(AgentState::Failed).await;
        }
        LoopAction::DropStream
    }

    /// Ingest pipeline: de-dup, media admission, persist, publish, trigger.
    async fn ingest_message(&mut self, mut message: UnifiedMessage) {
        if message.has_media {
            let media_ref = MediaRef {
                message_id: message.id.clone(),
                chat_id: message.chat_id.clone(),
                meta: message.meta.clone(),
            };
            match self.adapter.download_media(&media_ref).await {
                Ok(blob) => {
                    match self
                        .deps
                        .media
                        .put(
                            &self.record.agent_id,
                            &blob.bytes,
                            &blob.mime_type,
                            blob.original_name.as_deref(),
                        )
                        .await
                    {
                        Ok(key) => {
                            let _ = self
                                .deps
                                .persistence
                                .upsert_media_metadata(
                                    &self.record.agent_id,
                                    &key,
                                    &blob.mime_type,
                                    blob.original_name.as_deref(),
                                    blob.bytes.len() as u64,
                                )
                                .await;
                            if let Value::Object(meta) = &mut message.meta {
                                meta.insert("mediaKey".to_string(), json!(key));
                            }
                        }
                        Err(e) => {
                            warn!(agent_id = %self.record.agent_id, error = %e,
                                  "Media cache admission failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(agent_id = %self.record.agent_id, message_id = %message.id,
                          error = %e, "Media download failed");
                }
            }
        }

        match self.deps.persistence.insert_message(&message).await {
            Ok(true) => {
                self.deps.metrics.messages_ingested.inc();
                self.publish(
                    &agent_topic(&self.record.agent_id, "message"),
                    HubFrame::Message {
                        agent_id: self.record.agent_id.clone(),
                        message: message.clone(),
                    },
                )
                .await;

                let work = TriggerWork::Inbound {
                    agent_id: self.record.agent_id.clone(),
                    tenant: self.record.tenant.clone(),
                    message,
                };
                if self.deps.trigger_tx.send(work).await.is_err() {
                    error!(agent_id = %self.record.agent_id, "Flow engine queue closed");
                }
            }
            Ok(false) => {
                debug!(agent_id = %self.record.agent_id, message_id = %message.id,
                       "Duplicate message dropped");
                self.deps.metrics.messages_deduplicated.inc();
            }
            Err(e) => {
                error!(agent_id = %self.record.agent_id, message_id = %message.id,
                       error = %e, "Failed to persist message");
            }
        }
    }

    async fn handle_send(&mut self, command: SendCommand) -> Result<SendReceipt, HubError> {
        if !matches!(
            self.record.state,
            AgentState::Ready | AgentState::Swarming | AgentState::Isolated
        ) {
            return Err(HubError::Validation(format!(
                "agent {} is {}, not ready to send",
                self.record.agent_id, self.record.state
            )));
        }

        match self
            .deps
            .limiter
            .try_acquire(Scope::Agent, &self.record.agent_id, 1)
            .await
        {
            Ok(Acquire::Granted) => {}
            Ok(Acquire::RetryAfter { retry_after_ms }) => {
                return Err(HubError::Busy { retry_after_ms })
            }
            Err(e) => {
                warn!(agent_id = %self.record.agent_id, error = %e,
                      "Rate limiter unavailable, allowing send");
            }
        }

        let receipt = self.adapter.send(command.clone()).await?;
        self.deps.metrics.messages_sent.inc();

        let outbound = outbound_record(&self.record, &command, &receipt);
        if let Some(outbound) = outbound {
            let _ = self.deps.persistence.insert_message(&outbound).await;
            self.publish(
                &agent_topic(&self.record.agent_id, "message"),
                HubFrame::Message {
                    agent_id: self.record.agent_id.clone(),
                    message: outbound,
                },
            )
            .await;
        }
        Ok(receipt)
    }

    async fn maybe_archive(&mut self) -> LoopAction {
        if self.record.state == AgentState::Disconnected
            && self.last_activity.elapsed() >= self.config.archive_after
        {
            info!(agent_id = %self.record.agent_id, "Archiving idle agent");
            self.transition(AgentState::Archived).await;
            return LoopAction::Break;
        }
        LoopAction::Continue
    }

    async fn transition(&mut self, to: AgentState) {
        if self.record.state == to {
            return;
        }
        if !self.record.state.can_transition_to(to) {
            warn!(agent_id = %self.record.agent_id, from = %self.record.state, to = %to,
                  "Illegal state transition suppressed");
            return;
        }

        let from = self.record.state;
        self.record.state = to;
        log_state_transition!(self.record.agent_id, from, to);

        let connected = matches!(
            to,
            AgentState::Ready | AgentState::Swarming | AgentState::Isolated
        );
        if connected && !self.ready_gauge_held {
            self.deps.metrics.connected_agents.inc();
            self.ready_gauge_held = true;
        } else if !connected && self.ready_gauge_held {
            self.deps.metrics.connected_agents.dec();
            self.ready_gauge_held = false;
        }

        if let Err(e) = self
            .deps
            .persistence
            .update_agent_state(&self.record.agent_id, to)
            .await
        {
            error!(agent_id = %self.record.agent_id, error = %e,
                   "Failed to persist agent state");
        }

        self.publish(
            &agent_topic(&self.record.agent_id, "status"),
            HubFrame::Status {
                agent_id: self.record.agent_id.clone(),
                from,
                to,
                at: crate::agents::types::now_ms(),
            },
        )
        .await;
    }

    async fn publish(&self, topic: &str, frame: HubFrame) {
        self.deps.hub.publish(&self.record.tenant, topic, frame).await;
    }
}

/// Build the persisted outbound record for a completed send. Control-style
/// commands (reaction, delete) leave no message row.
fn outbound_record(
    record: &AgentRecord,
    command: &SendCommand,
    receipt: &SendReceipt,
) -> Option<UnifiedMessage> {
    let (kind, body) = match command {
        SendCommand::Text { body, .. } => (MessageKind::Text, body.clone()),
        SendCommand::Media { caption, .. } => (MessageKind::Document, caption.clone()),
        SendCommand::Location {
            latitude, longitude, ..
        } => (
            MessageKind::Location,
            format!("{},{}", latitude, longitude),
        ),
        SendCommand::Contact { name, phone, .. } => {
            (MessageKind::Contact, format!("{} {}", name, phone))
        }
        SendCommand::Buttons { body, .. } => (MessageKind::Text, body.clone()),
        SendCommand::Poll { question, .. } => (MessageKind::Poll, question.clone()),
        SendCommand::Edit { body, .. } => (MessageKind::Text, body.clone()),
        SendCommand::Forward { .. } | SendCommand::Reaction { .. } | SendCommand::Delete { .. } => {
            return None
        }
    };

    Some(UnifiedMessage {
        id: crate::agents::types::prefixed_message_id(
            record.platform,
            &receipt.platform_message_id,
        ),
        agent_id: record.agent_id.clone(),
        platform: record.platform,
        direction: Direction::Outbound,
        chat_id: command.chat_id().to_string(),
        sender_id: String::new(),
        sender_name: record.display_name.clone(),
        body,
        timestamp: receipt.sent_at,
        kind,
        has_media: matches!(command, SendCommand::Media { .. }),
        from_me: true,
        reply_to: None,
        meta: json!({"sendKind": command.kind_str()}),
    })
}

async fn recv_or_pending(events: &mut Option<mpsc::Receiver<AdapterEvent>>) -> Option<AdapterEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
