use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::email::EmailAdapter;
use crate::adapters::telegram_bot::TelegramBotAdapter;
use crate::adapters::telegram_user::TelegramUserAdapter;
use crate::adapters::whatsapp::WhatsAppAdapter;
use crate::adapters::PlatformAdapter;
use crate::agents::registry::AgentRegistry;
use crate::agents::supervisor::{AgentHandle, AgentSupervisor, SupervisorConfig, SupervisorDeps};
use crate::agents::types::{now_ms, AgentRecord, AgentState, Platform, ReputationCounters};
use crate::storage::ArtifactStatus;
use crate::utils::HubError;

/// Creates, restores and tears down agents: builds the matching adapter for
/// each transport and spawns the supervisor that owns it.
pub struct AgentManager {
    deps: SupervisorDeps,
    registry: Arc<AgentRegistry>,
    supervisor_config: SupervisorConfig,
    event_queue: usize,
}

impl AgentManager {
    pub fn new(
        deps: SupervisorDeps,
        registry: Arc<AgentRegistry>,
        supervisor_config: SupervisorConfig,
        event_queue: usize,
    ) -> Self {
        Self {
            deps,
            registry,
            supervisor_config,
            event_queue,
        }
    }

    /// Create a brand-new agent: persist the record and spawn its supervisor.
    pub async fn create_agent(
        &self,
        tenant: &str,
        display_name: &str,
        platform: Platform,
        transport_config: Value,
        browser_session: Option<String>,
        swarm_enabled: bool,
    ) -> Result<AgentRecord, HubError> {
        let record = AgentRecord {
            agent_id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            platform,
            transport_config,
            tenant: tenant.to_string(),
            browser_session,
            swarm_enabled,
            reputation: ReputationCounters::default(),
            state: AgentState::Created,
            created_at: now_ms(),
        };

        // Validate the transport config by constructing the adapter up front.
        let adapter = self.build_adapter(&record)?;

        self.deps
            .persistence
            .upsert_agent(&record)
            .await
            .map_err(|e| HubError::Fatal(format!("failed to persist agent: {}", e)))?;

        let handle = AgentSupervisor::spawn(
            record.clone(),
            adapter,
            self.deps.clone(),
            self.supervisor_config.clone(),
        );
        self.registry.register(handle).await;

        info!(agent_id = %record.agent_id, platform = %platform, tenant = %tenant,
              "Agent created");
        Ok(record)
    }

    /// Spawn a supervisor for a persisted record at boot. Returns whether the
    /// agent should be auto-connected.
    pub async fn restore_agent(&self, mut record: AgentRecord) -> Result<bool, HubError> {
        if matches!(record.state, AgentState::Archived) {
            return Ok(false);
        }

        let was_connected = matches!(
            record.state,
            AgentState::Ready | AgentState::Swarming | AgentState::Isolated
        );
        // Runtime state does not survive restart; everything starts
        // disconnected and reconnects from its session artifact.
        if record.state != AgentState::Created && record.state != AgentState::Failed {
            record.state = AgentState::Disconnected;
        }

        let adapter = self.build_adapter(&record)?;
        let handle = AgentSupervisor::spawn(
            record.clone(),
            adapter,
            self.deps.clone(),
            self.supervisor_config.clone(),
        );
        self.registry.register(handle).await;

        if !was_connected {
            return Ok(false);
        }
        match self.deps.sessions.load(&record.agent_id).await {
            Ok(Some(artifact)) => {
                Ok(!artifact.revoked && artifact.status == ArtifactStatus::Complete)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(agent_id = %record.agent_id, error = %e,
                      "Failed to read session artifact, skipping auto-connect");
                Ok(false)
            }
        }
    }

    /// Tear an agent down completely: supervisor, registry entry, session
    /// artifacts and persisted rows.
    pub async fn delete_agent(&self, tenant: &str, agent_id: &str) -> Result<(), HubError> {
        let handle = self.registry.get(tenant, agent_id).await?;
        handle.shutdown().await;
        self.registry.remove(agent_id).await;

        self.deps
            .sessions
            .delete(agent_id)
            .await
            .map_err(|e| HubError::Fatal(format!("failed to delete session dir: {}", e)))?;
        self.deps
            .persistence
            .delete_agent(agent_id)
            .await
            .map_err(|e| HubError::Fatal(format!("failed to delete agent rows: {}", e)))?;

        info!(agent_id = %agent_id, "Agent deleted");
        Ok(())
    }

    fn build_adapter(&self, record: &AgentRecord) -> Result<Arc<dyn PlatformAdapter>, HubError> {
        let adapter: Arc<dyn PlatformAdapter> = match record.platform {
            Platform::TelegramBot => Arc::new(TelegramBotAdapter::new(
                &record.agent_id,
                &record.transport_config,
                self.deps.media.clone(),
                self.event_queue,
            )?),
            Platform::TelegramUser => Arc::new(TelegramUserAdapter::new(
                &record.agent_id,
                &record.transport_config,
                self.deps.media.clone(),
                self.event_queue,
            )?),
            Platform::Whatsapp => Arc::new(WhatsAppAdapter::new(
                &record.agent_id,
                &record.transport_config,
                self.deps.media.clone(),
                self.event_queue,
            )?),
            Platform::Email => Arc::new(EmailAdapter::new(
                &record.agent_id,
                &record.transport_config,
                self.deps.media.clone(),
                self.event_queue,
            )?),
        };
        Ok(adapter)
    }
}
