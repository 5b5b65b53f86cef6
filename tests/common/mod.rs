#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use swarmhub::adapters::PlatformAdapter;
use swarmhub::agents::supervisor::{AgentSupervisor, SupervisorConfig, SupervisorDeps};
use swarmhub::agents::types::{now_ms, AgentRecord, AgentState, Platform, ReputationCounters};
use swarmhub::agents::{AgentHandle, AgentRegistry};
use swarmhub::ai::{AiRouter, Classifier, HealthConfig, HealthMonitor};
use swarmhub::bus::CrossAgentBus;
use swarmhub::flows::executor::{FlowEngineConfig, NoopRagClient};
use swarmhub::flows::{FlowEngine, FlowService, TriggerMatcher, TriggerWork};
use swarmhub::hub::SubscriptionHub;
use swarmhub::media::{MediaCache, MediaCacheConfig};
use swarmhub::ratelimit::RateLimiter;
use swarmhub::scheduler::Scheduler;
use swarmhub::storage::{Persistence, PersistenceConfig, SessionStore};
use swarmhub::utils::HubMetrics;

/// A fully wired in-process hub over a scratch database, with no external
/// transports. Tests plug mock adapters in.
pub struct TestHub {
    pub persistence: Arc<Persistence>,
    pub sessions: Arc<SessionStore>,
    pub media: Arc<MediaCache>,
    pub hub: Arc<SubscriptionHub>,
    pub metrics: Arc<HubMetrics>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<AgentRegistry>,
    pub flows: Arc<FlowService>,
    pub bus: Arc<CrossAgentBus>,
    pub engine: Arc<FlowEngine>,
    pub scheduler: Arc<Scheduler>,
    pub trigger_tx: mpsc::Sender<TriggerWork>,
    pub deps: SupervisorDeps,
    _dir: TempDir,
}

pub async fn test_hub() -> TestHub {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(HubMetrics::new().unwrap());

    let persistence = Arc::new(
        Persistence::new(PersistenceConfig {
            database_path: dir.path().join("hub.db").to_string_lossy().to_string(),
            max_connections: 4,
            retention_days: 30,
        })
        .await
        .unwrap(),
    );
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions"), None).unwrap());
    let media = Arc::new(
        MediaCache::new(MediaCacheConfig {
            root: dir.path().join("media"),
            ttl: Duration::from_secs(3600),
            max_bytes_per_agent: 8 * 1024 * 1024,
        })
        .unwrap(),
    );
    let hub = Arc::new(SubscriptionHub::new(64, metrics.clone()));
    let limiter = Arc::new(RateLimiter::in_memory(RateLimiter::default_configs()));
    let registry = Arc::new(AgentRegistry::new());

    let (trigger_tx, trigger_rx) = mpsc::channel(256);

    let deps = SupervisorDeps {
        persistence: persistence.clone(),
        media: media.clone(),
        hub: hub.clone(),
        sessions: sessions.clone(),
        metrics: metrics.clone(),
        limiter: limiter.clone(),
        trigger_tx: trigger_tx.clone(),
    };

    let flows = Arc::new(FlowService::new(persistence.clone()));
    let matcher = Arc::new(TriggerMatcher::new(flows.clone()));
    let bus = Arc::new(CrossAgentBus::new(
        registry.clone(),
        hub.clone(),
        persistence.clone(),
    ));
    let scheduler = Scheduler::new(trigger_tx.clone(), persistence.clone());
    scheduler.spawn_worker();

    let health = HealthMonitor::new(Vec::new(), HealthConfig::default(), persistence.clone());
    let ai = Arc::new(AiRouter::new(
        health,
        Default::default(),
        Classifier::new(Duration::from_secs(60)),
        limiter.clone(),
        persistence.clone(),
        metrics.clone(),
    ));

    let engine = FlowEngine::new(
        flows.clone(),
        matcher,
        registry.clone(),
        bus.clone(),
        ai,
        Arc::new(NoopRagClient),
        scheduler.clone(),
        persistence.clone(),
        metrics.clone(),
        FlowEngineConfig {
            execution_timeout: Duration::from_secs(10),
            ..FlowEngineConfig::default()
        },
    );
    engine.spawn_dispatcher(trigger_rx);

    TestHub {
        persistence,
        sessions,
        media,
        hub,
        metrics,
        limiter,
        registry,
        flows,
        bus,
        engine,
        scheduler,
        trigger_tx,
        deps,
        _dir: dir,
    }
}

impl TestHub {
    /// Create an agent record, spawn its supervisor over the given adapter
    /// and register the handle.
    pub async fn spawn_agent(
        &self,
        agent_id: &str,
        tenant: &str,
        platform: Platform,
        adapter: Arc<dyn PlatformAdapter>,
    ) -> AgentHandle {
        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            display_name: agent_id.to_string(),
            platform,
            transport_config: serde_json::json!({}),
            tenant: tenant.to_string(),
            browser_session: None,
            swarm_enabled: false,
            reputation: ReputationCounters::default(),
            state: AgentState::Created,
            created_at: now_ms(),
        };
        self.persistence.upsert_agent(&record).await.unwrap();

        let handle = AgentSupervisor::spawn(
            record,
            adapter,
            self.deps.clone(),
            SupervisorConfig {
                backoff_base: Duration::from_millis(20),
                backoff_cap: Duration::from_millis(100),
                shutdown_grace: Duration::from_millis(500),
                ..SupervisorConfig::default()
            },
        );
        self.registry.register(handle.clone()).await;
        handle
    }
}

/// Poll until the agent reaches the given state or the deadline passes.
pub async fn wait_state(
    handle: &AgentHandle,
    state: swarmhub::agents::types::AgentState,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(status) = handle.status().await {
            if status.record.state == state {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until the agent raises the given auth prompt.
pub async fn wait_prompt(
    handle: &AgentHandle,
    kind: swarmhub::agents::types::AuthPromptKind,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(status) = handle.status().await {
            if status.pending_prompt == Some(kind) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until the mock adapter has recorded at least `min` sends.
pub async fn wait_sent(
    adapter: &swarmhub::adapters::mock::MockAdapter,
    min: usize,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if adapter.sent_commands().await.len() >= min {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until a message with the given ID is persisted.
pub async fn wait_message(
    persistence: &Persistence,
    agent_id: &str,
    message_id: &str,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if persistence
            .message_exists(agent_id, message_id)
            .await
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
