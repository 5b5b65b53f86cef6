use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use warp::Filter;

mod adapters;
mod agents;
mod ai;
mod api;
mod bus;
mod config;
mod flows;
mod hub;
mod media;
mod ratelimit;
mod scheduler;
mod storage;
mod utils;

use agents::{AgentManager, AgentRegistry, SupervisorConfig, SupervisorDeps};
use ai::{AiRouter, Classifier, HealthConfig, HealthMonitor};
use api::ws::WsState;
use api::ApiState;
use bus::CrossAgentBus;
use config::Config;
use flows::executor::{FlowEngineConfig, NoopRagClient};
use flows::{FlowEngine, FlowService, TriggerMatcher};
use hub::SubscriptionHub;
use media::{MediaCache, MediaCacheConfig};
use ratelimit::RateLimiter;
use scheduler::Scheduler;
use storage::{Persistence, PersistenceConfig, SessionStore};
use utils::{BlobCipher, HubMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory")
            && !e.to_string().contains("system cannot find the file")
        {
            eprintln!("Failed to load .env file: {}", e);
        }
    }

    let config = Config::load()?;
    utils::setup_logging(&config.logging.log_level)?;

    info!("Starting swarmhub v{}", env!("CARGO_PKG_VERSION"));
    #[cfg(debug_assertions)]
    warn!("Running in DEBUG mode - rebuild with --release for production");

    let metrics = Arc::new(HubMetrics::new()?);

    // Persistence and session storage come up first; everything else hangs
    // off them.
    let persistence = Arc::new(
        Persistence::new(PersistenceConfig {
            database_path: config.storage.database_path.to_string_lossy().to_string(),
            max_connections: 10,
            retention_days: 90,
        })
        .await
        .context("persistence initialization failed")?,
    );

    let cipher = if config.security.encryption_key.is_empty() {
        None
    } else {
        Some(Arc::new(
            BlobCipher::new(&config.security.encryption_key)
                .context("invalid encryption key")?,
        ))
    };
    let sessions = Arc::new(SessionStore::new(
        config.storage.session_root_path.clone(),
        cipher,
    )?);

    let media = Arc::new(MediaCache::new(MediaCacheConfig {
        root: config.storage.media_root_path.clone(),
        ttl: Duration::from_secs(config.media.ttl_secs),
        max_bytes_per_agent: config.media.max_bytes_per_agent,
    })?);
    {
        let media = media.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                media.sweep_expired().await;
            }
        });
    }

    let limiter = match &config.storage.redis_url {
        Some(url) => match RateLimiter::with_redis(url, RateLimiter::default_configs()).await {
            Ok(limiter) => {
                info!("Rate limiter using Redis backplane");
                Arc::new(limiter)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, falling back to in-memory rate limiter");
                Arc::new(RateLimiter::in_memory(RateLimiter::default_configs()))
            }
        },
        None => Arc::new(RateLimiter::in_memory(RateLimiter::default_configs())),
    };

    let subscription_hub = Arc::new(SubscriptionHub::new(
        config.runtime.outbound_queue_size,
        metrics.clone(),
    ));
    let registry = Arc::new(AgentRegistry::new());

    // The trigger queue decouples supervisors from the flow engine.
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(1024);

    let deps = SupervisorDeps {
        persistence: persistence.clone(),
        media: media.clone(),
        hub: subscription_hub.clone(),
        sessions: sessions.clone(),
        metrics: metrics.clone(),
        limiter: limiter.clone(),
        trigger_tx: trigger_tx.clone(),
    };
    let supervisor_config = SupervisorConfig {
        reconnect_cap: config.runtime.default_reconnect_cap,
        command_queue: config.runtime.outbound_queue_size,
        shutdown_grace: Duration::from_millis(config.runtime.shutdown_grace_ms),
        ..SupervisorConfig::default()
    };
    let manager = Arc::new(AgentManager::new(
        deps,
        registry.clone(),
        supervisor_config,
        config.runtime.inbound_queue_size,
    ));

    // Flows, matcher, AI stack.
    let flows = Arc::new(FlowService::new(persistence.clone()));
    flows.load_all().await?;
    let matcher = Arc::new(TriggerMatcher::new(flows.clone()));

    let health = HealthMonitor::new(
        config.ai.providers.clone(),
        HealthConfig {
            probe_interval: Duration::from_secs(config.ai.probe_interval_secs),
            unhealthy_threshold: config.ai.unhealthy_threshold,
            recovery_window: Duration::from_secs(config.ai.recovery_secs),
        },
        persistence.clone(),
    );
    health.spawn_probe_loop();
    let ai = Arc::new(AiRouter::new(
        health.clone(),
        config.ai.failover.clone(),
        Classifier::new(Duration::from_secs(config.ai.classification_cache_ttl_secs)),
        limiter.clone(),
        persistence.clone(),
        metrics.clone(),
    ));

    let bus = Arc::new(CrossAgentBus::new(
        registry.clone(),
        subscription_hub.clone(),
        persistence.clone(),
    ));

    let scheduler = Scheduler::new(trigger_tx.clone(), persistence.clone());
    scheduler.replay_persisted().await;
    scheduler.sync_cron(&flows).await;
    scheduler.spawn_worker();

    let engine = FlowEngine::new(
        flows.clone(),
        matcher.clone(),
        registry.clone(),
        bus.clone(),
        ai.clone(),
        Arc::new(NoopRagClient),
        scheduler.clone(),
        persistence.clone(),
        metrics.clone(),
        FlowEngineConfig {
            execution_timeout: Duration::from_millis(config.runtime.default_execution_timeout_ms),
            max_concurrent_per_agent: config.runtime.max_concurrent_executions_per_agent,
            ..FlowEngineConfig::default()
        },
    );
    engine.spawn_dispatcher(trigger_rx);

    // Restore persisted agents; reconnect the ones that were live.
    let records = persistence.all_agents().await?;
    let mut auto_connect = Vec::new();
    for record in records {
        let agent_id = record.agent_id.clone();
        match manager.restore_agent(record).await {
            Ok(true) => auto_connect.push(agent_id),
            Ok(false) => {}
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to restore agent"),
        }
    }
    info!(
        restored = registry.len().await,
        reconnecting = auto_connect.len(),
        "Agents restored from persistence"
    );
    for agent_id in auto_connect {
        if let Some(tenant) = registry.tenant_of(&agent_id).await {
            if let Ok(handle) = registry.get(&tenant, &agent_id).await {
                tokio::spawn(async move {
                    if let Err(e) = handle.connect().await {
                        warn!(agent_id = %handle.agent_id, error = %e, "Auto-reconnect failed");
                    }
                });
            }
        }
    }

    // Admin API.
    let api_state = Arc::new(ApiState {
        registry: registry.clone(),
        manager: manager.clone(),
        persistence: persistence.clone(),
        flows: flows.clone(),
        engine: engine.clone(),
        ai: ai.clone(),
        hub: subscription_hub.clone(),
        metrics: metrics.clone(),
        trigger_tx: trigger_tx.clone(),
        snapshot_message_count: config.runtime.snapshot_message_count,
    });
    let api_port = config.server.api_port;
    let cors = if config.server.cors_origins.is_empty() {
        warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["content-type", "x-tenant"])
            .allow_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE"])
    } else {
        let mut cors = warp::cors()
            .allow_headers(vec!["content-type", "x-tenant"])
            .allow_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE"]);
        for origin in &config.server.cors_origins {
            cors = cors.allow_origin(origin.as_str());
        }
        cors
    };
    tokio::spawn(async move {
        warp::serve(api::routes(api_state).with(cors))
            .run(([0, 0, 0, 0], api_port))
            .await;
    });
    info!("Admin API listening on port {}", api_port);

    // Subscriber channel.
    let ws_state = Arc::new(WsState {
        hub: subscription_hub.clone(),
        registry: registry.clone(),
        persistence: persistence.clone(),
        snapshot_message_count: config.runtime.snapshot_message_count,
    });
    let ws_port = config.server.ws_port;
    tokio::spawn(async move {
        warp::serve(api::ws::ws_route(ws_state))
            .run(([0, 0, 0, 0], ws_port))
            .await;
    });
    info!("Subscriber channel listening on port {}", ws_port);

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received, draining supervisors");

    scheduler.stop();
    health.stop();

    let handles = registry.all().await;
    let drains: Vec<_> = handles
        .into_iter()
        .map(|handle| {
            tokio::spawn(async move {
                handle.shutdown().await;
            })
        })
        .collect();
    for drain in drains {
        if let Err(e) = drain.await {
            error!(error = %e, "Supervisor drain task failed");
        }
    }

    info!("Swarmhub stopped");
    Ok(())
}
