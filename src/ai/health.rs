use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::agents::types::now_ms;
use crate::ai::providers;
use crate::ai::types::{HealthStatus, ProviderHealth, ProviderProfile};
use crate::storage::Persistence;

/// Circuit thresholds and probe cadence.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub unhealthy_threshold: u32,
    pub recovery_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            unhealthy_threshold: 3,
            recovery_window: Duration::from_secs(60),
        }
    }
}

/// Single writer for provider health. The router reads immutable snapshots
/// and reports errors through `record_*`, which serialize per provider on
/// the inner lock.
pub struct HealthMonitor {
    config: HealthConfig,
    profiles: Vec<ProviderProfile>,
    health: RwLock<HashMap<String, ProviderHealth>>,
    persistence: Arc<Persistence>,
    http: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        profiles: Vec<ProviderProfile>,
        config: HealthConfig,
        persistence: Arc<Persistence>,
    ) -> Arc<Self> {
        let mut health = HashMap::new();
        for profile in &profiles {
            health.insert(profile.provider_id.clone(), ProviderHealth::default());
        }
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            profiles,
            health: RwLock::new(health),
            persistence,
            http: reqwest::Client::new(),
            shutdown,
        })
    }

    pub fn profiles(&self) -> &[ProviderProfile] {
        &self.profiles
    }

    pub fn profile(&self, provider_id: &str) -> Option<&ProviderProfile> {
        self.profiles.iter().find(|p| p.provider_id == provider_id)
    }

    pub async fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.health.read().await.clone()
    }

    /// Whether the router may try this provider: circuit must not be open.
    pub async fn is_available(&self, provider_id: &str) -> bool {
        let health = self.health.read().await;
        health
            .get(provider_id)
            .map(|h| h.status != HealthStatus::Unhealthy)
            .unwrap_or(false)
    }

    pub async fn record_success(&self, provider_id: &str, latency_ms: u64) {
        let mut health = self.health.write().await;
        if let Some(entry) = health.get_mut(provider_id) {
            entry.status = HealthStatus::Healthy;
            entry.consecutive_errors = 0;
            entry.last_latency_ms = Some(latency_ms);
            entry.recovery_at = None;
        }
        drop(health);
        self.persist(provider_id).await;
    }

    pub async fn record_error(&self, provider_id: &str) {
        let mut trip = false;
        {
            let mut health = self.health.write().await;
            if let Some(entry) = health.get_mut(provider_id) {
                entry.consecutive_errors += 1;
                if entry.consecutive_errors >= self.config.unhealthy_threshold {
                    if entry.status != HealthStatus::Unhealthy {
                        trip = true;
                    }
                    entry.status = HealthStatus::Unhealthy;
                    entry.recovery_at =
                        Some(now_ms() + self.config.recovery_window.as_millis() as i64);
                } else {
                    entry.status = HealthStatus::Degraded;
                }
            }
        }
        if trip {
            warn!(provider = %provider_id, "Provider circuit opened");
        }
        self.persist(provider_id).await;
    }

    /// Probe every provider once. Unhealthy providers are only probed after
    /// their recovery window; a successful probe closes the circuit.
    pub async fn probe_all(&self) {
        for profile in &self.profiles {
            let skip = {
                let health = self.health.read().await;
                match health.get(&profile.provider_id) {
                    Some(h) if h.status == HealthStatus::Unhealthy => h
                        .recovery_at
                        .map(|at| now_ms() < at)
                        .unwrap_or(false),
                    _ => false,
                }
            };
            if skip {
                debug!(provider = %profile.provider_id, "Circuit still in recovery window");
                continue;
            }

            match providers::probe(&self.http, profile).await {
                Ok(latency_ms) => {
                    let mut health = self.health.write().await;
                    if let Some(entry) = health.get_mut(&profile.provider_id) {
                        if entry.status == HealthStatus::Unhealthy {
                            info!(provider = %profile.provider_id, "Provider circuit closed");
                        }
                        entry.status = HealthStatus::Healthy;
                        entry.consecutive_errors = 0;
                        entry.last_latency_ms = Some(latency_ms);
                        entry.last_probe_at = Some(now_ms());
                        entry.recovery_at = None;
                    }
                    drop(health);
                    self.persist(&profile.provider_id).await;
                }
                Err(e) => {
                    debug!(provider = %profile.provider_id, error = %e, "Probe failed");
                    let mut health = self.health.write().await;
                    if let Some(entry) = health.get_mut(&profile.provider_id) {
                        entry.last_probe_at = Some(now_ms());
                        if entry.status == HealthStatus::Unknown {
                            entry.status = HealthStatus::Degraded;
                        }
                    }
                    drop(health);
                    self.persist(&profile.provider_id).await;
                }
            }
        }
    }

    /// Background probe loop; stops when `stop()` is called.
    pub fn spawn_probe_loop(self: &Arc<Self>) {
        let monitor = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.probe_all().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health probe loop stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn persist(&self, provider_id: &str) {
        let entry = {
            let health = self.health.read().await;
            health.get(provider_id).cloned()
        };
        if let Some(entry) = entry {
            if let Err(e) = self
                .persistence
                .upsert_provider_health(
                    provider_id,
                    entry.status.as_str(),
                    entry.consecutive_errors,
                    entry.last_latency_ms,
                    entry.last_probe_at,
                )
                .await
            {
                warn!(provider = %provider_id, error = %e, "Failed to persist provider health");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ProviderKind;
    use crate::storage::PersistenceConfig;
    use tempfile::TempDir;

    async fn monitor() -> (Arc<HealthMonitor>, TempDir) {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(
            Persistence::new(PersistenceConfig {
                database_path: dir.path().join("h.db").to_string_lossy().to_string(),
                max_connections: 2,
                retention_days: 30,
            })
            .await
            .unwrap(),
        );
        let profiles = vec![ProviderProfile {
            provider_id: "free-a".to_string(),
            kind: ProviderKind::RemoteFree,
            base_url: Some("http://localhost:1".to_string()),
            api_key: None,
            cost_per_token: None,
            capabilities: vec![],
            max_concurrent: 2,
            default_model: "m".to_string(),
            probe_path: None,
            cli_command: None,
        }];
        (
            HealthMonitor::new(profiles, HealthConfig::default(), persistence),
            dir,
        )
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold() {
        let (monitor, _dir) = monitor().await;

        // Unknown status counts as available.
        assert!(monitor.is_available("free-a").await);
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot["free-a"].status, HealthStatus::Unknown);

        monitor.record_error("free-a").await;
        monitor.record_error("free-a").await;
        assert!(monitor.is_available("free-a").await);

        monitor.record_error("free-a").await;
        assert!(!monitor.is_available("free-a").await);
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot["free-a"].status, HealthStatus::Unhealthy);
        assert!(snapshot["free-a"].recovery_at.is_some());
    }

    #[tokio::test]
    async fn success_closes_circuit() {
        let (monitor, _dir) = monitor().await;
        for _ in 0..3 {
            monitor.record_error("free-a").await;
        }
        assert!(!monitor.is_available("free-a").await);

        monitor.record_success("free-a", 12).await;
        assert!(monitor.is_available("free-a").await);
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot["free-a"].consecutive_errors, 0);
        assert_eq!(snapshot["free-a"].last_latency_ms, Some(12));
    }
}
