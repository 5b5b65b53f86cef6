use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::ai::classify::Classifier;
use crate::ai::health::HealthMonitor;
use crate::ai::providers::{self, ProviderStream};
use crate::ai::types::{AiTask, FailoverHierarchy, ProviderKind, ProviderProfile, RouteStream};
use crate::log_provider_failover;
use crate::ratelimit::{Acquire, RateLimiter, Scope};
use crate::storage::{AiUsageRow, Persistence};
use crate::utils::{HubError, HubMetrics};

/// Abstraction over the actual provider call so the chain walk is testable
/// without live backends.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        profile: &ProviderProfile,
        task: &AiTask,
    ) -> Result<ProviderStream, HubError>;
}

/// Default invoker speaking OpenAI-compatible HTTP (or a CLI pipe).
pub struct HttpInvoker {
    http: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(
        &self,
        profile: &ProviderProfile,
        task: &AiTask,
    ) -> Result<ProviderStream, HubError> {
        providers::invoke(&self.http, profile, task).await
    }
}

/// Walks the tier's provider chain with health-aware failover and streams the
/// first accepted response back to the caller.
pub struct AiRouter {
    health: Arc<HealthMonitor>,
    hierarchy: RwLock<FailoverHierarchy>,
    classifier: Classifier,
    limiter: Arc<RateLimiter>,
    persistence: Arc<Persistence>,
    metrics: Arc<HubMetrics>,
    invoker: Arc<dyn Invoker>,
    semaphores: HashMap<String, Arc<Semaphore>>,
}

impl AiRouter {
    pub fn new(
        health: Arc<HealthMonitor>,
        hierarchy: FailoverHierarchy,
        classifier: Classifier,
        limiter: Arc<RateLimiter>,
        persistence: Arc<Persistence>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self::with_invoker(
            health,
            hierarchy,
            classifier,
            limiter,
            persistence,
            metrics,
            Arc::new(HttpInvoker::new()),
        )
    }

    pub fn with_invoker(
        health: Arc<HealthMonitor>,
        hierarchy: FailoverHierarchy,
        classifier: Classifier,
        limiter: Arc<RateLimiter>,
        persistence: Arc<Persistence>,
        metrics: Arc<HubMetrics>,
        invoker: Arc<dyn Invoker>,
    ) -> Self {
        let semaphores = health
            .profiles()
            .iter()
            .map(|p| {
                (
                    p.provider_id.clone(),
                    Arc::new(Semaphore::new(p.max_concurrent)),
                )
            })
            .collect();

        Self {
            health,
            hierarchy: RwLock::new(hierarchy),
            classifier,
            limiter,
            persistence,
            metrics,
            invoker,
            semaphores,
        }
    }

    pub async fn hierarchy(&self) -> FailoverHierarchy {
        self.hierarchy.read().await.clone()
    }

    pub async fn set_hierarchy(&self, hierarchy: FailoverHierarchy) {
        *self.hierarchy.write().await = hierarchy;
        info!("Failover hierarchy replaced");
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Route a task: classify, look up the tier chain, walk it.
    pub async fn route(&self, task: AiTask) -> Result<RouteStream, HubError> {
        let tier = self.classifier.classify(&task).await;
        let mut chain = self.hierarchy.read().await.chain(tier);

        if task.prefer_free {
            // Stable partition: free providers first, relative order kept.
            chain.sort_by_key(|id| {
                self.health
                    .profile(id)
                    .map(|p| !p.kind.is_free())
                    .unwrap_or(true)
            });
        }

        if chain.is_empty() {
            return Err(HubError::NoProviderAvailable {
                reasons: vec![(tier.as_str().to_string(), "empty provider chain".to_string())],
            });
        }

        let mut reasons: Vec<(String, String)> = Vec::new();
        let mut previous: Option<String> = None;

        for provider_id in chain {
            let Some(profile) = self.health.profile(&provider_id) else {
                reasons.push((provider_id.clone(), "unknown provider".to_string()));
                continue;
            };

            if !self.health.is_available(&provider_id).await {
                reasons.push((provider_id.clone(), "circuit open".to_string()));
                continue;
            }

            match self.limiter.try_acquire(Scope::Provider, &provider_id, 1).await {
                Ok(Acquire::Granted) => {}
                Ok(Acquire::RetryAfter { retry_after_ms }) => {
                    reasons.push((
                        provider_id.clone(),
                        format!("rate limited for {}ms", retry_after_ms),
                    ));
                    continue;
                }
                Err(e) => {
                    warn!(provider = %provider_id, error = %e,
                          "Rate limiter unavailable, allowing request");
                }
            }

            let semaphore = self
                .semaphores
                .get(&provider_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
            let Ok(permit) = semaphore.try_acquire_owned() else {
                reasons.push((provider_id.clone(), "at max concurrency".to_string()));
                continue;
            };

            if let Some(prev) = &previous {
                log_provider_failover!(prev, provider_id, tier.as_str(), "previous provider failed");
                self.metrics.ai_failovers.inc();
            }

            match self.invoker.invoke(profile, &task).await {
                Ok(stream) => {
                    self.metrics
                        .ai_requests
                        .with_label_values(&[provider_id.as_str(), "accepted"])
                        .inc();

                    let cli_session = if profile.kind == ProviderKind::Cli {
                        let command = profile.cli_command.clone().unwrap_or_default();
                        self.persistence
                            .record_cli_session(&provider_id, &command)
                            .await
                            .ok()
                    } else {
                        None
                    };

                    self.spawn_completion_watcher(
                        provider_id.clone(),
                        profile.default_model.clone(),
                        profile.cost_per_token,
                        stream.done,
                        permit,
                        cli_session,
                    );

                    return Ok(RouteStream {
                        provider_id,
                        model: profile.default_model.clone(),
                        tier,
                        chunks: stream.chunks,
                    });
                }
                Err(e) => {
                    debug!(provider = %provider_id, error = %e, "Provider rejected request");
                    self.health.record_error(&provider_id).await;
                    self.metrics
                        .ai_requests
                        .with_label_values(&[provider_id.as_str(), "error"])
                        .inc();
                    reasons.push((provider_id.clone(), e.to_string()));
                    previous = Some(provider_id);
                }
            }
        }

        Err(HubError::NoProviderAvailable { reasons })
    }

    /// Watch the stream's completion to settle health, usage and the
    /// concurrency permit. The permit is held for the stream's lifetime.
    fn spawn_completion_watcher(
        &self,
        provider_id: String,
        model: String,
        cost_per_token: Option<f64>,
        done: tokio::sync::oneshot::Receiver<providers::StreamStats>,
        permit: tokio::sync::OwnedSemaphorePermit,
        cli_session: Option<i64>,
    ) {
        let health = self.health.clone();
        let persistence = self.persistence.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let stats = done.await.ok();
            drop(permit);

            match stats {
                Some(stats) if stats.success => {
                    health.record_success(&provider_id, stats.latency_ms).await;
                    metrics
                        .ai_requests
                        .with_label_values(&[provider_id.as_str(), "ok"])
                        .inc();

                    let cost = cost_per_token
                        .map(|c| c * (stats.input_tokens + stats.output_tokens) as f64)
                        .unwrap_or(0.0);
                    let usage = AiUsageRow {
                        provider_id: provider_id.clone(),
                        model,
                        input_tokens: stats.input_tokens,
                        output_tokens: stats.output_tokens,
                        cost_estimate: cost,
                        latency_ms: stats.latency_ms,
                    };
                    if let Err(e) = persistence.record_ai_usage(&usage).await {
                        warn!(provider = %provider_id, error = %e, "Failed to record AI usage");
                    }
                    if let Some(session_id) = cli_session {
                        let _ = persistence.finish_cli_session(session_id, Some(0)).await;
                    }
                }
                _ => {
                    health.record_error(&provider_id).await;
                    metrics
                        .ai_requests
                        .with_label_values(&[provider_id.as_str(), "stream_error"])
                        .inc();
                    if let Some(session_id) = cli_session {
                        let _ = persistence.finish_cli_session(session_id, Some(1)).await;
                    }
                }
            }
        });
    }
}
