use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use swarmhub::ai::providers::{ProviderStream, StreamStats};
use swarmhub::ai::router::Invoker;
use swarmhub::ai::types::{
    AiTask, ComplexityTier, FailoverHierarchy, ProviderKind, ProviderProfile,
};
use swarmhub::ai::{AiRouter, Classifier, HealthConfig, HealthMonitor};
use swarmhub::ratelimit::{BucketConfig, RateLimiter, Scope};
use swarmhub::storage::{Persistence, PersistenceConfig};
use swarmhub::utils::{HubError, HubMetrics};

/// Invoker that fails a provider a scripted number of times, then succeeds
/// with a one-chunk stream.
struct ScriptedInvoker {
    failures_left: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    fn new(failures: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            failures_left: Mutex::new(
                failures
                    .iter()
                    .map(|(id, n)| (id.to_string(), *n))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        })
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(
        &self,
        profile: &ProviderProfile,
        _task: &AiTask,
    ) -> Result<ProviderStream, HubError> {
        self.calls.lock().await.push(profile.provider_id.clone());

        {
            let mut failures = self.failures_left.lock().await;
            if let Some(left) = failures.get_mut(&profile.provider_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HubError::Transient("503 service unavailable".into()));
                }
            }
        }

        let (tx, rx) = tokio::sync::mpsc::channel(2);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let provider = profile.provider_id.clone();
        tokio::spawn(async move {
            let _ = tx.send(Ok(format!("answer from {}", provider))).await;
            let _ = done_tx.send(StreamStats {
                input_tokens: 4,
                output_tokens: 4,
                latency_ms: 5,
                success: true,
            });
        });
        Ok(ProviderStream {
            chunks: rx,
            done: done_rx,
        })
    }
}

fn profile(id: &str, kind: ProviderKind) -> ProviderProfile {
    ProviderProfile {
        provider_id: id.to_string(),
        kind,
        base_url: Some("http://localhost:0".to_string()),
        api_key: None,
        cost_per_token: Some(0.00001),
        capabilities: vec![],
        max_concurrent: 4,
        default_model: format!("{}-model", id),
        probe_path: None,
        cli_command: None,
    }
}

struct Setup {
    router: AiRouter,
    health: Arc<HealthMonitor>,
    invoker: Arc<ScriptedInvoker>,
    _dir: TempDir,
}

async fn setup(failures: &[(&str, u32)]) -> Setup {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(
        Persistence::new(PersistenceConfig {
            database_path: dir.path().join("ai.db").to_string_lossy().to_string(),
            max_connections: 2,
            retention_days: 30,
        })
        .await
        .unwrap(),
    );

    let health = HealthMonitor::new(
        vec![
            profile("free-a", ProviderKind::RemoteFree),
            profile("paid-b", ProviderKind::RemotePaid),
        ],
        HealthConfig {
            probe_interval: Duration::from_secs(3600),
            unhealthy_threshold: 3,
            recovery_window: Duration::from_millis(50),
        },
        persistence.clone(),
    );

    let mut hierarchy = FailoverHierarchy::default();
    hierarchy.chains.insert(
        ComplexityTier::Simple,
        vec!["free-a".to_string(), "paid-b".to_string()],
    );

    let limiter = Arc::new(RateLimiter::in_memory(HashMap::from([(
        Scope::Provider,
        BucketConfig {
            refill_per_sec: 1000.0,
            burst: 1000,
        },
    )])));
    let invoker = ScriptedInvoker::new(failures);
    let metrics = Arc::new(HubMetrics::new().unwrap());

    let router = AiRouter::with_invoker(
        health.clone(),
        hierarchy,
        Classifier::new(Duration::from_secs(60)),
        limiter,
        persistence,
        metrics,
        invoker.clone(),
    );

    Setup {
        router,
        health,
        invoker,
        _dir: dir,
    }
}

fn simple_task(prompt: &str) -> AiTask {
    AiTask {
        prompt: prompt.to_string(),
        complexity_hint: Some(ComplexityTier::Simple),
        ..Default::default()
    }
}

#[tokio::test]
async fn failing_primary_falls_over_within_one_invocation() {
    let s = setup(&[("free-a", 10)]).await;

    let stream = s.router.route(simple_task("what is the time")).await.unwrap();
    assert_eq!(stream.provider_id, "paid-b");
    let text = stream.collect_text().await.unwrap();
    assert_eq!(text, "answer from paid-b");

    // free-a was tried first, then the chain moved on.
    assert_eq!(s.invoker.calls().await, vec!["free-a", "paid-b"]);
}

#[tokio::test]
async fn circuit_opens_after_three_errors_and_probe_recovers_it() {
    let s = setup(&[("free-a", 3)]).await;

    // Three calls: each one fails on free-a (503), falls over to paid-b.
    for _ in 0..3 {
        let stream = s.router.route(simple_task("hello there")).await.unwrap();
        assert_eq!(stream.provider_id, "paid-b");
        stream.collect_text().await.unwrap();
    }

    // Circuit is open now: the fourth call must not touch free-a at all.
    s.invoker.calls.lock().await.clear();
    let stream = s.router.route(simple_task("hello again")).await.unwrap();
    assert_eq!(stream.provider_id, "paid-b");
    stream.collect_text().await.unwrap();
    assert_eq!(s.invoker.calls().await, vec!["paid-b"]);

    // Recovery window passes and a probe succeeds (simulated): the next
    // call considers free-a first again, and it now succeeds.
    tokio::time::sleep(Duration::from_millis(80)).await;
    s.health.record_success("free-a", 10).await;

    s.invoker.calls.lock().await.clear();
    let stream = s.router.route(simple_task("hello once more")).await.unwrap();
    assert_eq!(stream.provider_id, "free-a");
    stream.collect_text().await.unwrap();
    assert_eq!(s.invoker.calls().await, vec!["free-a"]);
}

#[tokio::test]
async fn exhausted_chain_reports_per_provider_reasons() {
    let s = setup(&[("free-a", 10), ("paid-b", 10)]).await;

    let result = s.router.route(simple_task("anyone there?")).await;
    match result {
        Err(HubError::NoProviderAvailable { reasons }) => {
            assert_eq!(reasons.len(), 2);
            assert!(reasons.iter().any(|(id, _)| id == "free-a"));
            assert!(reasons.iter().any(|(id, _)| id == "paid-b"));
        }
        other => panic!("expected NoProviderAvailable, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn prefer_free_reorders_chain() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(
        Persistence::new(PersistenceConfig {
            database_path: dir.path().join("ai2.db").to_string_lossy().to_string(),
            max_connections: 2,
            retention_days: 30,
        })
        .await
        .unwrap(),
    );
    let health = HealthMonitor::new(
        vec![
            profile("paid-b", ProviderKind::RemotePaid),
            profile("free-a", ProviderKind::RemoteFree),
        ],
        HealthConfig::default(),
        persistence.clone(),
    );
    let mut hierarchy = FailoverHierarchy::default();
    hierarchy.chains.insert(
        ComplexityTier::Simple,
        vec!["paid-b".to_string(), "free-a".to_string()],
    );
    let invoker = ScriptedInvoker::new(&[]);
    let router = AiRouter::with_invoker(
        health,
        hierarchy,
        Classifier::new(Duration::from_secs(60)),
        Arc::new(RateLimiter::in_memory(RateLimiter::default_configs())),
        persistence,
        Arc::new(HubMetrics::new().unwrap()),
        invoker.clone(),
    );

    let mut task = simple_task("cheap please");
    task.prefer_free = true;
    let stream = router.route(task).await.unwrap();
    assert_eq!(stream.provider_id, "free-a");
    stream.collect_text().await.unwrap();
}
