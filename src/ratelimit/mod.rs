use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::Client as RedisClient;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Bucket scope. Buckets are keyed by `(scope, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Agent,
    Provider,
    Tenant,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Agent => "agent",
            Scope::Provider => "provider",
            Scope::Tenant => "tenant",
        }
    }
}

/// Refill rate and burst capacity for one scope.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub refill_per_sec: f64,
    pub burst: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            refill_per_sec: 1.0,
            burst: 30,
        }
    }
}

/// Outcome of a bucket acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    RetryAfter { retry_after_ms: u64 },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

/// Trait for rate limiting backends
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn try_acquire(&self, key: &str, config: &BucketConfig, n: u32) -> Result<Acquire>;
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-process token buckets. The default backend when no Redis URL is
/// configured.
pub struct InMemoryBackend {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryBackend {
    async fn try_acquire(&self, key: &str, config: &BucketConfig, n: u32) -> Result<Acquire> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: config.burst as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * config.refill_per_sec).min(config.burst as f64);
        bucket.last_refill = now;

        let needed = n as f64;
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            Ok(Acquire::Granted)
        } else {
            let deficit = needed - bucket.tokens;
            let wait_secs = deficit / config.refill_per_sec;
            Ok(Acquire::RetryAfter {
                retry_after_ms: (wait_secs * 1000.0).ceil() as u64,
            })
        }
    }
}

/// Redis-backed token buckets, used as a cross-process backplane. The bucket
/// update runs as a Lua script so the refill-and-consume step is atomic.
pub struct RedisBackend {
    connection: Arc<Mutex<redis::aio::ConnectionManager>>,
}

impl RedisBackend {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {}", redis_url))?;
        let connection = client
            .get_connection_manager()
            .await
            .context("Failed to establish Redis connection")?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn try_acquire(&self, key: &str, config: &BucketConfig, n: u32) -> Result<Acquire> {
        let script = r#"
            local key = KEYS[1]
            local burst = tonumber(ARGV[1])
            local refill_per_sec = tonumber(ARGV[2])
            local needed = tonumber(ARGV[3])
            local now_ms = tonumber(ARGV[4])

            local bucket_info = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
            local tokens = tonumber(bucket_info[1]) or burst
            local last_refill_ms = tonumber(bucket_info[2]) or now_ms

            local elapsed = math.max(0, now_ms - last_refill_ms) / 1000.0
            tokens = math.min(burst, tokens + elapsed * refill_per_sec)

            if tokens >= needed then
                tokens = tokens - needed
                redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
                redis.call('EXPIRE', key, 3600)
                return -1
            else
                redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
                redis.call('EXPIRE', key, 3600)
                local wait_secs = (needed - tokens) / refill_per_sec
                return math.ceil(wait_secs * 1000)
            end
        "#;

        let now_ms = crate::agents::types::now_ms();
        let mut conn = self.connection.lock().await;
        let result: i64 = redis::Script::new(script)
            .key(format!("swarmhub:ratelimit:{}", key))
            .arg(config.burst)
            .arg(config.refill_per_sec)
            .arg(n)
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to execute rate limit script")?;

        if result < 0 {
            Ok(Acquire::Granted)
        } else {
            Ok(Acquire::RetryAfter {
                retry_after_ms: result as u64,
            })
        }
    }
}

/// Token buckets per agent, provider and tenant.
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    configs: HashMap<Scope, BucketConfig>,
}

impl RateLimiter {
    pub fn in_memory(configs: HashMap<Scope, BucketConfig>) -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            configs,
        }
    }

    pub async fn with_redis(redis_url: &str, configs: HashMap<Scope, BucketConfig>) -> Result<Self> {
        let backend = RedisBackend::new(redis_url).await?;
        Ok(Self {
            backend: Arc::new(backend),
            configs,
        })
    }

    pub fn default_configs() -> HashMap<Scope, BucketConfig> {
        let mut configs = HashMap::new();
        configs.insert(
            Scope::Agent,
            BucketConfig {
                refill_per_sec: 1.0,
                burst: 30,
            },
        );
        configs.insert(
            Scope::Provider,
            BucketConfig {
                refill_per_sec: 2.0,
                burst: 10,
            },
        );
        configs.insert(
            Scope::Tenant,
            BucketConfig {
                refill_per_sec: 5.0,
                burst: 100,
            },
        );
        configs
    }

    pub async fn try_acquire(&self, scope: Scope, id: &str, n: u32) -> Result<Acquire> {
        let config = self.configs.get(&scope).copied().unwrap_or_default();
        let key = format!("{}:{}", scope.as_str(), id);
        let outcome = self.backend.try_acquire(&key, &config, n).await?;

        match outcome {
            Acquire::Granted => debug!(key = %key, n, "Rate limit granted"),
            Acquire::RetryAfter { retry_after_ms } => {
                warn!(key = %key, retry_after_ms, "Rate limit exceeded")
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::in_memory(HashMap::from([(
            Scope::Agent,
            BucketConfig {
                refill_per_sec: 10.0,
                burst: 2,
            },
        )]));

        assert!(limiter.try_acquire(Scope::Agent, "a1", 1).await.unwrap().is_granted());
        assert!(limiter.try_acquire(Scope::Agent, "a1", 1).await.unwrap().is_granted());

        match limiter.try_acquire(Scope::Agent, "a1", 1).await.unwrap() {
            Acquire::RetryAfter { retry_after_ms } => assert!(retry_after_ms <= 100),
            Acquire::Granted => panic!("third acquire should throttle"),
        }
    }

    #[tokio::test]
    async fn buckets_are_scoped_per_id() {
        let limiter = RateLimiter::in_memory(HashMap::from([(
            Scope::Provider,
            BucketConfig {
                refill_per_sec: 1.0,
                burst: 1,
            },
        )]));

        assert!(limiter.try_acquire(Scope::Provider, "p1", 1).await.unwrap().is_granted());
        assert!(limiter.try_acquire(Scope::Provider, "p2", 1).await.unwrap().is_granted());
        assert!(!limiter.try_acquire(Scope::Provider, "p1", 1).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn refill_restores_tokens() {
        let limiter = RateLimiter::in_memory(HashMap::from([(
            Scope::Tenant,
            BucketConfig {
                refill_per_sec: 100.0,
                burst: 1,
            },
        )]));

        assert!(limiter.try_acquire(Scope::Tenant, "t1", 1).await.unwrap().is_granted());
        assert!(!limiter.try_acquire(Scope::Tenant, "t1", 1).await.unwrap().is_granted());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(limiter.try_acquire(Scope::Tenant, "t1", 1).await.unwrap().is_granted());
    }
}
