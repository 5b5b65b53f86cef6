use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the content-addressed media cache
#[derive(Debug, Clone)]
pub struct MediaCacheConfig {
    pub root: PathBuf,
    pub ttl: Duration,
    pub max_bytes_per_agent: u64,
}

impl Default for MediaCacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("media"),
            ttl: Duration::from_secs(3600),
            max_bytes_per_agent: 64 * 1024 * 1024,
        }
    }
}

/// Bytes plus the metadata the unified schema carries for attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub original_name: Option<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    size: u64,
    mime_type: String,
    original_name: Option<String>,
    stored_at: Instant,
    last_access: Instant,
    /// Entries referenced by an in-flight send are never evicted.
    pins: u32,
}

#[derive(Default)]
struct AgentIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

/// Content-addressed store keyed by SHA-256 of the payload, one directory per
/// agent. Identical bytes are stored once per agent. Soft TTL plus an LRU
/// byte budget; cold entries go first.
pub struct MediaCache {
    config: MediaCacheConfig,
    index: RwLock<HashMap<String, AgentIndex>>,
}

impl MediaCache {
    pub fn new(config: MediaCacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("Failed to create media root: {}", config.root.display()))?;
        Ok(Self {
            config,
            index: RwLock::new(HashMap::new()),
        })
    }

    pub fn content_key(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex_encode(&hasher.finalize())
    }

    fn blob_path(&self, agent_id: &str, key: &str) -> PathBuf {
        self.config.root.join(agent_id).join(key)
    }

    /// Admit a payload, returning its content key. A second put of identical
    /// bytes is a no-op returning the same key.
    pub async fn put(
        &self,
        agent_id: &str,
        bytes: &[u8],
        mime_type: &str,
        original_name: Option<&str>,
    ) -> Result<String> {
        let key = Self::content_key(bytes);
        let mut index = self.index.write().await;
        let agent = index.entry(agent_id.to_string()).or_default();

        if let Some(entry) = agent.entries.get_mut(&key) {
            entry.last_access = Instant::now();
            debug!(agent_id = %agent_id, key = %key, "Media payload already cached");
            return Ok(key);
        }

        let path = self.blob_path(agent_id, &key);
        tokio::fs::create_dir_all(path.parent().unwrap_or(&self.config.root)).await?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write media blob: {}", path.display()))?;

        let now = Instant::now();
        agent.entries.insert(
            key.clone(),
            CacheEntry {
                size: bytes.len() as u64,
                mime_type: mime_type.to_string(),
                original_name: original_name.map(|s| s.to_string()),
                stored_at: now,
                last_access: now,
                pins: 0,
            },
        );
        agent.total_bytes += bytes.len() as u64;

        self.evict_over_budget(agent_id, agent).await;
        Ok(key)
    }

    pub async fn get(&self, agent_id: &str, key: &str) -> Result<Option<MediaBlob>> {
        let (mime_type, original_name) = {
            let mut index = self.index.write().await;
            match index.get_mut(agent_id).and_then(|a| a.entries.get_mut(key)) {
                Some(entry) => {
                    entry.last_access = Instant::now();
                    (entry.mime_type.clone(), entry.original_name.clone())
                }
                None => return Ok(None),
            }
        };

        let path = self.blob_path(agent_id, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(MediaBlob {
                bytes,
                mime_type,
                original_name,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index said present but file is gone; drop the stale entry.
                warn!(agent_id = %agent_id, key = %key, "Media blob missing on disk, dropping index entry");
                let mut index = self.index.write().await;
                if let Some(agent) = index.get_mut(agent_id) {
                    if let Some(entry) = agent.entries.remove(key) {
                        agent.total_bytes = agent.total_bytes.saturating_sub(entry.size);
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pin an entry for the duration of an in-flight send.
    pub async fn pin(&self, agent_id: &str, key: &str) -> bool {
        let mut index = self.index.write().await;
        match index.get_mut(agent_id).and_then(|a| a.entries.get_mut(key)) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    pub async fn unpin(&self, agent_id: &str, key: &str) {
        let mut index = self.index.write().await;
        if let Some(entry) = index.get_mut(agent_id).and_then(|a| a.entries.get_mut(key)) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Drop entries past the soft TTL. Called periodically by the owner task.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut removed = 0;
        let mut paths = Vec::new();

        {
            let mut index = self.index.write().await;
            for (agent_id, agent) in index.iter_mut() {
                let expired: Vec<String> = agent
                    .entries
                    .iter()
                    .filter(|(_, e)| e.pins == 0 && e.stored_at.elapsed() > ttl)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in expired {
                    if let Some(entry) = agent.entries.remove(&key) {
                        agent.total_bytes = agent.total_bytes.saturating_sub(entry.size);
                        paths.push(self.blob_path(agent_id, &key));
                        removed += 1;
                    }
                }
            }
        }

        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove expired media blob {}: {}", path.display(), e);
                }
            }
        }

        if removed > 0 {
            info!(removed, "Media cache TTL sweep completed");
        }
        removed
    }

    async fn evict_over_budget(&self, agent_id: &str, agent: &mut AgentIndex) {
        let budget = self.config.max_bytes_per_agent;
        if agent.total_bytes <= budget {
            return;
        }

        let mut candidates: Vec<(String, Instant, u64)> = agent
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .map(|(k, e)| (k.clone(), e.last_access, e.size))
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut paths = Vec::new();
        for (key, _, size) in candidates {
            if agent.total_bytes <= budget {
                break;
            }
            agent.entries.remove(&key);
            agent.total_bytes = agent.total_bytes.saturating_sub(size);
            paths.push(self.blob_path(agent_id, &key));
        }

        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove evicted media blob {}: {}", path.display(), e);
                }
            }
        }
    }

    pub async fn total_bytes(&self, agent_id: &str) -> u64 {
        let index = self.index.read().await;
        index.get(agent_id).map(|a| a.total_bytes).unwrap_or(0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache_with_budget(dir: &TempDir, budget: u64) -> MediaCache {
        MediaCache::new(MediaCacheConfig {
            root: dir.path().join("media"),
            ttl: Duration::from_secs(3600),
            max_bytes_per_agent: budget,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn identical_payloads_stored_once() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_budget(&dir, 1024 * 1024);

        let key1 = cache.put("a1", b"payload", "image/png", None).await.unwrap();
        let key2 = cache.put("a1", b"payload", "image/png", None).await.unwrap();
        assert_eq!(key1, key2);
        assert_eq!(cache.total_bytes("a1").await, 7);

        let blob = cache.get("a1", &key1).await.unwrap().unwrap();
        assert_eq!(blob.bytes, b"payload");
        assert_eq!(blob.mime_type, "image/png");
    }

    #[tokio::test]
    async fn agents_are_isolated() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_budget(&dir, 1024 * 1024);

        let key = cache.put("a1", b"shared", "image/png", None).await.unwrap();
        assert!(cache.get("a2", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lru_eviction_spares_pinned_entries() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_budget(&dir, 10);

        let cold = cache.put("a1", b"AAAAA", "application/octet-stream", None).await.unwrap();
        cache.pin("a1", &cold).await;

        // Budget of 10 bytes forces eviction, but the pinned entry stays.
        let _b = cache.put("a1", b"BBBBB", "application/octet-stream", None).await.unwrap();
        let _c = cache.put("a1", b"CCCCC", "application/octet-stream", None).await.unwrap();

        assert!(cache.get("a1", &cold).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ttl_sweep_removes_cold_entries() {
        let dir = TempDir::new().unwrap();
        let cache = MediaCache::new(MediaCacheConfig {
            root: dir.path().join("media"),
            ttl: Duration::from_millis(10),
            max_bytes_per_agent: 1024,
        })
        .unwrap();

        let key = cache.put("a1", b"soon gone", "text/plain", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let removed = cache.sweep_expired().await;
        assert_eq!(removed, 1);
        assert!(cache.get("a1", &key).await.unwrap().is_none());
    }
}
