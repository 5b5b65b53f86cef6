use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agents::types::{now_ms, AuthPromptKind, Platform};
use crate::utils::crypto::BlobCipher;

/// Bring-up status of a session artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "kind")]
pub enum ArtifactStatus {
    Pending,
    AwaitingUserInput(AuthPromptKind),
    Complete,
    Failed,
}

/// Agent-scoped opaque credential blob plus metadata.
///
/// The supervisor owns and writes the artifact; this store only persists it.
#[derive(Debug, Clone)]
pub struct SessionArtifact {
    pub agent_id: String,
    pub platform: Platform,
    pub created_at: i64,
    pub revoked: bool,
    pub status: ArtifactStatus,
    pub blob: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    platform: Platform,
    created_at: i64,
    revoked: bool,
    status: ArtifactStatus,
}

/// One directory per agent under the session root:
/// `<root>/<agent_id>/session.json` (metadata) and `session.blob`
/// (gzip-compressed, AEAD-sealed credential bytes when a key is configured).
pub struct SessionStore {
    root: PathBuf,
    cipher: Option<Arc<BlobCipher>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, cipher: Option<Arc<BlobCipher>>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create session root: {}", root.display()))?;
        if cipher.is_none() {
            warn!("Session store running without encryption key; blobs stored unencrypted");
        }
        Ok(Self { root, cipher })
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id)
    }

    pub fn log_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("logs")
    }

    pub async fn save(&self, artifact: &SessionArtifact) -> Result<()> {
        let dir = self.agent_dir(&artifact.agent_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create agent dir: {}", dir.display()))?;
        tokio::fs::create_dir_all(self.log_dir(&artifact.agent_id)).await?;

        let meta = ArtifactMeta {
            platform: artifact.platform,
            created_at: artifact.created_at,
            revoked: artifact.revoked,
            status: artifact.status,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;
        atomic_write(&dir.join("session.json"), &meta_json)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&artifact.blob)?;
        let compressed = encoder.finish()?;

        let sealed = match &self.cipher {
            Some(cipher) => cipher.seal(&compressed)?,
            None => compressed,
        };
        atomic_write(&dir.join("session.blob"), &sealed)?;

        debug!(agent_id = %artifact.agent_id, bytes = sealed.len(), "Session artifact persisted");
        Ok(())
    }

    pub async fn load(&self, agent_id: &str) -> Result<Option<SessionArtifact>> {
        let dir = self.agent_dir(agent_id);
        let meta_path = dir.join("session.json");
        if !meta_path.exists() {
            return Ok(None);
        }

        let meta_raw = tokio::fs::read(&meta_path)
            .await
            .with_context(|| format!("Failed to read {}", meta_path.display()))?;
        let meta: ArtifactMeta = serde_json::from_slice(&meta_raw)
            .with_context(|| format!("Corrupt session metadata for agent {}", agent_id))?;

        let blob_path = dir.join("session.blob");
        let blob = if blob_path.exists() {
            let sealed = tokio::fs::read(&blob_path).await?;
            let compressed = match &self.cipher {
                Some(cipher) => cipher
                    .open(&sealed)
                    .with_context(|| format!("Failed to unseal session blob for {}", agent_id))?,
                None => sealed,
            };
            let mut decoder = GzDecoder::new(&compressed[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .with_context(|| format!("Failed to decompress session blob for {}", agent_id))?;
            out
        } else {
            Vec::new()
        };

        Ok(Some(SessionArtifact {
            agent_id: agent_id.to_string(),
            platform: meta.platform,
            created_at: meta.created_at,
            revoked: meta.revoked,
            status: meta.status,
            blob,
        }))
    }

    /// Mark the artifact revoked without destroying the blob; a revoked
    /// session is never used for reconnects.
    pub async fn revoke(&self, agent_id: &str) -> Result<()> {
        if let Some(mut artifact) = self.load(agent_id).await? {
            artifact.revoked = true;
            artifact.status = ArtifactStatus::Failed;
            self.save(&artifact).await?;
            info!(agent_id = %agent_id, "Session artifact revoked");
        }
        Ok(())
    }

    pub async fn delete(&self, agent_id: &str) -> Result<()> {
        let dir = self.agent_dir(agent_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to delete session dir: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Fresh artifact in the `pending` phase for an agent starting bring-up.
    pub fn fresh(&self, agent_id: &str, platform: Platform) -> SessionArtifact {
        SessionArtifact {
            agent_id: agent_id.to_string(),
            platform,
            created_at: now_ms(),
            revoked: false,
            status: ArtifactStatus::Pending,
            blob: Vec::new(),
        }
    }
}

/// Write-then-rename so readers never observe a partial file.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .context("atomic_write target has no parent directory")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("failed to persist {}: {}", path.display(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::crypto::generate_key_base64;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_load_round_trip_encrypted() {
        let dir = TempDir::new().unwrap();
        let cipher = Arc::new(BlobCipher::new(&generate_key_base64().unwrap()).unwrap());
        let store = SessionStore::new(dir.path().join("sessions"), Some(cipher)).unwrap();

        let mut artifact = store.fresh("agent-1", Platform::Whatsapp);
        artifact.blob = b"creds".to_vec();
        artifact.status = ArtifactStatus::Complete;
        store.save(&artifact).await.unwrap();

        // Blob on disk must not contain the plaintext.
        let raw = std::fs::read(dir.path().join("sessions/agent-1/session.blob")).unwrap();
        assert!(!raw.windows(5).any(|w| w == b"creds"));

        let loaded = store.load("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.blob, b"creds");
        assert_eq!(loaded.status, ArtifactStatus::Complete);
        assert!(!loaded.revoked);
    }

    #[tokio::test]
    async fn revoke_marks_failed() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"), None).unwrap();

        let mut artifact = store.fresh("agent-2", Platform::TelegramUser);
        artifact.status = ArtifactStatus::AwaitingUserInput(AuthPromptKind::Code);
        store.save(&artifact).await.unwrap();

        store.revoke("agent-2").await.unwrap();
        let loaded = store.load("agent-2").await.unwrap().unwrap();
        assert!(loaded.revoked);
        assert_eq!(loaded.status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn missing_agent_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"), None).unwrap();
        assert!(store.load("nobody").await.unwrap().is_none());
    }
}
