use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::agents::supervisor::AgentHandle;
use crate::utils::HubError;

/// In-memory `agent_id → supervisor handle` map with tenant and
/// browser-session secondary indices.
///
/// Reads hand out cloned snapshots; writes are serialized behind the lock.
/// Every public lookup takes a tenant binding and only returns agents whose
/// binding matches.
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<String, AgentHandle>,
    by_tenant: HashMap<String, HashSet<String>>,
    by_browser_session: HashMap<String, HashSet<String>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub async fn register(&self, handle: AgentHandle) {
        let mut inner = self.inner.write().await;
        inner
            .by_tenant
            .entry(handle.tenant.clone())
            .or_default()
            .insert(handle.agent_id.clone());
        if let Some(session) = &handle.browser_session {
            inner
                .by_browser_session
                .entry(session.clone())
                .or_default()
                .insert(handle.agent_id.clone());
        }
        info!(agent_id = %handle.agent_id, tenant = %handle.tenant, "Agent registered");
        inner.agents.insert(handle.agent_id.clone(), handle);
    }

    pub async fn remove(&self, agent_id: &str) -> Option<AgentHandle> {
        let mut inner = self.inner.write().await;
        let handle = inner.agents.remove(agent_id)?;
        if let Some(set) = inner.by_tenant.get_mut(&handle.tenant) {
            set.remove(agent_id);
            if set.is_empty() {
                inner.by_tenant.remove(&handle.tenant);
            }
        }
        if let Some(session) = &handle.browser_session {
            if let Some(set) = inner.by_browser_session.get_mut(session) {
                set.remove(agent_id);
                if set.is_empty() {
                    inner.by_browser_session.remove(session);
                }
            }
        }
        debug!(agent_id = %agent_id, "Agent removed from registry");
        Some(handle)
    }

    /// Tenant-scoped lookup. Returns `UnknownAgent` both for missing agents
    /// and for agents bound to a different tenant, so callers cannot probe
    /// for other tenants' agent IDs.
    pub async fn get(&self, tenant: &str, agent_id: &str) -> Result<AgentHandle, HubError> {
        let inner = self.inner.read().await;
        match inner.agents.get(agent_id) {
            Some(handle) if handle.tenant == tenant => Ok(handle.clone()),
            _ => Err(HubError::UnknownAgent(agent_id.to_string())),
        }
    }

    pub async fn list(&self, tenant: &str) -> Vec<AgentHandle> {
        let inner = self.inner.read().await;
        inner
            .by_tenant
            .get(tenant)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list_by_browser_session(&self, tenant: &str, session: &str) -> Vec<AgentHandle> {
        let inner = self.inner.read().await;
        inner
            .by_browser_session
            .get(session)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id))
                    .filter(|h| h.tenant == tenant)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tenant an agent is bound to, regardless of caller. Internal use only;
    /// public lookups go through `get`.
    pub async fn tenant_of(&self, agent_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.agents.get(agent_id).map(|h| h.tenant.clone())
    }

    pub async fn all(&self) -> Vec<AgentHandle> {
        let inner = self.inner.read().await;
        inner.agents.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
