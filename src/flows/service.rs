use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agents::types::now_ms;
use crate::flows::types::{FlowDefinition, TriggerSpec};
use crate::storage::{FlowRow, Persistence};
use crate::utils::HubError;

/// Flow definition store: persistence-backed with an in-memory cache so the
/// trigger matcher never touches the database on the hot path.
pub struct FlowService {
    persistence: Arc<Persistence>,
    cache: RwLock<HashMap<String, Vec<Arc<FlowDefinition>>>>,
}

impl FlowService {
    pub fn new(persistence: Arc<Persistence>) -> Self {
        Self {
            persistence,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted flow into the cache. Corrupt definitions are
    /// skipped with a warning so one bad row cannot block startup.
    pub async fn load_all(&self) -> Result<usize> {
        let rows = self.persistence.all_flows().await?;
        let mut cache = self.cache.write().await;
        cache.clear();

        let mut loaded = 0;
        for row in rows {
            match serde_json::from_value::<FlowDefinition>(row.definition.clone()) {
                Ok(mut def) => {
                    def.active = row.active;
                    cache
                        .entry(def.agent_id.clone())
                        .or_default()
                        .push(Arc::new(def));
                    loaded += 1;
                }
                Err(e) => {
                    warn!(flow_id = %row.flow_id, error = %e, "Skipping corrupt flow definition");
                }
            }
        }
        info!(loaded, "Flow definitions loaded");
        Ok(loaded)
    }

    pub async fn save(&self, definition: FlowDefinition) -> Result<(), HubError> {
        definition.validate()?;

        let row = FlowRow {
            flow_id: definition.flow_id.clone(),
            agent_id: definition.agent_id.clone(),
            definition: serde_json::to_value(&definition)?,
            active: definition.active,
            updated_at: now_ms(),
        };
        self.persistence
            .save_flow(&row)
            .await
            .map_err(|e| HubError::Fatal(format!("failed to persist flow: {}", e)))?;

        let mut cache = self.cache.write().await;
        let flows = cache.entry(definition.agent_id.clone()).or_default();
        flows.retain(|f| f.flow_id != definition.flow_id);
        flows.push(Arc::new(definition));
        Ok(())
    }

    pub async fn get(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        let cache = self.cache.read().await;
        cache
            .values()
            .flat_map(|flows| flows.iter())
            .find(|f| f.flow_id == flow_id)
            .cloned()
    }

    pub async fn list(&self, agent_id: &str) -> Vec<Arc<FlowDefinition>> {
        let cache = self.cache.read().await;
        cache.get(agent_id).cloned().unwrap_or_default()
    }

    /// Active flows only; what the trigger matcher consumes.
    pub async fn active_flows(&self, agent_id: &str) -> Vec<Arc<FlowDefinition>> {
        let cache = self.cache.read().await;
        cache
            .get(agent_id)
            .map(|flows| flows.iter().filter(|f| f.active).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn find_cross_agent(
        &self,
        agent_id: &str,
        flow_name: &str,
    ) -> Option<Arc<FlowDefinition>> {
        self.active_flows(agent_id)
            .await
            .into_iter()
            .find(|f| f.cross_agent_name() == Some(flow_name))
    }

    /// Active schedule-triggered flows across all agents, for the scheduler.
    pub async fn scheduled_flows(&self) -> Vec<Arc<FlowDefinition>> {
        let cache = self.cache.read().await;
        cache
            .values()
            .flat_map(|flows| flows.iter())
            .filter(|f| f.active && matches!(f.trigger, TriggerSpec::Schedule { .. }))
            .cloned()
            .collect()
    }

    pub async fn set_active(&self, flow_id: &str, active: bool) -> Result<bool, HubError> {
        let changed = self
            .persistence
            .set_flow_active(flow_id, active)
            .await
            .map_err(|e| HubError::Fatal(format!("failed to toggle flow: {}", e)))?;
        if !changed {
            return Ok(false);
        }

        let mut cache = self.cache.write().await;
        for flows in cache.values_mut() {
            for slot in flows.iter_mut() {
                if slot.flow_id == flow_id {
                    let mut def = (**slot).clone();
                    def.active = active;
                    *slot = Arc::new(def);
                }
            }
        }
        Ok(true)
    }

    pub async fn delete(&self, flow_id: &str) -> Result<bool, HubError> {
        let deleted = self
            .persistence
            .delete_flow(flow_id)
            .await
            .map_err(|e| HubError::Fatal(format!("failed to delete flow: {}", e)))?;

        let mut cache = self.cache.write().await;
        for flows in cache.values_mut() {
            flows.retain(|f| f.flow_id != flow_id);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::types::{FlowNode, NodeKind};
    use crate::storage::PersistenceConfig;
    use serde_json::json;
    use tempfile::TempDir;

    async fn service() -> (FlowService, TempDir) {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(
            Persistence::new(PersistenceConfig {
                database_path: dir.path().join("flows.db").to_string_lossy().to_string(),
                max_connections: 2,
                retention_days: 30,
            })
            .await
            .unwrap(),
        );
        (FlowService::new(persistence), dir)
    }

    fn minimal_flow(flow_id: &str, agent_id: &str) -> FlowDefinition {
        FlowDefinition {
            flow_id: flow_id.to_string(),
            agent_id: agent_id.to_string(),
            name: "t".to_string(),
            trigger: TriggerSpec::Manual,
            nodes: vec![FlowNode {
                node_id: "start".to_string(),
                kind: NodeKind::Trigger,
                config: json!({}),
                retry: None,
                timeout_ms: None,
            }],
            edges: vec![],
            active: true,
        }
    }

    #[tokio::test]
    async fn save_reload_round_trip() {
        let (service, _dir) = service().await;
        service.save(minimal_flow("f1", "a1")).await.unwrap();

        service.load_all().await.unwrap();
        let loaded = service.get("f1").await.unwrap();
        assert_eq!(*loaded, minimal_flow("f1", "a1"));
    }

    #[tokio::test]
    async fn toggle_filters_active_flows() {
        let (service, _dir) = service().await;
        service.save(minimal_flow("f1", "a1")).await.unwrap();

        assert_eq!(service.active_flows("a1").await.len(), 1);
        service.set_active("f1", false).await.unwrap();
        assert!(service.active_flows("a1").await.is_empty());
        assert_eq!(service.list("a1").await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_flow_is_rejected() {
        let (service, _dir) = service().await;
        let mut bad = minimal_flow("f2", "a1");
        bad.nodes.clear();
        assert!(service.save(bad).await.is_err());
    }
}
