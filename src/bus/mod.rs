use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::hub::{tenant_topic, HubFrame, SubscriptionHub};
use crate::storage::Persistence;
use crate::utils::HubError;

/// Request/reply and broadcast between agents in the same process.
///
/// `call` delivers onto the target supervisor's mailbox and waits on a reply
/// slot keyed by a generated call ID; on timeout the slot is freed and a
/// late reply is dropped on the floor. Everything is scoped to one tenant.
pub struct CrossAgentBus {
    registry: Arc<AgentRegistry>,
    hub: Arc<SubscriptionHub>,
    persistence: Arc<Persistence>,
}

impl CrossAgentBus {
    pub fn new(
        registry: Arc<AgentRegistry>,
        hub: Arc<SubscriptionHub>,
        persistence: Arc<Persistence>,
    ) -> Self {
        Self {
            registry,
            hub,
            persistence,
        }
    }

    pub async fn call(
        &self,
        tenant: &str,
        source_agent_id: &str,
        target_agent_id: &str,
        flow_name: &str,
        payload: Value,
        timeout_ms: u64,
    ) -> Result<Value, HubError> {
        // Both ends must live in the caller's tenant.
        self.registry.get(tenant, source_agent_id).await?;
        let target = self.registry.get(tenant, target_agent_id).await?;

        let call_id = Uuid::new_v4().to_string();
        debug!(call_id = %call_id, source = %source_agent_id, target = %target_agent_id,
               flow = %flow_name, timeout_ms, "Cross-agent call started");

        let reply_rx = target
            .invoke_cross_agent(source_agent_id, flow_name, payload)
            .await?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), reply_rx).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    // A completed handoff counts toward the source agent's
                    // reputation.
                    let _ = self
                        .persistence
                        .bump_reputation(source_agent_id, 1, 0)
                        .await;
                }
                result
            }
            Ok(Err(_)) => Err(HubError::Fatal("cross-agent reply slot dropped".into())),
            Err(_) => {
                // Receiver is dropped here, so a reply arriving after the
                // deadline has nowhere to land.
                warn!(call_id = %call_id, target = %target_agent_id, timeout_ms,
                      "Cross-agent call timed out");
                Err(HubError::CrossAgentTimeout { timeout_ms })
            }
        }
    }

    /// Fire-and-forget fan-out to every agent in the tenant except the
    /// sender. Broadcasts are in-memory only and do not survive restart.
    pub async fn broadcast(&self, tenant: &str, source_agent_id: &str, topic: &str, payload: Value) {
        let peers = self.registry.list(tenant).await;
        let mut delivered = 0;
        for peer in peers {
            if peer.agent_id == source_agent_id {
                continue;
            }
            peer.tenant_broadcast(topic, payload.clone()).await;
            delivered += 1;
        }

        self.hub
            .publish(
                tenant,
                &tenant_topic(tenant, topic),
                HubFrame::Broadcast {
                    topic: topic.to_string(),
                    payload,
                },
            )
            .await;

        info!(tenant = %tenant, topic = %topic, delivered, "Tenant broadcast fanned out");
    }
}
