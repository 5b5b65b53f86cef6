use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::types::{AgentState, AuthPromptKind, UnifiedMessage};
use crate::utils::HubMetrics;

/// Topic name helpers. Topics follow `agent.{id}.{channel}` and
/// `tenant.{id}.{channel}`.
pub fn agent_topic(agent_id: &str, channel: &str) -> String {
    format!("agent.{}.{}", agent_id, channel)
}

pub fn tenant_topic(tenant: &str, channel: &str) -> String {
    format!("tenant.{}.{}", tenant, channel)
}

/// Outbound frame published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum HubFrame {
    Snapshot {
        agents: Vec<AgentSnapshot>,
    },
    Status {
        agent_id: String,
        from: AgentState,
        to: AgentState,
        at: i64,
    },
    Qr {
        agent_id: String,
        /// Base64 of the QR payload bytes.
        bytes: String,
    },
    AuthPrompt {
        agent_id: String,
        kind: AuthPromptKind,
    },
    Message {
        agent_id: String,
        message: UnifiedMessage,
    },
    Stats {
        agent_id: String,
        counters: Value,
    },
    Broadcast {
        topic: String,
        payload: Value,
    },
    Pong,
}

/// Initial state delivered to a fresh subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub state: AgentState,
    pub recent_messages: Vec<UnifiedMessage>,
}

/// Envelope carried on a subscriber queue.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(flatten)]
    pub frame: HubFrame,
}

/// Topic filters a subscriber registered with. Empty means everything within
/// the tenant. A trailing `*` segment matches any suffix.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilters {
    pub patterns: Vec<String>,
}

impl SubscriptionFilters {
    pub fn matches(&self, topic: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns.iter().any(|p| pattern_matches(p, topic))
    }
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('.');
    let mut t = topic.split('.');
    loop {
        match (p.next(), t.next()) {
            (None, None) => return true,
            (Some("*"), _) if p.clone().next().is_none() => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            _ => return false,
        }
    }
}

struct Subscriber {
    tenant: String,
    filters: SubscriptionFilters,
    sender: mpsc::Sender<Envelope>,
}

/// Per-tenant topic pub/sub with bounded per-subscriber queues.
///
/// Delivery is at-most-once, best-effort: a subscriber whose queue overflows
/// is dropped and has to reconnect and re-snapshot. Topic order is preserved
/// to every subscriber that is not dropped.
pub struct SubscriptionHub {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    queue_size: usize,
    metrics: Arc<HubMetrics>,
}

impl SubscriptionHub {
    pub fn new(queue_size: usize, metrics: Arc<HubMetrics>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_size,
            metrics,
        }
    }

    pub async fn subscribe(
        &self,
        tenant: &str,
        filters: SubscriptionFilters,
    ) -> (String, mpsc::Receiver<Envelope>) {
        let subscriber_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.queue_size);

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(
            subscriber_id.clone(),
            Subscriber {
                tenant: tenant.to_string(),
                filters,
                sender: tx,
            },
        );
        info!(subscriber_id = %subscriber_id, tenant = %tenant, "Subscriber registered");
        (subscriber_id, rx)
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(subscriber_id).is_some() {
            debug!(subscriber_id = %subscriber_id, "Subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Publish a frame on a topic within a tenant. Tenant isolation is
    /// enforced here: only subscribers with a matching binding see the frame.
    pub async fn publish(&self, tenant: &str, topic: &str, frame: HubFrame) {
        let mut overflowed = Vec::new();

        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if sub.tenant != tenant || !sub.filters.matches(topic) {
                    continue;
                }
                let envelope = Envelope {
                    topic: topic.to_string(),
                    frame: frame.clone(),
                };
                match sub.sender.try_send(envelope) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        overflowed.push(id.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        overflowed.push(id.clone());
                    }
                }
            }
        }

        if !overflowed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in overflowed {
                if subscribers.remove(&id).is_some() {
                    self.metrics.subscribers_dropped.inc();
                    warn!(subscriber_id = %id, topic = %topic,
                          "Dropped slow subscriber on queue overflow");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::AgentState;

    fn hub(queue: usize) -> SubscriptionHub {
        SubscriptionHub::new(queue, Arc::new(HubMetrics::new().unwrap()))
    }

    fn status_frame(agent: &str) -> HubFrame {
        HubFrame::Status {
            agent_id: agent.to_string(),
            from: AgentState::Created,
            to: AgentState::Authenticating,
            at: 1,
        }
    }

    #[test]
    fn topic_patterns() {
        assert!(pattern_matches("agent.a1.*", "agent.a1.status"));
        assert!(pattern_matches("agent.*", "agent.a1.qr"));
        assert!(!pattern_matches("agent.a1.status", "agent.a2.status"));
        assert!(pattern_matches("agent.a1.status", "agent.a1.status"));
        assert!(!pattern_matches("tenant.t1.*", "agent.a1.status"));
    }

    #[tokio::test]
    async fn tenant_isolation_is_enforced() {
        let hub = hub(8);
        let (_id_a, mut rx_a) = hub.subscribe("tenant-a", SubscriptionFilters::default()).await;
        let (_id_b, mut rx_b) = hub.subscribe("tenant-b", SubscriptionFilters::default()).await;

        hub.publish("tenant-a", &agent_topic("a1", "status"), status_frame("a1"))
            .await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped() {
        let hub = hub(1);
        let (_id, mut rx) = hub.subscribe("t", SubscriptionFilters::default()).await;

        hub.publish("t", "agent.a1.status", status_frame("a1")).await;
        hub.publish("t", "agent.a1.status", status_frame("a1")).await;

        assert_eq!(hub.subscriber_count().await, 0);
        // The first frame is still readable; the overflowing one was lost.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn filters_limit_delivery() {
        let hub = hub(8);
        let (_id, mut rx) = hub
            .subscribe(
                "t",
                SubscriptionFilters {
                    patterns: vec!["agent.a1.qr".to_string()],
                },
            )
            .await;

        hub.publish("t", "agent.a1.status", status_frame("a1")).await;
        hub.publish(
            "t",
            "agent.a1.qr",
            HubFrame::Qr {
                agent_id: "a1".to_string(),
                bytes: "QUFBQQ==".to_string(),
            },
        )
        .await;

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, "agent.a1.qr");
        assert!(rx.try_recv().is_err());
    }
}
