use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::HubError;

/// Pattern a message trigger matches against the inbound body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MessagePattern {
    Contains { value: String },
    Exact { value: String },
    Regex { value: String },
    Any,
}

/// Hour-of-day window in which a message trigger is live (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl TimeWindow {
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Window wraps midnight.
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// What fires a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TriggerSpec {
    Message {
        #[serde(flatten)]
        pattern: MessagePattern,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(default)]
        include_from_me: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_window: Option<TimeWindow>,
    },
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Webhook {
        path: String,
    },
    CrossAgent {
        name: String,
        /// Caller agent IDs allowed to invoke this flow. Empty means any
        /// agent in the same tenant.
        #[serde(default)]
        allowed_callers: Vec<String>,
    },
    Broadcast {
        topic: String,
    },
    Manual,
}

/// Node kinds the executor dispatches on. Config is an opaque bag
/// interpreted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Trigger,
    SendMessage,
    SendMedia,
    SendLocation,
    React,
    EditMessage,
    DeleteMessage,
    Condition,
    Switch,
    Loop,
    Delay,
    SubFlow,
    CrossAgentCall,
    AiResponse,
    AiExtract,
    AiIntent,
    AiTranslate,
    Transcribe,
    Tts,
    RagQuery,
    Set,
    Template,
    JsonPath,
    #[serde(rename = "regex")]
    RegexExtract,
    Encode,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::SendMessage => "send-message",
            NodeKind::SendMedia => "send-media",
            NodeKind::SendLocation => "send-location",
            NodeKind::React => "react",
            NodeKind::EditMessage => "edit-message",
            NodeKind::DeleteMessage => "delete-message",
            NodeKind::Condition => "condition",
            NodeKind::Switch => "switch",
            NodeKind::Loop => "loop",
            NodeKind::Delay => "delay",
            NodeKind::SubFlow => "sub-flow",
            NodeKind::CrossAgentCall => "cross-agent-call",
            NodeKind::AiResponse => "ai-response",
            NodeKind::AiExtract => "ai-extract",
            NodeKind::AiIntent => "ai-intent",
            NodeKind::AiTranslate => "ai-translate",
            NodeKind::Transcribe => "transcribe",
            NodeKind::Tts => "tts",
            NodeKind::RagQuery => "rag-query",
            NodeKind::Set => "set",
            NodeKind::Template => "template",
            NodeKind::JsonPath => "json-path",
            NodeKind::RegexExtract => "regex",
            NodeKind::Encode => "encode",
        }
    }
}

/// Per-node retry policy. Retries apply to transient failures only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    pub base_ms: u64,
    #[serde(default)]
    pub strategy: RetryStrategy,
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

fn default_retry_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    #[default]
    Exponential,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        match self.strategy {
            RetryStrategy::Fixed => self.base_ms.min(self.max_ms),
            RetryStrategy::Exponential => {
                let factor = 2u64.saturating_pow(attempt.min(16));
                self.base_ms.saturating_mul(factor).min(self.max_ms)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub node_id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Comparison operator for edge predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
    Exists,
}

/// Pure predicate over the running execution context. `left` is a template
/// resolved against the context before comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub left: String,
    pub op: PredicateOp,
    #[serde(default)]
    pub right: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    /// Label matched against the routing value of a condition/switch source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
    /// Error edge: taken when the source node fails terminally.
    #[serde(default)]
    pub on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    pub trigger: TriggerSpec,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl FlowDefinition {
    /// Structural invariants: exactly one entry node, every edge endpoint
    /// exists, and the graph is acyclic (loop bodies are nested inside their
    /// loop node, not expressed as back-edges).
    pub fn validate(&self) -> Result<(), HubError> {
        if self.nodes.is_empty() {
            return Err(HubError::Validation("flow has no nodes".into()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.node_id.as_str()) {
                return Err(HubError::Validation(format!(
                    "duplicate node id: {}",
                    node.node_id
                )));
            }
        }

        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) {
                return Err(HubError::Validation(format!(
                    "edge references unknown node: {}",
                    edge.from
                )));
            }
            if !ids.contains(edge.to.as_str()) {
                return Err(HubError::Validation(format!(
                    "edge references unknown node: {}",
                    edge.to
                )));
            }
        }

        let entries: Vec<&FlowNode> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Trigger)
            .collect();
        if entries.len() != 1 {
            return Err(HubError::Validation(format!(
                "flow must have exactly one trigger node, found {}",
                entries.len()
            )));
        }
        let entry = entries[0];
        if self.edges.iter().any(|e| e.to == entry.node_id) {
            return Err(HubError::Validation(
                "trigger node cannot have inbound edges".into(),
            ));
        }

        self.check_acyclic()?;
        Ok(())
    }

    pub fn entry_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Trigger)
    }

    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn out_edges(&self, node_id: &str) -> Vec<&FlowEdge> {
        self.edges.iter().filter(|e| e.from == node_id).collect()
    }

    pub fn in_edges(&self, node_id: &str) -> Vec<&FlowEdge> {
        self.edges.iter().filter(|e| e.to == node_id).collect()
    }

    /// The name cross-agent callers use to address this flow.
    pub fn cross_agent_name(&self) -> Option<&str> {
        match &self.trigger {
            TriggerSpec::CrossAgent { name, .. } => Some(name),
            _ => None,
        }
    }

    fn check_acyclic(&self) -> Result<(), HubError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        // Kahn's algorithm; leftover nodes mean a cycle.
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.node_id.as_str(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(next) = adjacency.get(id) {
                for to in next {
                    let d = in_degree.get_mut(to).expect("edge target validated");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(to);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(HubError::Validation("flow graph contains a cycle".into()));
        }
        Ok(())
    }
}

/// Terminal and in-flight statuses of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Suspended,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    LimitExceeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Suspended => "suspended",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::LimitExceeded => "limit_exceeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running | ExecutionStatus::Suspended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, kind: NodeKind) -> FlowNode {
        FlowNode {
            node_id: id.to_string(),
            kind,
            config: json!({}),
            retry: None,
            timeout_ms: None,
        }
    }

    fn edge(from: &str, to: &str) -> FlowEdge {
        FlowEdge {
            from: from.to_string(),
            to: to.to_string(),
            when: None,
            predicate: None,
            on_error: false,
        }
    }

    fn flow(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowDefinition {
        FlowDefinition {
            flow_id: "f1".to_string(),
            agent_id: "a1".to_string(),
            name: "test".to_string(),
            trigger: TriggerSpec::Manual,
            nodes,
            edges,
            active: true,
        }
    }

    #[test]
    fn valid_linear_flow() {
        let f = flow(
            vec![
                node("start", NodeKind::Trigger),
                node("reply", NodeKind::SendMessage),
            ],
            vec![edge("start", "reply")],
        );
        assert!(f.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_edge_target() {
        let f = flow(
            vec![node("start", NodeKind::Trigger)],
            vec![edge("start", "ghost")],
        );
        assert!(f.validate().is_err());
    }

    #[test]
    fn rejects_two_entry_nodes() {
        let f = flow(
            vec![node("a", NodeKind::Trigger), node("b", NodeKind::Trigger)],
            vec![],
        );
        assert!(f.validate().is_err());
    }

    #[test]
    fn rejects_cycle() {
        let f = flow(
            vec![
                node("start", NodeKind::Trigger),
                node("a", NodeKind::Set),
                node("b", NodeKind::Set),
            ],
            vec![edge("start", "a"), edge("a", "b"), edge("b", "a")],
        );
        assert!(f.validate().is_err());
    }

    #[test]
    fn serde_round_trip_preserves_flow() {
        let f = flow(
            vec![
                node("start", NodeKind::Trigger),
                node("reply", NodeKind::SendMessage),
            ],
            vec![edge("start", "reply")],
        );
        let text = serde_json::to_string(&f).unwrap();
        let back: FlowDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn time_window_wraps_midnight() {
        let w = TimeWindow {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(w.contains(23));
        assert!(w.contains(2));
        assert!(!w.contains(12));
    }

    #[test]
    fn retry_delays() {
        let p = RetryPolicy {
            count: 5,
            base_ms: 100,
            strategy: RetryStrategy::Exponential,
            max_ms: 1000,
        };
        assert_eq!(p.delay_for_attempt(0), 100);
        assert_eq!(p.delay_for_attempt(1), 200);
        assert_eq!(p.delay_for_attempt(4), 1000);

        let fixed = RetryPolicy {
            count: 2,
            base_ms: 250,
            strategy: RetryStrategy::Fixed,
            max_ms: 30_000,
        };
        assert_eq!(fixed.delay_for_attempt(3), 250);
    }
}
