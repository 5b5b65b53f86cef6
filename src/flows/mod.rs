pub mod executor;
pub mod interpolate;
pub mod service;
pub mod triggers;
pub mod types;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::agents::types::UnifiedMessage;
use crate::utils::HubError;

pub use executor::{FlowEngine, FlowEngineConfig};
pub use service::FlowService;
pub use triggers::TriggerMatcher;
pub use types::{
    ExecutionStatus, FlowDefinition, FlowEdge, FlowNode, MessagePattern, NodeKind, Predicate,
    PredicateOp, RetryPolicy, RetryStrategy, TriggerSpec,
};

/// Work submitted to the flow engine's dispatch queue. Supervisors, the bus,
/// the scheduler and the admin surface all feed this channel; the engine
/// consumes it.
#[derive(Debug)]
pub enum TriggerWork {
    /// Inbound message that passed ingest on a supervisor.
    Inbound {
        agent_id: String,
        tenant: String,
        message: UnifiedMessage,
    },
    /// Cross-agent call delivered onto the target agent.
    CrossAgent {
        target_agent_id: String,
        source_agent_id: String,
        tenant: String,
        flow_name: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value, HubError>>,
    },
    /// Tenant broadcast fan-out delivered to one agent.
    Broadcast {
        agent_id: String,
        tenant: String,
        topic: String,
        payload: Value,
    },
    /// Manual execution requested from the admin surface.
    Manual {
        agent_id: String,
        flow_id: String,
        payload: Value,
        reply: oneshot::Sender<Result<String, HubError>>,
    },
    /// Webhook arrival for a registered path.
    Webhook {
        agent_id: String,
        path: String,
        payload: Value,
    },
    /// Cron trigger fired by the scheduler.
    Scheduled { agent_id: String, flow_id: String },
    /// Suspended execution due for resumption.
    Resume { execution_id: String },
}
