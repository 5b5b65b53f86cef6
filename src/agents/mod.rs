pub mod manager;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use manager::AgentManager;
pub use registry::AgentRegistry;
pub use supervisor::{
    AgentHandle, AgentSupervisor, StatusReport, SupervisorCommand, SupervisorConfig,
    SupervisorDeps,
};
pub use types::{
    AdapterEvent, AgentRecord, AgentState, AuthPromptKind, Direction, MessageKind, Platform,
    SendCommand, SendReceipt, UnifiedMessage,
};
