pub mod adapters;
pub mod agents;
pub mod ai;
pub mod api;
pub mod bus;
pub mod config;
pub mod flows;
pub mod hub;
pub mod media;
pub mod ratelimit;
pub mod scheduler;
pub mod storage;
pub mod utils;

pub use adapters::PlatformAdapter;
pub use agents::{AgentManager, AgentRegistry, AgentSupervisor};
pub use ai::{AiRouter, HealthMonitor};
pub use bus::CrossAgentBus;
pub use config::Config;
pub use flows::{FlowEngine, FlowService, TriggerMatcher};
pub use hub::SubscriptionHub;
pub use media::MediaCache;
pub use ratelimit::RateLimiter;
pub use scheduler::Scheduler;
pub use storage::{Persistence, SessionStore};
pub use utils::errors::HubError;
pub use utils::{setup_logging, HubMetrics};
