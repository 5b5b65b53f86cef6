pub mod classify;
pub mod health;
pub mod providers;
pub mod router;
pub mod types;

pub use classify::Classifier;
pub use health::{HealthConfig, HealthMonitor};
pub use router::{AiRouter, HttpInvoker, Invoker};
pub use types::{
    AiTask, ChatTurn, ComplexityTier, FailoverHierarchy, HealthStatus, ProviderHealth,
    ProviderKind, ProviderProfile, RouteStream,
};
