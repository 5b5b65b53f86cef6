pub mod persistence;
pub mod session_store;

pub use persistence::{
    AiUsageRow, ExecutionRow, FlowRow, Persistence, PersistenceConfig, SqlitePool,
};
pub use session_store::{ArtifactStatus, SessionArtifact, SessionStore};
