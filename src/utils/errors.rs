use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Variants map one-to-one to the recover/report/fatal classes the hub
/// distinguishes: transient failures are retried by the caller, validation
/// and auth failures never are, resource failures carry a retry hint.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Transient transport error: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Resource busy, retry after {retry_after_ms}ms")]
    Busy { retry_after_ms: u64 },

    #[error("No AI provider available: {reasons:?}")]
    NoProviderAvailable { reasons: Vec<(String, String)> },

    #[error("Cross-agent call timed out after {timeout_ms}ms")]
    CrossAgentTimeout { timeout_ms: u64 },

    #[error("Cross-agent call forbidden: {0}")]
    CrossAgentForbidden(String),

    #[error("No auth prompt pending for agent {0}")]
    NoPromptPending(String),

    #[error("Duplicate message {0} dropped")]
    Duplicate(String),

    #[error("Execution limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl HubError {
    /// Stable machine-readable kind for the admin API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Transient(_) => "transient",
            HubError::AuthFailed(_) => "auth_failed",
            HubError::Validation(_) => "validation",
            HubError::UnknownAgent(_) => "unknown_agent",
            HubError::Busy { .. } => "busy",
            HubError::NoProviderAvailable { .. } => "no_provider_available",
            HubError::CrossAgentTimeout { .. } => "cross_agent_timeout",
            HubError::CrossAgentForbidden(_) => "cross_agent_forbidden",
            HubError::NoPromptPending(_) => "no_prompt_pending",
            HubError::Duplicate(_) => "duplicate",
            HubError::LimitExceeded(_) => "limit_exceeded",
            HubError::Serialization(_) => "serialization",
            HubError::Database(_) => "database",
            HubError::FileSystem(_) => "filesystem",
            HubError::Fatal(_) => "fatal",
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::Transient(_) | HubError::Busy { .. } | HubError::CrossAgentTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(HubError::Transient("x".into()).code(), "transient");
        assert_eq!(HubError::Busy { retry_after_ms: 5 }.code(), "busy");
        assert_eq!(
            HubError::CrossAgentTimeout { timeout_ms: 1000 }.code(),
            "cross_agent_timeout"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(HubError::Transient("timeout".into()).is_transient());
        assert!(HubError::Busy { retry_after_ms: 100 }.is_transient());
        assert!(!HubError::AuthFailed("revoked".into()).is_transient());
        assert!(!HubError::Validation("bad".into()).is_transient());
    }
}
