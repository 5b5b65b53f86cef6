use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn setup_logging(default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .compact(),
        )
        .with(env_filter)
        .init();

    Ok(())
}

/// Structured logging for supervisor state transitions
#[macro_export]
macro_rules! log_state_transition {
    ($agent_id:expr, $from:expr, $to:expr) => {
        tracing::info!(
            agent_id = %$agent_id,
            from = %$from,
            to = %$to,
            event_type = "state_transition",
            "Agent state changed"
        );
    };
}

/// Log provider failover events
#[macro_export]
macro_rules! log_provider_failover {
    ($from_provider:expr, $to_provider:expr, $tier:expr, $reason:expr) => {
        tracing::warn!(
            from_provider = %$from_provider,
            to_provider = %$to_provider,
            tier = %$tier,
            reason = %$reason,
            event_type = "failover",
            "Provider failover occurred"
        );
    };
}
