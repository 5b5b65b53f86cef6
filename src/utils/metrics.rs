use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide counters exposed at `/metrics`.
#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,
    pub messages_ingested: IntCounter,
    pub messages_deduplicated: IntCounter,
    pub messages_sent: IntCounter,
    pub executions_started: IntCounter,
    pub executions_succeeded: IntCounter,
    pub executions_failed: IntCounter,
    pub ai_requests: IntCounterVec,
    pub ai_failovers: IntCounter,
    pub subscribers_dropped: IntCounter,
    pub connected_agents: IntGauge,
}

impl HubMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_ingested =
            IntCounter::with_opts(Opts::new("hub_messages_ingested_total", "Inbound messages persisted"))?;
        let messages_deduplicated = IntCounter::with_opts(Opts::new(
            "hub_messages_deduplicated_total",
            "Inbound messages dropped as duplicates",
        ))?;
        let messages_sent =
            IntCounter::with_opts(Opts::new("hub_messages_sent_total", "Outbound sends completed"))?;
        let executions_started =
            IntCounter::with_opts(Opts::new("hub_executions_started_total", "Flow executions started"))?;
        let executions_succeeded = IntCounter::with_opts(Opts::new(
            "hub_executions_succeeded_total",
            "Flow executions reaching succeeded",
        ))?;
        let executions_failed = IntCounter::with_opts(Opts::new(
            "hub_executions_failed_total",
            "Flow executions reaching a failure status",
        ))?;
        let ai_requests = IntCounterVec::new(
            Opts::new("hub_ai_requests_total", "AI router invocations per provider"),
            &["provider", "outcome"],
        )?;
        let ai_failovers =
            IntCounter::with_opts(Opts::new("hub_ai_failovers_total", "Provider chain failovers"))?;
        let subscribers_dropped = IntCounter::with_opts(Opts::new(
            "hub_subscribers_dropped_total",
            "Subscribers dropped for queue overflow",
        ))?;
        let connected_agents =
            IntGauge::with_opts(Opts::new("hub_connected_agents", "Agents currently in ready state"))?;

        registry.register(Box::new(messages_ingested.clone()))?;
        registry.register(Box::new(messages_deduplicated.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(executions_started.clone()))?;
        registry.register(Box::new(executions_succeeded.clone()))?;
        registry.register(Box::new(executions_failed.clone()))?;
        registry.register(Box::new(ai_requests.clone()))?;
        registry.register(Box::new(ai_failovers.clone()))?;
        registry.register(Box::new(subscribers_dropped.clone()))?;
        registry.register(Box::new(connected_agents.clone()))?;

        Ok(Self {
            registry,
            messages_ingested,
            messages_deduplicated,
            messages_sent,
            executions_started,
            executions_succeeded,
            executions_failed,
            ai_requests,
            ai_failovers,
            subscribers_dropped,
            connected_agents,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        Ok(encoder.encode_to_string(&families)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render() {
        let metrics = HubMetrics::new().unwrap();
        metrics.messages_ingested.inc();
        metrics.ai_requests.with_label_values(&["paid-b", "ok"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("hub_messages_ingested_total 1"));
        assert!(text.contains("hub_ai_requests_total"));
    }
}
