use std::sync::Arc;

use chrono::{TimeZone, Timelike, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::agents::types::UnifiedMessage;
use crate::flows::service::FlowService;
use crate::flows::types::{FlowDefinition, MessagePattern, TriggerSpec};
use crate::utils::HubError;

/// Matches inbound events against registered flow triggers. Every match
/// becomes its own execution; multiple flows may fire for one event.
pub struct TriggerMatcher {
    flows: Arc<FlowService>,
}

impl TriggerMatcher {
    pub fn new(flows: Arc<FlowService>) -> Self {
        Self { flows }
    }

    pub async fn matches_for_message(
        &self,
        agent_id: &str,
        message: &UnifiedMessage,
    ) -> Vec<Arc<FlowDefinition>> {
        let candidates = self.flows.active_flows(agent_id).await;
        candidates
            .into_iter()
            .filter(|flow| match &flow.trigger {
                TriggerSpec::Message {
                    pattern,
                    chat_id,
                    include_from_me,
                    time_window,
                } => {
                    if message.from_me && !include_from_me {
                        return false;
                    }
                    if let Some(expected_chat) = chat_id {
                        if expected_chat != &message.chat_id {
                            return false;
                        }
                    }
                    if let Some(window) = time_window {
                        let hour = Utc
                            .timestamp_millis_opt(message.timestamp)
                            .single()
                            .map(|dt| dt.hour() as u8)
                            .unwrap_or(0);
                        if !window.contains(hour) {
                            return false;
                        }
                    }
                    pattern_matches(pattern, &message.body)
                }
                _ => false,
            })
            .collect()
    }

    pub async fn webhook_flows(&self, agent_id: &str, path: &str) -> Vec<Arc<FlowDefinition>> {
        self.flows
            .active_flows(agent_id)
            .await
            .into_iter()
            .filter(|flow| {
                matches!(&flow.trigger, TriggerSpec::Webhook { path: p } if p == path)
            })
            .collect()
    }

    pub async fn broadcast_flows(&self, agent_id: &str, topic: &str) -> Vec<Arc<FlowDefinition>> {
        self.flows
            .active_flows(agent_id)
            .await
            .into_iter()
            .filter(|flow| {
                matches!(&flow.trigger, TriggerSpec::Broadcast { topic: t } if t == topic)
            })
            .collect()
    }

    /// Resolve a cross-agent call target and enforce its access list.
    pub async fn resolve_cross_agent(
        &self,
        target_agent_id: &str,
        flow_name: &str,
        source_agent_id: &str,
    ) -> Result<Arc<FlowDefinition>, HubError> {
        let flow = self
            .flows
            .find_cross_agent(target_agent_id, flow_name)
            .await
            .ok_or_else(|| {
                HubError::Validation(format!(
                    "agent {} exposes no flow named {}",
                    target_agent_id, flow_name
                ))
            })?;

        match &flow.trigger {
            TriggerSpec::CrossAgent { allowed_callers, .. } => {
                if !allowed_callers.is_empty()
                    && !allowed_callers.iter().any(|c| c == source_agent_id)
                {
                    debug!(source = %source_agent_id, flow = %flow_name,
                           "Cross-agent call denied by access list");
                    return Err(HubError::CrossAgentForbidden(format!(
                        "{} may not invoke {}",
                        source_agent_id, flow_name
                    )));
                }
                Ok(flow)
            }
            _ => Err(HubError::Validation(format!(
                "flow {} is not cross-agent callable",
                flow_name
            ))),
        }
    }
}

fn pattern_matches(pattern: &MessagePattern, body: &str) -> bool {
    match pattern {
        MessagePattern::Any => true,
        MessagePattern::Contains { value } => body.to_lowercase().contains(&value.to_lowercase()),
        MessagePattern::Exact { value } => body == value,
        MessagePattern::Regex { value } => match Regex::new(value) {
            Ok(re) => re.is_match(body),
            Err(e) => {
                warn!(pattern = %value, error = %e, "Invalid trigger regex never matches");
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_case_insensitive() {
        let p = MessagePattern::Contains {
            value: "Hello".to_string(),
        };
        assert!(pattern_matches(&p, "well hello there"));
        assert!(!pattern_matches(&p, "goodbye"));
    }

    #[test]
    fn exact_match_is_strict() {
        let p = MessagePattern::Exact {
            value: "ping".to_string(),
        };
        assert!(pattern_matches(&p, "ping"));
        assert!(!pattern_matches(&p, "ping "));
    }

    #[test]
    fn regex_matches_and_bad_regex_never_matches() {
        let p = MessagePattern::Regex {
            value: r"^order-\d+$".to_string(),
        };
        assert!(pattern_matches(&p, "order-42"));
        assert!(!pattern_matches(&p, "order-"));

        let bad = MessagePattern::Regex {
            value: "(unclosed".to_string(),
        };
        assert!(!pattern_matches(&bad, "anything"));
    }

    #[test]
    fn any_always_matches() {
        assert!(pattern_matches(&MessagePattern::Any, ""));
        assert!(pattern_matches(&MessagePattern::Any, "whatever"));
    }
}
