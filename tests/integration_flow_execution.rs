mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_hub, wait_sent, wait_state};
use serde_json::json;
use swarmhub::adapters::mock::MockAdapter;
use swarmhub::agents::types::{
    AccountInfo, AdapterEvent, AgentState, Direction, MessageKind, Platform, SendCommand,
    UnifiedMessage,
};
use swarmhub::agents::AgentHandle;
use swarmhub::flows::{
    FlowDefinition, FlowEdge, FlowNode, MessagePattern, NodeKind, TriggerSpec,
};
use swarmhub::utils::HubError;

fn account() -> AccountInfo {
    AccountInfo {
        account_id: "1".to_string(),
        username: Some("bot".to_string()),
        display_name: Some("bot".to_string()),
    }
}

async fn ready_agent(
    hub: &common::TestHub,
    agent_id: &str,
    tenant: &str,
) -> (Arc<MockAdapter>, AgentHandle) {
    let adapter = Arc::new(MockAdapter::new(Platform::TelegramBot));
    adapter
        .script_initial(vec![
            AdapterEvent::Authenticated { info: account() },
            AdapterEvent::Ready { info: account() },
        ])
        .await;
    let handle = hub
        .spawn_agent(agent_id, tenant, Platform::TelegramBot, adapter.clone())
        .await;
    handle.connect().await.unwrap();
    assert!(wait_state(&handle, AgentState::Ready, Duration::from_secs(2)).await);
    (adapter, handle)
}

fn inbound(agent: &str, id: &str, body: &str, sender: &str) -> UnifiedMessage {
    UnifiedMessage {
        id: id.to_string(),
        agent_id: agent.to_string(),
        platform: Platform::TelegramBot,
        direction: Direction::Inbound,
        chat_id: "chat-1".to_string(),
        sender_id: "u1".to_string(),
        sender_name: sender.to_string(),
        body: body.to_string(),
        timestamp: swarmhub::agents::types::now_ms(),
        kind: MessageKind::Text,
        has_media: false,
        from_me: false,
        reply_to: None,
        meta: json!({}),
    }
}

fn node(id: &str, kind: NodeKind, config: serde_json::Value) -> FlowNode {
    FlowNode {
        node_id: id.to_string(),
        kind,
        config,
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

#[tokio::test]
async fn inbound_hello_triggers_reply_flow() {
    let hub = test_hub().await;
    let (adapter, _handle) = ready_agent(&hub, "agent-flow", "tenant-a").await;

    hub.flows
        .save(FlowDefinition {
            flow_id: "flow-hello".to_string(),
            agent_id: "agent-flow".to_string(),
            name: "greet".to_string(),
            trigger: TriggerSpec::Message {
                pattern: MessagePattern::Contains {
                    value: "hello".to_string(),
                },
                chat_id: None,
                include_from_me: false,
                time_window: None,
            },
            nodes: vec![
                node("start", NodeKind::Trigger, json!({})),
                node(
                    "reply",
                    NodeKind::SendMessage,
                    json!({"body": "hi {{trigger.triggerSender.name}}"}),
                ),
            ],
            edges: vec![edge("start", "reply")],
            active: true,
        })
        .await
        .unwrap();

    adapter
        .inject(AdapterEvent::InboundMessage(inbound(
            "agent-flow",
            "tgb:100",
            "hello world",
            "Alice",
        )))
        .await;

    // Exactly one outbound send with the interpolated body.
    assert!(wait_sent(&adapter, 1, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = adapter.sent_commands().await;
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SendCommand::Text { chat_id, body, .. } => {
            assert_eq!(chat_id, "chat-1");
            assert_eq!(body, "hi Alice");
        }
        other => panic!("unexpected send: {:?}", other),
    }

    // Message persisted, and one execution reached succeeded.
    assert!(hub
        .persistence
        .message_exists("agent-flow", "tgb:100")
        .await
        .unwrap());
    let executions = hub
        .persistence
        .list_executions("agent-flow", None, 10)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, "succeeded");
}

#[tokio::test]
async fn non_matching_message_fires_nothing() {
    let hub = test_hub().await;
    let (adapter, _handle) = ready_agent(&hub, "agent-nomatch", "tenant-a").await;

    hub.flows
        .save(FlowDefinition {
            flow_id: "flow-nm".to_string(),
            agent_id: "agent-nomatch".to_string(),
            name: "greet".to_string(),
            trigger: TriggerSpec::Message {
                pattern: MessagePattern::Contains {
                    value: "hello".to_string(),
                },
                chat_id: None,
                include_from_me: false,
                time_window: None,
            },
            nodes: vec![
                node("start", NodeKind::Trigger, json!({})),
                node("reply", NodeKind::SendMessage, json!({"body": "hi"})),
            ],
            edges: vec![edge("start", "reply")],
            active: true,
        })
        .await
        .unwrap();

    adapter
        .inject(AdapterEvent::InboundMessage(inbound(
            "agent-nomatch",
            "tgb:1",
            "goodbye",
            "Bob",
        )))
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(adapter.sent_commands().await.is_empty());
    assert!(hub
        .persistence
        .list_executions("agent-nomatch", None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn condition_routes_to_labeled_edge() {
    let hub = test_hub().await;
    let (adapter, _handle) = ready_agent(&hub, "agent-cond", "tenant-a").await;

    hub.flows
        .save(FlowDefinition {
            flow_id: "flow-cond".to_string(),
            agent_id: "agent-cond".to_string(),
            name: "branch".to_string(),
            trigger: TriggerSpec::Message {
                pattern: MessagePattern::Any,
                chat_id: None,
                include_from_me: false,
                time_window: None,
            },
            nodes: vec![
                node("start", NodeKind::Trigger, json!({})),
                node(
                    "check",
                    NodeKind::Condition,
                    json!({"predicate": {"left": "{{trigger.message.body}}", "op": "contains", "right": "urgent"}}),
                ),
                node("hot", NodeKind::SendMessage, json!({"body": "escalating"})),
                node("cold", NodeKind::SendMessage, json!({"body": "queued"})),
            ],
            edges: vec![
                edge("start", "check"),
                FlowEdge {
                    from: "check".to_string(),
                    to: "hot".to_string(),
                    when: Some("true".to_string()),
                    predicate: None,
                    on_error: false,
                },
                FlowEdge {
                    from: "check".to_string(),
                    to: "cold".to_string(),
                    when: Some("false".to_string()),
                    predicate: None,
                    on_error: false,
                },
            ],
            active: true,
        })
        .await
        .unwrap();

    adapter
        .inject(AdapterEvent::InboundMessage(inbound(
            "agent-cond",
            "tgb:5",
            "this is urgent!",
            "Alice",
        )))
        .await;

    assert!(wait_sent(&adapter, 1, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = adapter.sent_commands().await;
    assert_eq!(sent.len(), 1, "only the taken branch may send");
    match &sent[0] {
        SendCommand::Text { body, .. } => assert_eq!(body, "escalating"),
        other => panic!("unexpected send: {:?}", other),
    }
}

#[tokio::test]
async fn cross_agent_call_times_out_against_slow_target() {
    let hub = test_hub().await;
    let (_adapter_a, _handle_a) = ready_agent(&hub, "agent-a", "tenant-a").await;
    let (adapter_b, _handle_b) = ready_agent(&hub, "agent-b", "tenant-a").await;

    // Target flow exists but its send stalls beyond the caller's timeout.
    adapter_b.set_send_delay(Duration::from_millis(800)).await;
    hub.flows
        .save(FlowDefinition {
            flow_id: "flow-lookup".to_string(),
            agent_id: "agent-b".to_string(),
            name: "lookup".to_string(),
            trigger: TriggerSpec::CrossAgent {
                name: "lookup".to_string(),
                allowed_callers: vec![],
            },
            nodes: vec![
                node("start", NodeKind::Trigger, json!({})),
                node(
                    "notify",
                    NodeKind::SendMessage,
                    json!({"chatId": "ops", "body": "looking up"}),
                ),
            ],
            edges: vec![edge("start", "notify")],
            active: true,
        })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = hub
        .bus
        .call("tenant-a", "agent-a", "agent-b", "lookup", json!({"q": 1}), 200)
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(HubError::CrossAgentTimeout { timeout_ms }) => assert_eq!(timeout_ms, 200),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed < Duration::from_millis(500), "timeout must be prompt");

    // The late completion changes nothing for the caller; the target still
    // finishes its own execution.
    assert!(wait_sent(&adapter_b, 1, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn cross_agent_acl_denies_unlisted_caller() {
    let hub = test_hub().await;
    let (_adapter_a, _handle_a) = ready_agent(&hub, "agent-a2", "tenant-a").await;
    let (_adapter_b, _handle_b) = ready_agent(&hub, "agent-b2", "tenant-a").await;

    hub.flows
        .save(FlowDefinition {
            flow_id: "flow-private".to_string(),
            agent_id: "agent-b2".to_string(),
            name: "private".to_string(),
            trigger: TriggerSpec::CrossAgent {
                name: "private".to_string(),
                allowed_callers: vec!["someone-else".to_string()],
            },
            nodes: vec![node("start", NodeKind::Trigger, json!({}))],
            edges: vec![],
            active: true,
        })
        .await
        .unwrap();

    let result = hub
        .bus
        .call("tenant-a", "agent-a2", "agent-b2", "private", json!({}), 500)
        .await;
    assert!(matches!(result, Err(HubError::CrossAgentForbidden(_))));
}

#[tokio::test]
async fn cross_tenant_call_is_rejected() {
    let hub = test_hub().await;
    let (_adapter_a, _handle_a) = ready_agent(&hub, "agent-t1", "tenant-a").await;
    let (_adapter_b, _handle_b) = ready_agent(&hub, "agent-t2", "tenant-b").await;

    let result = hub
        .bus
        .call("tenant-a", "agent-t1", "agent-t2", "anything", json!({}), 500)
        .await;
    assert!(matches!(result, Err(HubError::UnknownAgent(_))));
}

#[tokio::test]
async fn delay_node_suspends_and_resumes() {
    let hub = test_hub().await;
    let (adapter, _handle) = ready_agent(&hub, "agent-delay", "tenant-a").await;

    hub.flows
        .save(FlowDefinition {
            flow_id: "flow-delay".to_string(),
            agent_id: "agent-delay".to_string(),
            name: "delayed reply".to_string(),
            trigger: TriggerSpec::Message {
                pattern: MessagePattern::Any,
                chat_id: None,
                include_from_me: false,
                time_window: None,
            },
            nodes: vec![
                node("start", NodeKind::Trigger, json!({})),
                node("wait", NodeKind::Delay, json!({"delayMs": 150})),
                node("reply", NodeKind::SendMessage, json!({"body": "after the wait"})),
            ],
            edges: vec![edge("start", "wait"), edge("wait", "reply")],
            active: true,
        })
        .await
        .unwrap();

    adapter
        .inject(AdapterEvent::InboundMessage(inbound(
            "agent-delay",
            "tgb:9",
            "anything",
            "Alice",
        )))
        .await;

    // The reply only lands after the scheduler wakes the execution.
    assert!(wait_sent(&adapter, 1, Duration::from_secs(5)).await);
    let sent = adapter.sent_commands().await;
    assert!(
        matches!(&sent[0], SendCommand::Text { body, .. } if body == "after the wait"),
        "unexpected send: {:?}",
        sent[0]
    );

    let executions = hub
        .persistence
        .list_executions("agent-delay", None, 10)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, "succeeded");
}
