mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_hub, wait_message, wait_prompt, wait_state};
use serde_json::json;
use swarmhub::adapters::mock::MockAdapter;
use swarmhub::agents::types::{
    AccountInfo, AdapterEvent, AgentState, AuthPromptKind, Direction, MessageKind, Platform,
    UnifiedMessage,
};
use swarmhub::hub::{Envelope, HubFrame, SubscriptionFilters};
use swarmhub::storage::ArtifactStatus;
use tokio::sync::mpsc;

fn account(id: &str, username: &str) -> AccountInfo {
    AccountInfo {
        account_id: id.to_string(),
        username: Some(username.to_string()),
        display_name: Some(username.to_string()),
    }
}

fn inbound(agent: &str, id: &str, chat: &str, body: &str, sender: &str) -> UnifiedMessage {
    UnifiedMessage {
        id: id.to_string(),
        agent_id: agent.to_string(),
        platform: Platform::TelegramBot,
        direction: Direction::Inbound,
        chat_id: chat.to_string(),
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

async fn drain(rx: &mut mpsc::Receiver<Envelope>, wait: Duration) -> Vec<Envelope> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(envelope)) => out.push(envelope),
            _ => break,
        }
    }
    out
}

#[tokio::test]
async fn bot_bringup_reaches_ready_without_qr() {
    let hub = test_hub().await;
    let (_sid, mut rx) = hub
        .hub
        .subscribe("tenant-a", SubscriptionFilters::default())
        .await;

    let adapter = Arc::new(MockAdapter::new(Platform::TelegramBot));
    adapter
        .script_initial(vec![
            AdapterEvent::Authenticated {
                info: account("42", "demobot"),
            },
            AdapterEvent::Ready {
                info: account("42", "demobot"),
            },
        ])
        .await;

    let handle = hub
        .spawn_agent("agent-bot", "tenant-a", Platform::TelegramBot, adapter)
        .await;
    handle.connect().await.unwrap();

    assert!(wait_state(&handle, AgentState::Ready, Duration::from_secs(2)).await);

    let frames = drain(&mut rx, Duration::from_millis(200)).await;
    let transitions: Vec<(AgentState, AgentState)> = frames
        .iter()
        .filter_map(|e| match &e.frame {
            HubFrame::Status { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (AgentState::Created, AgentState::Authenticating),
            (AgentState::Authenticating, AgentState::Ready),
        ]
    );
    assert!(
        !frames.iter().any(|e| matches!(e.frame, HubFrame::Qr { .. })),
        "token bring-up must not emit a qr frame"
    );

    // Registry lookup is tenant scoped.
    assert_eq!(hub.registry.list("tenant-a").await.len(), 1);
    assert!(hub.registry.list("tenant-b").await.is_empty());
    assert!(hub.registry.get("tenant-b", "agent-bot").await.is_err());
}

#[tokio::test]
async fn whatsapp_qr_flow_clears_qr_after_auth() {
    let hub = test_hub().await;
    let (_sid, mut rx) = hub
        .hub
        .subscribe("tenant-a", SubscriptionFilters::default())
        .await;

    let adapter = Arc::new(MockAdapter::new(Platform::Whatsapp));
    adapter
        .script_initial(vec![
            AdapterEvent::QrIssued {
                bytes: b"AAAA".to_vec(),
            },
            AdapterEvent::Authenticated {
                info: account("491700000", "wa"),
            },
            AdapterEvent::Ready {
                info: account("491700000", "wa"),
            },
        ])
        .await;

    let handle = hub
        .spawn_agent("agent-wa", "tenant-a", Platform::Whatsapp, adapter)
        .await;
    handle.connect().await.unwrap();

    assert!(wait_state(&handle, AgentState::Ready, Duration::from_secs(2)).await);

    let frames = drain(&mut rx, Duration::from_millis(200)).await;
    let qr_frames: Vec<&str> = frames
        .iter()
        .filter_map(|e| match &e.frame {
            HubFrame::Qr { bytes, .. } => Some(bytes.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(qr_frames, vec!["QUFBQQ=="], "exactly one qr frame, base64 of AAAA");

    // QR is cleared from state once authenticated.
    let status = handle.status().await.unwrap();
    assert_eq!(status.record.state, AgentState::Ready);
    assert!(status.qr.is_none());
}

#[tokio::test]
async fn telegram_user_two_factor_auth() {
    let hub = test_hub().await;
    let (_sid, mut rx) = hub
        .hub
        .subscribe("tenant-a", SubscriptionFilters::default())
        .await;

    let adapter = Arc::new(MockAdapter::new(Platform::TelegramUser));
    adapter
        .script_initial(vec![AdapterEvent::AuthPromptRequired {
            kind: AuthPromptKind::Code,
        }])
        .await;
    adapter
        .script_auth(
            AuthPromptKind::Code,
            vec![AdapterEvent::AuthPromptRequired {
                kind: AuthPromptKind::Password,
            }],
        )
        .await;
    adapter
        .script_auth(
            AuthPromptKind::Password,
            vec![
                AdapterEvent::Authenticated {
                    info: account("7", "mtuser"),
                },
                AdapterEvent::Ready {
                    info: account("7", "mtuser"),
                },
            ],
        )
        .await;

    let handle = hub
        .spawn_agent("agent-mt", "tenant-a", Platform::TelegramUser, adapter.clone())
        .await;
    handle.connect().await.unwrap();

    assert!(wait_prompt(&handle, AuthPromptKind::Code, Duration::from_secs(2)).await);
    handle.submit_auth(AuthPromptKind::Code, "12345").await.unwrap();

    assert!(wait_prompt(&handle, AuthPromptKind::Password, Duration::from_secs(2)).await);
    handle
        .submit_auth(AuthPromptKind::Password, "hunter2")
        .await
        .unwrap();

    assert!(wait_state(&handle, AgentState::Ready, Duration::from_secs(2)).await);

    // Two auth prompt frames, code before password.
    let frames = drain(&mut rx, Duration::from_millis(200)).await;
    let prompts: Vec<AuthPromptKind> = frames
        .iter()
        .filter_map(|e| match &e.frame {
            HubFrame::AuthPrompt { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect();
    assert_eq!(prompts, vec![AuthPromptKind::Code, AuthPromptKind::Password]);

    // Session artifact persisted and complete after ready.
    let artifact = hub.sessions.load("agent-mt").await.unwrap().unwrap();
    assert_eq!(artifact.status, ArtifactStatus::Complete);
    assert!(!artifact.revoked);

    // Re-submitting the accepted value is a no-op, not an error.
    handle
        .submit_auth(AuthPromptKind::Password, "hunter2")
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_ingest_persists_and_publishes_once() {
    let hub = test_hub().await;

    let adapter = Arc::new(MockAdapter::new(Platform::TelegramBot));
    adapter
        .script_initial(vec![
            AdapterEvent::Authenticated {
                info: account("1", "bot"),
            },
            AdapterEvent::Ready {
                info: account("1", "bot"),
            },
        ])
        .await;
    let handle = hub
        .spawn_agent("agent-dup", "tenant-a", Platform::TelegramBot, adapter.clone())
        .await;
    handle.connect().await.unwrap();
    assert!(wait_state(&handle, AgentState::Ready, Duration::from_secs(2)).await);

    let (_sid, mut rx) = hub
        .hub
        .subscribe("tenant-a", SubscriptionFilters::default())
        .await;

    let message = inbound("agent-dup", "tgb:77", "chat-1", "hello twice", "Alice");
    adapter
        .inject(AdapterEvent::InboundMessage(message.clone()))
        .await;
    adapter.inject(AdapterEvent::InboundMessage(message)).await;

    assert!(wait_message(&hub.persistence, "agent-dup", "tgb:77", Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rows = hub
        .persistence
        .get_messages("agent-dup", Some("chat-1"), None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "second ingest must be dropped as duplicate");

    let frames = drain(&mut rx, Duration::from_millis(200)).await;
    let published = frames
        .iter()
        .filter(|e| matches!(e.frame, HubFrame::Message { .. }))
        .count();
    assert_eq!(published, 1, "exactly one hub publication per unique message");
}

#[tokio::test]
async fn subscriber_isolation_across_tenants() {
    let hub = test_hub().await;

    let adapter = Arc::new(MockAdapter::new(Platform::TelegramBot));
    adapter
        .script_initial(vec![
            AdapterEvent::Authenticated {
                info: account("1", "bot"),
            },
            AdapterEvent::Ready {
                info: account("1", "bot"),
            },
        ])
        .await;
    let handle = hub
        .spawn_agent("agent-iso", "tenant-a", Platform::TelegramBot, adapter.clone())
        .await;
    handle.connect().await.unwrap();
    assert!(wait_state(&handle, AgentState::Ready, Duration::from_secs(2)).await);

    let (_sa, mut rx_a) = hub
        .hub
        .subscribe("tenant-a", SubscriptionFilters::default())
        .await;
    let (_sb, mut rx_b) = hub
        .hub
        .subscribe("tenant-b", SubscriptionFilters::default())
        .await;

    adapter
        .inject(AdapterEvent::InboundMessage(inbound(
            "agent-iso", "tgb:1", "c", "secret", "Alice",
        )))
        .await;

    let frames_a = drain(&mut rx_a, Duration::from_millis(300)).await;
    let frames_b = drain(&mut rx_b, Duration::from_millis(100)).await;
    assert!(frames_a
        .iter()
        .any(|e| matches!(e.frame, HubFrame::Message { .. })));
    assert!(
        frames_b.is_empty(),
        "tenant-b must never observe tenant-a frames"
    );
}
