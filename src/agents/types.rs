use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Millisecond UTC timestamp used on every wire and persisted record.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Whatsapp,
    TelegramBot,
    TelegramUser,
    Email,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Whatsapp => "whatsapp",
            Platform::TelegramBot => "telegram-bot",
            Platform::TelegramUser => "telegram-user",
            Platform::Email => "email",
        }
    }

    /// Prefix folded into message IDs so transport-native IDs are globally
    /// unique within an agent.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Platform::Whatsapp => "wa",
            Platform::TelegramBot => "tgb",
            Platform::TelegramUser => "tgu",
            Platform::Email => "em",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whatsapp" => Some(Platform::Whatsapp),
            "telegram-bot" => Some(Platform::TelegramBot),
            "telegram-user" => Some(Platform::TelegramUser),
            "email" => Some(Platform::Email),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the globally-unique message ID from a transport-native one.
pub fn prefixed_message_id(platform: Platform, native_id: &str) -> String {
    format!("{}:{}", platform.id_prefix(), native_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Message payload kind. Unknown variants from newer transports degrade to
/// `Unknown` instead of failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
    Location,
    Contact,
    Poll,
    Callback,
    Unknown,
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<MessageKind, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "audio" => MessageKind::Audio,
            "voice" => MessageKind::Voice,
            "document" => MessageKind::Document,
            "sticker" => MessageKind::Sticker,
            "location" => MessageKind::Location,
            "contact" => MessageKind::Contact,
            "poll" => MessageKind::Poll,
            "callback" => MessageKind::Callback,
            other => {
                tracing::warn!("Unknown message kind '{}', using unknown variant", other);
                MessageKind::Unknown
            }
        })
    }
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Voice => "voice",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Location => "location",
            MessageKind::Contact => "contact",
            MessageKind::Poll => "poll",
            MessageKind::Callback => "callback",
            MessageKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(MessageKind::Unknown)
    }
}

/// The platform-neutral message record shared by the wire and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedMessage {
    pub id: String,
    pub agent_id: String,
    pub platform: Platform,
    pub direction: Direction,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    /// Integer milliseconds since epoch, UTC.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub has_media: bool,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub meta: Value,
}

/// Agent lifecycle states, mutated only by the owning supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Authenticating,
    Ready,
    Swarming,
    Isolated,
    Disconnected,
    Failed,
    Archived,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Authenticating => "authenticating",
            AgentState::Ready => "ready",
            AgentState::Swarming => "swarming",
            AgentState::Isolated => "isolated",
            AgentState::Disconnected => "disconnected",
            AgentState::Failed => "failed",
            AgentState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(AgentState::Created),
            "authenticating" => Some(AgentState::Authenticating),
            "ready" => Some(AgentState::Ready),
            "swarming" => Some(AgentState::Swarming),
            "isolated" => Some(AgentState::Isolated),
            "disconnected" => Some(AgentState::Disconnected),
            "failed" => Some(AgentState::Failed),
            "archived" => Some(AgentState::Archived),
            _ => None,
        }
    }

    /// Legal lifecycle transitions. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Created, Authenticating) => true,
            (Authenticating, Ready) | (Authenticating, Disconnected) | (Authenticating, Failed) => {
                true
            }
            (Ready, Swarming) | (Ready, Disconnected) | (Ready, Archived) => true,
            (Swarming, Isolated) | (Swarming, Ready) | (Swarming, Disconnected) => true,
            (Isolated, Ready) | (Isolated, Disconnected) => true,
            (Disconnected, Authenticating) | (Disconnected, Failed) | (Disconnected, Archived) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reputation counters used by swarm participation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationCounters {
    pub successful_handoffs: u64,
    pub contributed_learnings: u64,
}

/// Everything the hub knows about one agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: String,
    pub platform: Platform,
    /// Opaque bag consumed only by the matching adapter.
    #[serde(default)]
    pub transport_config: Value,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_session: Option<String>,
    #[serde(default)]
    pub swarm_enabled: bool,
    #[serde(default)]
    pub reputation: ReputationCounters,
    pub state: AgentState,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPromptKind {
    Phone,
    Code,
    Password,
}

impl AuthPromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthPromptKind::Phone => "phone",
            AuthPromptKind::Code => "code",
            AuthPromptKind::Password => "password",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "phone" => Some(AuthPromptKind::Phone),
            "code" => Some(AuthPromptKind::Code),
            "password" => Some(AuthPromptKind::Password),
            _ => None,
        }
    }
}

impl fmt::Display for AuthPromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account details reported by a transport once authenticated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub account_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Reference an adapter can resolve to the media bytes of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub message_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub meta: Value,
}

/// Upward event stream from a platform adapter to its supervisor.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    QrIssued {
        bytes: Vec<u8>,
    },
    AuthPromptRequired {
        kind: AuthPromptKind,
    },
    Authenticated {
        info: AccountInfo,
    },
    Ready {
        info: AccountInfo,
    },
    InboundMessage(UnifiedMessage),
    MessageEdited {
        message_id: String,
        chat_id: String,
        new_body: String,
        edited_at: i64,
    },
    MessageDeleted {
        message_id: String,
        chat_id: String,
    },
    Typing {
        chat_id: String,
        sender_id: String,
    },
    Disconnected {
        reason: String,
        recoverable: bool,
    },
    FatalError {
        reason: String,
    },
}

/// Normalized send command accepted by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendCommand {
    Text {
        chat_id: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Media {
        chat_id: String,
        /// Content key in the agent's media cache.
        media_key: String,
        mime_type: String,
        #[serde(default)]
        caption: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    Location {
        chat_id: String,
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Contact {
        chat_id: String,
        name: String,
        phone: String,
    },
    Buttons {
        chat_id: String,
        body: String,
        buttons: Vec<String>,
    },
    Poll {
        chat_id: String,
        question: String,
        options: Vec<String>,
    },
    Reaction {
        chat_id: String,
        message_id: String,
        emoji: String,
    },
    Forward {
        chat_id: String,
        from_chat_id: String,
        message_id: String,
    },
    Edit {
        chat_id: String,
        message_id: String,
        body: String,
    },
    Delete {
        chat_id: String,
        message_id: String,
    },
}

impl SendCommand {
    pub fn chat_id(&self) -> &str {
        match self {
            SendCommand::Text { chat_id, .. }
            | SendCommand::Media { chat_id, .. }
            | SendCommand::Location { chat_id, .. }
            | SendCommand::Contact { chat_id, .. }
            | SendCommand::Buttons { chat_id, .. }
            | SendCommand::Poll { chat_id, .. }
            | SendCommand::Reaction { chat_id, .. }
            | SendCommand::Forward { chat_id, .. }
            | SendCommand::Edit { chat_id, .. }
            | SendCommand::Delete { chat_id, .. } => chat_id,
        }
    }

    /// Short tag for logging and persisted send results.
    pub fn kind_str(&self) -> &'static str {
        match self {
            SendCommand::Text { .. } => "text",
            SendCommand::Media { .. } => "media",
            SendCommand::Location { .. } => "location",
            SendCommand::Contact { .. } => "contact",
            SendCommand::Buttons { .. } => "buttons",
            SendCommand::Poll { .. } => "poll",
            SendCommand::Reaction { .. } => "reaction",
            SendCommand::Forward { .. } => "forward",
            SendCommand::Edit { .. } => "edit",
            SendCommand::Delete { .. } => "delete",
        }
    }
}

/// Outcome of a successful adapter send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub platform_message_id: String,
    pub sent_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_prefixing() {
        assert_eq!(prefixed_message_id(Platform::Whatsapp, "ABC"), "wa:ABC");
        assert_eq!(prefixed_message_id(Platform::TelegramBot, "42"), "tgb:42");
    }

    #[test]
    fn unknown_message_kind_degrades() {
        let kind: MessageKind = serde_json::from_str("\"hologram\"").unwrap();
        assert_eq!(kind, MessageKind::Unknown);
        let kind: MessageKind = serde_json::from_str("\"voice\"").unwrap();
        assert_eq!(kind, MessageKind::Voice);
    }

    #[test]
    fn state_machine_transitions() {
        use AgentState::*;
        assert!(Created.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Swarming));
        assert!(Swarming.can_transition_to(Isolated));
        assert!(Disconnected.can_transition_to(Authenticating));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Created.can_transition_to(Ready));
        assert!(!Archived.can_transition_to(Authenticating));
    }

    #[test]
    fn unified_message_wire_shape() {
        let msg = UnifiedMessage {
            id: "tgb:7".to_string(),
            agent_id: "agent-1".to_string(),
            platform: Platform::TelegramBot,
            direction: Direction::Inbound,
            chat_id: "100".to_string(),
            sender_id: "42".to_string(),
            sender_name: "Alice".to_string(),
            body: "hello".to_string(),
            timestamp: 1_700_000_000_000,
            kind: MessageKind::Text,
            has_media: false,
            from_me: false,
            reply_to: None,
            meta: serde_json::json!({}),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["platform"], "telegram-bot");
        assert_eq!(json["type"], "text");
        assert_eq!(json["fromMe"], false);

        let back: UnifiedMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn send_command_chat_routing() {
        let cmd = SendCommand::Reaction {
            chat_id: "c9".to_string(),
            message_id: "wa:1".to_string(),
            emoji: "👍".to_string(),
        };
        assert_eq!(cmd.chat_id(), "c9");
        assert_eq!(cmd.kind_str(), "reaction");
    }
}
