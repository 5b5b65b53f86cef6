use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a provider runs and what it costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Local,
    RemoteFree,
    RemotePaid,
    Cli,
}

impl ProviderKind {
    pub fn is_free(&self) -> bool {
        matches!(self, ProviderKind::Local | ProviderKind::RemoteFree | ProviderKind::Cli)
    }
}

/// Static description of one AI backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderProfile {
    pub provider_id: String,
    pub kind: ProviderKind,
    /// OpenAI-compatible base URL for `local` and `remote-*` kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_token: Option<f64>,
    /// Capability tags: "vision", "audio", "tts".
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    pub default_model: String,
    /// Probe path appended to `base_url`; defaults to `/v1/models`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_path: Option<String>,
    /// Command line for `cli` kind providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_command: Option<String>,
}

fn default_max_concurrent() -> usize {
    4
}

impl ProviderProfile {
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Mutable health record per provider. Written by the health monitor and the
/// router's error accounting, serialized per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub consecutive_errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<i64>,
    /// Circuit stays open until this instant even if a probe would pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_at: Option<i64>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_errors: 0,
            last_latency_ms: None,
            last_probe_at: None,
            recovery_at: None,
        }
    }
}

/// Task complexity buckets, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl ComplexityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Trivial => "trivial",
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
            ComplexityTier::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trivial" => Some(ComplexityTier::Trivial),
            "simple" => Some(ComplexityTier::Simple),
            "moderate" => Some(ComplexityTier::Moderate),
            "complex" => Some(ComplexityTier::Complex),
            "critical" => Some(ComplexityTier::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered provider chain per complexity tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverHierarchy {
    #[serde(default)]
    pub chains: HashMap<ComplexityTier, Vec<String>>,
}

impl FailoverHierarchy {
    pub fn chain(&self, tier: ComplexityTier) -> Vec<String> {
        if let Some(chain) = self.chains.get(&tier) {
            return chain.clone();
        }
        // Fall back to the nearest configured lower tier, then any tier.
        let order = [
            ComplexityTier::Critical,
            ComplexityTier::Complex,
            ComplexityTier::Moderate,
            ComplexityTier::Simple,
            ComplexityTier::Trivial,
        ];
        for candidate in order.iter().filter(|t| **t <= tier) {
            if let Some(chain) = self.chains.get(candidate) {
                return chain.clone();
            }
        }
        self.chains.values().next().cloned().unwrap_or_default()
    }
}

/// One conversational turn of history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// A routed AI request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiTask {
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    /// Base64-encoded images for vision-capable providers.
    #[serde(default)]
    pub images: Vec<String>,
    /// Base64-encoded audio payload for transcription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_hint: Option<ComplexityTier>,
    #[serde(default)]
    pub prefer_free: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Successful routing outcome: which provider answered plus the live stream.
pub struct RouteStream {
    pub provider_id: String,
    pub model: String,
    pub tier: ComplexityTier,
    pub chunks: tokio::sync::mpsc::Receiver<Result<String, crate::utils::HubError>>,
}

impl RouteStream {
    /// Drain the stream into one string. Convenience for flow nodes that
    /// need the full completion.
    pub async fn collect_text(mut self) -> Result<String, crate::utils::HubError> {
        let mut out = String::new();
        while let Some(chunk) = self.chunks.recv().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}
