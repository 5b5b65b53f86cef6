use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ai::types::{AiTask, ComplexityTier};

fn code_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[\s\S]*?```").expect("static regex"))
}

fn critical_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(security audit|prove|formal|production outage|incident|data loss)\b")
            .expect("static regex")
    })
}

fn trivial_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(hi|hello|hey|thanks|thank you|ok|yes|no|ping)\b[\s!?.]*$")
            .expect("static regex")
    })
}

/// Rule-based complexity classification with a bounded 24h cache for
/// high-confidence results.
pub struct Classifier {
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (ComplexityTier, Instant)>>,
}

impl Classifier {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn classify(&self, task: &AiTask) -> ComplexityTier {
        // An explicit hint always wins and is never cached.
        if let Some(hint) = task.complexity_hint {
            return hint;
        }

        let key = prompt_hash(&task.prompt);
        {
            let cache = self.cache.lock().await;
            if let Some((tier, stored_at)) = cache.get(&key) {
                if stored_at.elapsed() < self.cache_ttl {
                    return *tier;
                }
            }
        }

        let (tier, high_confidence) = classify_rules(task);
        debug!(tier = %tier, high_confidence, "Task classified");

        if high_confidence {
            let mut cache = self.cache.lock().await;
            if cache.len() >= 10_000 {
                cache.retain(|_, (_, at)| at.elapsed() < self.cache_ttl);
            }
            cache.insert(key, (tier, Instant::now()));
        }
        tier
    }
}

fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The rule set. Returns the tier and whether the signals were strong enough
/// to cache.
fn classify_rules(task: &AiTask) -> (ComplexityTier, bool) {
    // Vision or audio input forces a capable model.
    if !task.images.is_empty() || task.audio.is_some() {
        return (ComplexityTier::Complex, true);
    }

    let prompt = task.prompt.trim();

    if critical_regex().is_match(prompt) {
        return (ComplexityTier::Critical, true);
    }
    if trivial_regex().is_match(prompt) {
        return (ComplexityTier::Trivial, true);
    }

    let has_code = code_block_regex().is_match(prompt);
    let length = prompt.chars().count() + task.history.iter().map(|t| t.content.len()).sum::<usize>();

    let tier = match (has_code, length) {
        (true, n) if n > 2000 => ComplexityTier::Complex,
        (true, _) => ComplexityTier::Moderate,
        (false, n) if n <= 800 => ComplexityTier::Simple,
        (false, n) if n <= 4000 => ComplexityTier::Moderate,
        _ => ComplexityTier::Complex,
    };

    // Length-only classification is weak evidence; only code blocks make it
    // confident enough to cache.
    (tier, has_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(prompt: &str) -> AiTask {
        AiTask {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn hint_wins() {
        let classifier = Classifier::new(Duration::from_secs(60));
        let mut t = task("hello");
        t.complexity_hint = Some(ComplexityTier::Critical);
        assert_eq!(classifier.classify(&t).await, ComplexityTier::Critical);
    }

    #[tokio::test]
    async fn greetings_are_trivial() {
        let classifier = Classifier::new(Duration::from_secs(60));
        assert_eq!(classifier.classify(&task("hi!")).await, ComplexityTier::Trivial);
        assert_eq!(classifier.classify(&task("thanks")).await, ComplexityTier::Trivial);
    }

    #[tokio::test]
    async fn code_blocks_raise_tier() {
        let classifier = Classifier::new(Duration::from_secs(60));
        let t = task("fix this:\n```rust\nfn main() {}\n```");
        assert_eq!(classifier.classify(&t).await, ComplexityTier::Moderate);
    }

    #[tokio::test]
    async fn vision_input_is_complex() {
        let classifier = Classifier::new(Duration::from_secs(60));
        let mut t = task("what is in this picture?");
        t.images.push("aGk=".to_string());
        assert_eq!(classifier.classify(&t).await, ComplexityTier::Complex);
    }

    #[tokio::test]
    async fn critical_keywords() {
        let classifier = Classifier::new(Duration::from_secs(60));
        let t = task("run a security audit of the payment flow");
        assert_eq!(classifier.classify(&t).await, ComplexityTier::Critical);
    }

    #[tokio::test]
    async fn cached_classification_is_stable() {
        let classifier = Classifier::new(Duration::from_secs(60));
        let t = task("explain:\n```js\n1+1\n```");
        let first = classifier.classify(&t).await;
        let second = classifier.classify(&t).await;
        assert_eq!(first, second);
    }
}
