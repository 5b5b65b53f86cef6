use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapters::classify_http_error;
use crate::ai::types::{AiTask, ProviderKind, ProviderProfile};
use crate::utils::HubError;

/// Completion statistics reported when a provider stream finishes.
#[derive(Debug, Clone, Copy)]
pub struct StreamStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub success: bool,
}

/// A live provider stream plus its completion signal.
pub struct ProviderStream {
    pub chunks: mpsc::Receiver<Result<String, HubError>>,
    pub done: oneshot::Receiver<StreamStats>,
}

/// Rough token estimate used for usage records when the provider does not
/// report counts.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// Invoke one provider. The returned future resolves once the provider has
/// accepted the request, so a 5xx is observed before any chunk is emitted
/// and the router can fail over cleanly.
pub async fn invoke(
    http: &reqwest::Client,
    profile: &ProviderProfile,
    task: &AiTask,
) -> Result<ProviderStream, HubError> {
    match profile.kind {
        ProviderKind::Cli => invoke_cli(profile, task).await,
        _ => invoke_openai(http, profile, task).await,
    }
}

/// Cheap liveness probe; returns latency on success.
pub async fn probe(http: &reqwest::Client, profile: &ProviderProfile) -> Result<u64, HubError> {
    let started = Instant::now();
    match profile.kind {
        ProviderKind::Cli => {
            let command = profile
                .cli_command
                .as_deref()
                .ok_or_else(|| HubError::Validation("cli provider missing cli_command".into()))?;
            let program = command.split_whitespace().next().unwrap_or(command);
            let status = tokio::time::timeout(
                Duration::from_secs(10),
                Command::new(program)
                    .arg("--version")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status(),
            )
            .await
            .map_err(|_| HubError::Transient("cli probe timed out".into()))?
            .map_err(|e| HubError::Transient(format!("cli probe failed: {}", e)))?;

            if !status.success() {
                return Err(HubError::Transient(format!(
                    "cli probe exited with {}",
                    status
                )));
            }
        }
        _ => {
            let base = profile
                .base_url
                .as_deref()
                .ok_or_else(|| HubError::Validation("provider missing base_url".into()))?;
            let path = profile.probe_path.as_deref().unwrap_or("/v1/models");
            let mut request = http.get(format!("{}{}", base.trim_end_matches('/'), path));
            if let Some(key) = &profile.api_key {
                request = request.bearer_auth(key);
            }
            request
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| classify_http_error("provider probe", &e))?
                .error_for_status()
                .map_err(|e| classify_http_error("provider probe", &e))?;
        }
    }
    Ok(started.elapsed().as_millis() as u64)
}

async fn invoke_openai(
    http: &reqwest::Client,
    profile: &ProviderProfile,
    task: &AiTask,
) -> Result<ProviderStream, HubError> {
    let base = profile
        .base_url
        .as_deref()
        .ok_or_else(|| HubError::Validation("provider missing base_url".into()))?
        .trim_end_matches('/')
        .to_string();

    // Audio transcription uses its own endpoint and returns in one piece.
    if let Some(audio) = &task.audio {
        return invoke_transcription(http, profile, &base, audio).await;
    }

    let mut messages: Vec<Value> = task
        .history
        .iter()
        .map(|turn| json!({"role": turn.role, "content": turn.content}))
        .collect();

    if task.images.is_empty() {
        messages.push(json!({"role": "user", "content": task.prompt}));
    } else {
        let mut content = vec![json!({"type": "text", "text": task.prompt})];
        for image in &task.images {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/jpeg;base64,{}", image)}
            }));
        }
        messages.push(json!({"role": "user", "content": content}));
    }

    let mut body = json!({
        "model": profile.default_model,
        "messages": messages,
        "stream": true,
    });
    if let Some(max_tokens) = task.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = task.temperature {
        body["temperature"] = json!(temperature);
    }

    let started = Instant::now();
    let mut request = http.post(format!("{}/v1/chat/completions", base)).json(&body);
    if let Some(key) = &profile.api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_http_error("provider request", &e))?
        .error_for_status()
        .map_err(|e| classify_http_error("provider request", &e))?;

    let input_tokens = estimate_tokens(&task.prompt)
        + task
            .history
            .iter()
            .map(|t| estimate_tokens(&t.content))
            .sum::<u64>();

    let (tx, rx) = mpsc::channel(64);
    let (done_tx, done_rx) = oneshot::channel();
    let provider_id = profile.provider_id.clone();

    tokio::spawn(async move {
        let mut output = String::new();
        let mut buffer = String::new();
        let mut success = true;
        let mut response = response;

        'outer: loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim().to_string();
                        buffer.drain(..=newline);

                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            break 'outer;
                        }
                        match serde_json::from_str::<Value>(data) {
                            Ok(event) => {
                                if let Some(text) = event
                                    .pointer("/choices/0/delta/content")
                                    .and_then(|v| v.as_str())
                                {
                                    output.push_str(text);
                                    if tx.send(Ok(text.to_string())).await.is_err() {
                                        // Caller cancelled; drop the request.
                                        success = false;
                                        break 'outer;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(provider = %provider_id, error = %e,
                                       "Skipping unparseable stream line");
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    success = false;
                    let _ = tx
                        .send(Err(HubError::Transient(format!("stream broke: {}", e))))
                        .await;
                    break;
                }
            }
        }

        let _ = done_tx.send(StreamStats {
            input_tokens,
            output_tokens: estimate_tokens(&output),
            latency_ms: started.elapsed().as_millis() as u64,
            success,
        });
    });

    Ok(ProviderStream {
        chunks: rx,
        done: done_rx,
    })
}

async fn invoke_transcription(
    http: &reqwest::Client,
    profile: &ProviderProfile,
    base: &str,
    audio_base64: &str,
) -> Result<ProviderStream, HubError> {
    let started = Instant::now();
    let mut request = http
        .post(format!("{}/v1/audio/transcriptions", base))
        .json(&json!({
            "model": profile.default_model,
            "file_base64": audio_base64,
        }));
    if let Some(key) = &profile.api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_http_error("transcription request", &e))?
        .error_for_status()
        .map_err(|e| classify_http_error("transcription request", &e))?;
    let result: Value = response
        .json()
        .await
        .map_err(|e| classify_http_error("transcription body", &e))?;

    let text = result
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let (tx, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();
    let stats = StreamStats {
        input_tokens: (audio_base64.len() / 1000) as u64,
        output_tokens: estimate_tokens(&text),
        latency_ms: started.elapsed().as_millis() as u64,
        success: true,
    };
    tokio::spawn(async move {
        let _ = tx.send(Ok(text)).await;
        let _ = done_tx.send(stats);
    });

    Ok(ProviderStream {
        chunks: rx,
        done: done_rx,
    })
}

/// CLI provider: run the configured command, write the prompt to stdin and
/// stream stdout line by line.
async fn invoke_cli(profile: &ProviderProfile, task: &AiTask) -> Result<ProviderStream, HubError> {
    let command_line = profile
        .cli_command
        .as_deref()
        .ok_or_else(|| HubError::Validation("cli provider missing cli_command".into()))?;
    let mut parts = command_line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| HubError::Validation("empty cli_command".into()))?;

    let started = Instant::now();
    let mut child = Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| HubError::Transient(format!("failed to spawn cli provider: {}", e)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| HubError::Fatal("cli child has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HubError::Fatal("cli child has no stdout".into()))?;

    let prompt = task.prompt.clone();
    let input_tokens = estimate_tokens(&prompt);
    let (tx, rx) = mpsc::channel(64);
    let (done_tx, done_rx) = oneshot::channel();
    let provider_id = profile.provider_id.clone();

    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            warn!(provider = %provider_id, error = %e, "Failed to write cli prompt");
        }
        drop(stdin);

        let mut output = String::new();
        let mut lines = BufReader::new(stdout).lines();
        let mut success = true;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    output.push_str(&line);
                    output.push('\n');
                    if tx.send(Ok(format!("{}\n", line))).await.is_err() {
                        success = false;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    success = false;
                    let _ = tx
                        .send(Err(HubError::Transient(format!("cli stream broke: {}", e))))
                        .await;
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() => {
                success = false;
                let _ = tx
                    .send(Err(HubError::Transient(format!(
                        "cli provider exited with {}",
                        status
                    ))))
                    .await;
            }
            Err(e) => {
                success = false;
                warn!(provider = %provider_id, error = %e, "Failed to reap cli child");
            }
            _ => {}
        }

        let _ = done_tx.send(StreamStats {
            input_tokens,
            output_tokens: estimate_tokens(&output),
            latency_ms: started.elapsed().as_millis() as u64,
            success,
        });
    });

    Ok(ProviderStream {
        chunks: rx,
        done: done_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
