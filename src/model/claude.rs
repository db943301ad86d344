use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use steward_common::Usage;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Completion, CompletionRequest, ModelClient};
use crate::errors::TransportError;
use crate::util::{extract_json_object, truncate_str};

/// Calls the model through the Claude CLI in non-interactive mode.
///
/// Runs `claude --print --output-format json --model <model>` with the prompt
/// on stdin. The output cap is passed through `CLAUDE_CODE_MAX_OUTPUT_TOKENS`.
pub struct ClaudeCliClient {
    claude_cmd: String,
    working_dir: PathBuf,
    call_timeout: Duration,
}

impl ClaudeCliClient {
    pub fn new(claude_cmd: impl Into<String>, working_dir: PathBuf, call_timeout: Duration) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            working_dir,
            call_timeout,
        }
    }

    fn command(&self, request: &CompletionRequest) -> Command {
        let mut cmd = Command::new(&self.claude_cmd);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(&request.model)
            .env("CLAUDE_CODE_MAX_OUTPUT_TOKENS", request.max_tokens.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            // Dropping the call (deadline, cancellation) must not leave the process behind.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ModelClient for ClaudeCliClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        let start = Instant::now();
        let mut child = self.command(request).spawn().map_err(|e| {
            TransportError::Provider(format!("failed to spawn '{}': {}", self.claude_cmd, e))
        })?;

        // Write prompt to stdin and close it
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| TransportError::Provider(format!("failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| TransportError::Provider(format!("failed to close stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(self.call_timeout))?
            .map_err(|e| TransportError::Provider(format!("failed to read output: {}", e)))?;
        let latency = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(
            exit = output.status.code().unwrap_or(-1),
            latency_ms = latency.as_millis() as u64,
            stdout_bytes = stdout.len(),
            "Claude CLI finished"
        );

        match parse_cli_output(&stdout) {
            Some(result) if !result.is_error && output.status.success() => {
                Ok(result.into_completion(latency))
            }
            Some(result) => Err(classify_failure(
                result.result.as_deref().unwrap_or(&stderr),
                self.call_timeout,
            )),
            None if output.status.success() => Err(TransportError::Provider(format!(
                "unparseable CLI output: {}",
                truncate_str(stdout.trim(), 200)
            ))),
            None => Err(classify_failure(
                if stderr.trim().is_empty() { &stdout } else { &stderr },
                self.call_timeout,
            )),
        }
    }
}

/// Final JSON object printed by `--output-format json`.
#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: CliUsage,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl CliResult {
    fn into_completion(self, latency: Duration) -> Completion {
        let prompt_tokens = self.usage.input_tokens
            + self.usage.cache_creation_input_tokens
            + self.usage.cache_read_input_tokens;
        Completion {
            text: self.result.unwrap_or_default(),
            usage: Usage::new(prompt_tokens, self.usage.output_tokens),
            latency,
            cost: self.total_cost_usd,
            truncated: self.stop_reason.as_deref() == Some("max_tokens"),
        }
    }
}

/// The CLI may print warnings before the JSON; take the outermost object.
fn parse_cli_output(stdout: &str) -> Option<CliResult> {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).ok().or_else(|| {
        extract_json_object(trimmed).and_then(|json| serde_json::from_str(&json).ok())
    })
}

fn classify_failure(message: &str, call_timeout: Duration) -> TransportError {
    let lower = message.to_lowercase();
    let message = truncate_str(message.trim(), 500);
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
        TransportError::RateLimit(message)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        TransportError::Timeout(call_timeout)
    } else {
        TransportError::Provider(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_json() {
        let stdout = r#"{"type":"result","subtype":"success","is_error":false,
            "result":"<summary>done</summary>patched","total_cost_usd":0.0123,
            "usage":{"input_tokens":900,"cache_read_input_tokens":100,"output_tokens":250}}"#;
        let result = parse_cli_output(stdout).unwrap();
        let completion = result.into_completion(Duration::from_millis(10));
        assert_eq!(completion.usage, Usage::new(1000, 250));
        assert_eq!(completion.cost, Some(0.0123));
        assert!(completion.text.contains("patched"));
        assert!(!completion.truncated);
    }

    #[test]
    fn test_parse_result_after_noise() {
        let stdout = "warning: update available\n{\"result\":\"ok\",\"stop_reason\":\"max_tokens\"}";
        let completion = parse_cli_output(stdout)
            .unwrap()
            .into_completion(Duration::ZERO);
        assert_eq!(completion.text, "ok");
        assert!(completion.truncated);
        assert_eq!(completion.cost, None);
    }

    #[test]
    fn test_unparseable_output() {
        assert!(parse_cli_output("not json at all").is_none());
    }

    #[test]
    fn test_classify_failure() {
        let t = Duration::from_secs(30);
        assert!(matches!(
            classify_failure("API Error: 429 Too Many Requests", t),
            TransportError::RateLimit(_)
        ));
        assert_eq!(
            classify_failure("request timed out", t),
            TransportError::Timeout(t)
        );
        assert!(matches!(
            classify_failure("invalid api key", t),
            TransportError::Provider(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_complete_with_fake_cli() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-claude");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"result\":\"hello\",\"usage\":{\"input_tokens\":12,\"output_tokens\":3}}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = ClaudeCliClient::new(
            script.to_string_lossy().to_string(),
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let completion = client
            .complete(&CompletionRequest {
                model: "claude-sonnet-4-5".into(),
                prompt: "say hello".into(),
                max_tokens: 64,
            })
            .await
            .unwrap();
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.usage, Usage::new(12, 3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_provider_error() {
        let client = ClaudeCliClient::new(
            "/nonexistent/claude-binary",
            std::env::temp_dir(),
            Duration::from_secs(5),
        );
        let err = client
            .complete(&CompletionRequest {
                model: "m".into(),
                prompt: "p".into(),
                max_tokens: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROVIDER_ERROR");
    }
}
