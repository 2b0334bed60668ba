//! Model client seam plus retrying and command-bridge adapters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{Completion, CompletionRequest};
use crate::io::config::{ModelConfig, RetryConfig};
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Exit code (`EX_TEMPFAIL`) a bridge uses to signal a retryable provider error.
pub const TRANSIENT_EXIT_CODE: i32 = 75;

const BRIDGE_OUTPUT_LIMIT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Rate limit, overload, 5xx, or timeout. Retried by [`RetryingClient`].
    #[error("transient model error: {0}")]
    Transient(String),
    #[error("model error: {0}")]
    Fatal(String),
    #[error("model request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// A chat model that supports tool use.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        (**self).complete(request).await
    }
}

/// Exponential backoff with jitter for transient model errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed): `min(base * 2^attempt, max)` plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_backoff_ms);
        let jitter_range = capped / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// Wraps a client, retrying [`ModelError::Transient`] failures.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for RetryingClient<C> {
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(ModelError::Transient(message)) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(ModelError::RetriesExhausted {
                            attempts: attempt,
                            last: message,
                        });
                    }
                    let delay = self.policy.delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, %message, "transient model error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Bridges to an external provider program.
///
/// The request is written as JSON to stdin; the program prints a [`Completion`]
/// as JSON on stdout. Exit code 75 or a timeout is transient, any other
/// failure is fatal.
#[derive(Debug, Clone)]
pub struct CommandModelClient {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandModelClient {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl ModelClient for CommandModelClient {
    #[instrument(skip_all, fields(messages = request.messages.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ModelError::Fatal(format!("serialize request: {e}")))?;
        let cmd = command_from_argv(&self.argv).map_err(|e| ModelError::Fatal(e.to_string()))?;
        let output = run_command_with_timeout(
            cmd,
            Some(payload),
            self.timeout,
            BRIDGE_OUTPUT_LIMIT_BYTES,
        )
        .await
        .map_err(|e| ModelError::Fatal(format!("{e:#}")))?;

        if output.timed_out {
            return Err(ModelError::Transient(format!(
                "model bridge timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        match output.exit_code {
            Some(0) => {}
            Some(TRANSIENT_EXIT_CODE) => {
                return Err(ModelError::Transient(output.stderr_lossy().trim().to_string()));
            }
            _ => return Err(ModelError::Fatal(output.report("model bridge"))),
        }
        if output.stdout_truncated > 0 {
            return Err(ModelError::Fatal("model bridge output exceeded limit".to_string()));
        }
        let completion: Completion = serde_json::from_slice(&output.stdout)
            .map_err(|e| ModelError::Fatal(format!("parse model bridge output: {e}")))?;
        debug!(
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "completion received"
        );
        Ok(completion)
    }
}

/// Build the primary and vision clients from config, each wrapped with retries.
pub fn clients_from_config(config: &ModelConfig) -> (Arc<dyn ModelClient>, Arc<dyn ModelClient>) {
    let timeout = Duration::from_secs(config.timeout_secs);
    let policy = RetryPolicy::from(&config.retry);
    let primary: Arc<dyn ModelClient> = Arc::new(RetryingClient::new(
        CommandModelClient::new(config.command.clone(), timeout),
        policy.clone(),
    ));
    let vision: Arc<dyn ModelClient> = match &config.vision_command {
        Some(argv) => Arc::new(RetryingClient::new(
            CommandModelClient::new(argv.clone(), timeout),
            policy,
        )),
        None => Arc::clone(&primary),
    };
    (primary, vision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ContentBlock, Message, StopReason};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Flaky {
        replies: Mutex<VecDeque<Result<Completion, ModelError>>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ModelClient for Flaky {
        async fn complete(&self, _: &CompletionRequest) -> Result<Completion, ModelError> {
            *self.calls.lock().expect("lock") += 1;
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .expect("scripted reply")
        }
    }

    fn completion() -> Completion {
        Completion {
            content: vec![ContentBlock::text("ok")],
            input_tokens: 1,
            output_tokens: 1,
            stop_reason: StopReason::EndTurn,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user_text("hi")],
            max_tokens: 16,
            system_prompt: None,
            tools: Vec::new(),
            temperature: 0.0,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let client = RetryingClient::new(
            Flaky {
                replies: Mutex::new(VecDeque::from([
                    Err(ModelError::Transient("429".to_string())),
                    Ok(completion()),
                ])),
                calls: Mutex::new(0),
            },
            fast_policy(3),
        );
        assert_eq!(client.complete(&request()).await, Ok(completion()));
        assert_eq!(*client.inner.calls.lock().expect("lock"), 2);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_fatal() {
        let client = RetryingClient::new(
            Flaky {
                replies: Mutex::new(VecDeque::from([
                    Err(ModelError::Transient("503".to_string())),
                    Err(ModelError::Transient("503 again".to_string())),
                ])),
                calls: Mutex::new(0),
            },
            fast_policy(2),
        );
        assert_eq!(
            client.complete(&request()).await,
            Err(ModelError::RetriesExhausted {
                attempts: 2,
                last: "503 again".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let client = RetryingClient::new(
            Flaky {
                replies: Mutex::new(VecDeque::from([Err(ModelError::Fatal("400".to_string()))])),
                calls: Mutex::new(0),
            },
            fast_policy(5),
        );
        assert!(matches!(
            client.complete(&request()).await,
            Err(ModelError::Fatal(_))
        ));
        assert_eq!(*client.inner.calls.lock().expect("lock"), 1);
    }

    #[test]
    fn delay_is_capped_with_bounded_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let first = policy.delay(0).as_millis();
        assert!((100..110).contains(&first), "{first}");
        let late = policy.delay(10).as_millis();
        assert!((1_000..1_100).contains(&late), "{late}");
    }

    #[tokio::test]
    async fn command_bridge_parses_stdout_completion() {
        let reply = serde_json::to_string(&completion()).expect("serialize");
        let client = CommandModelClient::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat > /dev/null; printf '%s' '{reply}'"),
            ],
            Duration::from_secs(10),
        );
        assert_eq!(client.complete(&request()).await, Ok(completion()));
    }

    #[tokio::test]
    async fn command_bridge_maps_exit_75_to_transient() {
        let client = CommandModelClient::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo rate limited >&2; exit 75".to_string(),
            ],
            Duration::from_secs(10),
        );
        assert_eq!(
            client.complete(&request()).await,
            Err(ModelError::Transient("rate limited".to_string()))
        );
    }
}
