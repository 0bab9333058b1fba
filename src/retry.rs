use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::agents::AgentDescriptor;
use crate::events::{EventSink, ProgressEvent, now};
use crate::invoker::{
    FailureReason, InvocationRequest, InvocationResult, ProcessRunner, invoke_once,
};

/// Smallest slice of budget worth spending on another attempt. If less
/// than this remains after the backoff delay, retrying would only burn
/// the deadline, so the controller gives up instead.
const MIN_ATTEMPT_BUDGET: Duration = Duration::from_secs(2);

/// Bounded exponential backoff for rate-limited agents.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 3 means up to 4 attempts total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). A server-provided
    /// retry-after hint overrides the curve; both are capped at
    /// `max_delay`.
    pub fn backoff_delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Apply ±20% jitter so simultaneously limited agents do not retry in
    /// lockstep.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(0.8..=1.2);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Drive one agent to a terminal result.
///
/// Only `RateLimited` is retried; `TimedOut` and `Failed` surface
/// immediately. Rate limits are the dominant transient condition for
/// these tools, while crashes and bad prompts do not improve on a second
/// try. Every delay is bounded by the time left until `deadline`; when
/// the remaining budget cannot fit another attempt the outcome becomes
/// `Failed(RetriesExhausted)` without spending the budget.
pub async fn run_with_retry(
    runner: &dyn ProcessRunner,
    descriptor: &AgentDescriptor,
    prompt: &str,
    json_output: bool,
    policy: &RetryPolicy,
    deadline: Instant,
    events: &EventSink,
) -> InvocationResult {
    let total_start = Instant::now();
    let mut retry_after_hint: Option<Duration> = None;
    let mut last_stderr = String::new();

    for attempt in 1..=policy.max_retries + 1 {
        if attempt > 1 {
            let delay = policy.with_jitter(policy.backoff_delay(attempt - 1, retry_after_hint));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < delay + MIN_ATTEMPT_BUDGET {
                tracing::warn!(
                    agent = %descriptor.name,
                    attempt,
                    remaining_secs = remaining.as_secs(),
                    "budget too small for another attempt, giving up"
                );
                return InvocationResult::Failed {
                    reason: FailureReason::RetriesExhausted { attempts: attempt - 1 },
                };
            }
            let reason = if last_stderr.is_empty() {
                "rate limited".to_string()
            } else {
                last_stderr.clone()
            };
            tracing::warn!(
                agent = %descriptor.name,
                attempt,
                max = policy.max_retries + 1,
                delay_secs = format!("{:.1}", delay.as_secs_f64()),
                "rate limited, retrying"
            );
            events.emit(ProgressEvent::AgentRetrying {
                agent: descriptor.name.clone(),
                attempt,
                reason,
                delay_ms: delay.as_millis() as u64,
                at: now(),
            });
            tokio::time::sleep(delay).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < MIN_ATTEMPT_BUDGET {
            return InvocationResult::Failed {
                reason: FailureReason::RetriesExhausted {
                    attempts: attempt - 1,
                },
            };
        }
        let request = InvocationRequest {
            agent: descriptor.name.clone(),
            prompt: prompt.to_string(),
            timeout: descriptor.timeout.min(remaining),
            attempt,
            json_output,
        };

        match invoke_once(runner, descriptor, &request, events).await {
            InvocationResult::RateLimited {
                retry_after,
                stderr,
            } => {
                retry_after_hint = retry_after;
                last_stderr = stderr;
            }
            InvocationResult::Success {
                output,
                stderr,
                duration: _,
                attempts: _,
            } => {
                if attempt > 1 {
                    tracing::info!(
                        agent = %descriptor.name,
                        retries = attempt - 1,
                        secs = format!("{:.1}", total_start.elapsed().as_secs_f64()),
                        "succeeded after retries"
                    );
                }
                return InvocationResult::Success {
                    output,
                    stderr,
                    duration: total_start.elapsed(),
                    attempts: attempt,
                };
            }
            terminal => return terminal,
        }
    }

    tracing::error!(
        agent = %descriptor.name,
        attempts = policy.max_retries + 1,
        "still rate limited after all retries"
    );
    InvocationResult::Failed {
        reason: FailureReason::RetriesExhausted {
            attempts: policy.max_retries + 1,
        },
    }
}
