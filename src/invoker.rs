use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::agents::{AgentDescriptor, extract_retry_after, looks_rate_limited};
use crate::events::{EventSink, ProgressEvent, now};

/// One attempt against one agent. Created per attempt and discarded once
/// the attempt resolves.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub agent: String,
    pub prompt: String,
    pub timeout: Duration,
    pub attempt: u32,
    pub json_output: bool,
}

/// Why an invocation is terminally failed. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The agent binary could not be found or executed.
    NotInstalled { binary: String },
    /// The agent exited non-zero without a rate-limit signature.
    NonZeroExit { code: i32, stderr: String },
    /// Rate-limit retries used up, or the remaining budget could not
    /// accommodate another attempt.
    RetriesExhausted { attempts: u32 },
    /// Spawn or I/O error other than a missing binary.
    Spawn { detail: String },
}

impl FailureReason {
    pub fn detail(&self) -> String {
        match self {
            FailureReason::NotInstalled { binary } => {
                format!("binary '{binary}' is not installed or not on PATH")
            }
            FailureReason::NonZeroExit { code, stderr } => {
                let mut msg = format!("exited with code {code}");
                if !stderr.is_empty() {
                    let snippet: String = stderr.chars().take(200).collect();
                    msg.push_str(": ");
                    msg.push_str(&snippet);
                }
                msg
            }
            FailureReason::RetriesExhausted { attempts } => {
                format!("still rate limited after {attempts} attempts")
            }
            FailureReason::Spawn { detail } => detail.clone(),
        }
    }
}

/// Terminal-or-intermediate result of invocation attempts.
///
/// `RateLimited` is only ever seen by the retry controller; everything
/// that reaches the coordinator is terminal.
#[derive(Debug, Clone)]
pub enum InvocationResult {
    Success {
        output: String,
        stderr: String,
        duration: Duration,
        attempts: u32,
    },
    RateLimited {
        retry_after: Option<Duration>,
        stderr: String,
    },
    TimedOut {
        elapsed: Duration,
    },
    Failed {
        reason: FailureReason,
    },
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            InvocationResult::Success { attempts, .. } => *attempts,
            InvocationResult::Failed {
                reason: FailureReason::RetriesExhausted { attempts },
            } => *attempts,
            _ => 1,
        }
    }

    /// Human-readable status in the style agents report to the console.
    pub fn status_label(&self) -> String {
        match self {
            InvocationResult::Success { attempts, .. } if *attempts > 1 => {
                format!("SUCCESS (retried {}x)", attempts - 1)
            }
            InvocationResult::Success { .. } => "SUCCESS".to_string(),
            InvocationResult::RateLimited { .. } => "RATE_LIMITED".to_string(),
            InvocationResult::TimedOut { .. } => "TIMEOUT".to_string(),
            InvocationResult::Failed { .. } => "FAILED".to_string(),
        }
    }

    pub fn failure_detail(&self) -> Option<String> {
        match self {
            InvocationResult::Success { .. } => None,
            InvocationResult::RateLimited { stderr, .. } => Some(if stderr.is_empty() {
                "rate limited".to_string()
            } else {
                stderr.clone()
            }),
            InvocationResult::TimedOut { elapsed } => {
                Some(format!("timed out after {:.1}s", elapsed.as_secs_f64()))
            }
            InvocationResult::Failed { reason } => Some(reason.detail()),
        }
    }
}

/// Raw result of running one external process to completion.
#[derive(Debug, Clone)]
pub enum ProcessOutput {
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed {
        not_found: bool,
        detail: String,
    },
}

/// The process execution boundary.
///
/// This is the only place external tool specifics enter the engine; the
/// rest of the crate is agent-agnostic. Tests substitute a scripted
/// implementation.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, binary: &str, args: &[String], timeout: Duration) -> ProcessOutput;
}

/// Real runner backed by `tokio::process`.
///
/// `kill_on_drop` guarantees the child is killed and reaped on every exit
/// path, including when the wait future is dropped at the timeout or when
/// the whole task is cancelled by the global deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, binary: &str, args: &[String], timeout: Duration) -> ProcessOutput {
        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return ProcessOutput::SpawnFailed {
                    not_found: err.kind() == std::io::ErrorKind::NotFound,
                    detail: err.to_string(),
                };
            }
        };

        // Wall-clock timeout, independent of output activity: the child may
        // stay silent and alive; wait_with_output is simply abandoned (and
        // the child killed) when the timer fires.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ProcessOutput::Exited {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(err)) => ProcessOutput::SpawnFailed {
                not_found: false,
                detail: err.to_string(),
            },
            Err(_) => ProcessOutput::TimedOut,
        }
    }
}

/// Run one invocation attempt and classify its output.
///
/// Classification order matters: a rate-limit signature wins over the
/// exit code, since several tools exit zero while printing a quota error.
pub async fn invoke_once(
    runner: &dyn ProcessRunner,
    descriptor: &AgentDescriptor,
    request: &InvocationRequest,
    events: &EventSink,
) -> InvocationResult {
    let args = descriptor.build_args(&request.prompt, request.json_output);
    events.emit(ProgressEvent::AgentStarted {
        agent: request.agent.clone(),
        attempt: request.attempt,
        at: now(),
    });
    tracing::info!(
        agent = %request.agent,
        attempt = request.attempt,
        timeout_secs = request.timeout.as_secs(),
        "invoking agent"
    );

    let start = Instant::now();
    let output = runner
        .run(&descriptor.binary_path, &args, request.timeout)
        .await;
    let elapsed = start.elapsed();

    match output {
        ProcessOutput::Exited {
            code,
            stdout,
            stderr,
        } => {
            let output = strip_ansi(stdout.trim());
            let stderr = descriptor.filter_stderr(&stderr);
            let combined = format!("{output}\n{stderr}");
            if looks_rate_limited(&combined) {
                tracing::warn!(agent = %request.agent, code, "agent reported rate limit");
                InvocationResult::RateLimited {
                    retry_after: extract_retry_after(&combined),
                    stderr,
                }
            } else if code == 0 {
                tracing::info!(
                    agent = %request.agent,
                    secs = format!("{:.1}", elapsed.as_secs_f64()),
                    chars = output.len(),
                    "agent completed"
                );
                InvocationResult::Success {
                    output,
                    stderr,
                    duration: elapsed,
                    attempts: request.attempt,
                }
            } else {
                tracing::warn!(agent = %request.agent, code, "agent exited non-zero");
                InvocationResult::Failed {
                    reason: FailureReason::NonZeroExit { code, stderr },
                }
            }
        }
        ProcessOutput::TimedOut => {
            tracing::warn!(
                agent = %request.agent,
                secs = format!("{:.1}", elapsed.as_secs_f64()),
                "agent timed out"
            );
            events.emit(ProgressEvent::AgentTimedOut {
                agent: request.agent.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
                at: now(),
            });
            InvocationResult::TimedOut { elapsed }
        }
        ProcessOutput::SpawnFailed { not_found, detail } => {
            tracing::error!(agent = %request.agent, error = %detail, "failed to launch agent");
            let reason = if not_found {
                FailureReason::NotInstalled {
                    binary: descriptor.binary_path.clone(),
                }
            } else {
                FailureReason::Spawn { detail }
            };
            InvocationResult::Failed { reason }
        }
    }
}

/// Remove ANSI escape sequences (CSI and OSC) from captured output.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\u{1b}' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameters then a final byte in '@'..='~'.
                for ch in chars.by_ref() {
                    if ('@'..='~').contains(&ch) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC: terminated by BEL or ESC \.
                while let Some(ch) = chars.next() {
                    if ch == '\u{7}' {
                        break;
                    }
                    if ch == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            _ => {
                // Two-character escape, drop the follower too.
                chars.next();
            }
        }
    }
    out
}
