use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::agents::AgentTable;
use crate::events::{EventSink, ProgressEvent, now};
use crate::invoker::{FailureReason, InvocationResult, ProcessRunner};
use crate::retry::{RetryPolicy, run_with_retry};

/// Terminal per-agent record for one run. Exactly one exists per
/// dispatched agent, and it never changes once recorded.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent: String,
    pub result: InvocationResult,
    pub wall_time: Duration,
    pub attempts: u32,
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    pub fn status_label(&self) -> String {
        self.result.status_label()
    }

    pub fn output(&self) -> &str {
        match &self.result {
            InvocationResult::Success { output, .. } => output,
            _ => "",
        }
    }
}

/// One unit of dispatch: an installed agent plus the prompt it receives.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub agent: String,
    pub prompt: String,
}

/// Fan out one retry-wrapped invocation per task and fan completions back
/// in as they resolve.
///
/// The returned map always contains exactly one terminal outcome per
/// task. Completion events are emitted in arrival order, which is
/// nondeterministic; consumers must not assume dispatch order. When the
/// global deadline elapses, outstanding tasks are aborted (their child
/// processes killed via the runner's kill-on-drop guarantee) and marked
/// `TimedOut`, while already-resolved outcomes are left untouched.
/// Partial completion is a normal state, not an error.
pub async fn dispatch_all(
    runner: Arc<dyn ProcessRunner>,
    table: &AgentTable,
    tasks: Vec<DispatchTask>,
    json_output: bool,
    policy: RetryPolicy,
    deadline: Instant,
    events: &EventSink,
) -> BTreeMap<String, AgentOutcome> {
    let mut outcomes: BTreeMap<String, AgentOutcome> = BTreeMap::new();
    let mut in_flight = JoinSet::new();
    let dispatched: Vec<String> = tasks.iter().map(|task| task.agent.clone()).collect();
    let started = Instant::now();

    for task in tasks {
        let Some(descriptor) = table.get(&task.agent).cloned() else {
            // Each agent's slot is written exactly once, here or below.
            outcomes.insert(
                task.agent.clone(),
                AgentOutcome {
                    agent: task.agent.clone(),
                    result: InvocationResult::Failed {
                        reason: FailureReason::NotInstalled {
                            binary: task.agent.clone(),
                        },
                    },
                    wall_time: Duration::ZERO,
                    attempts: 0,
                },
            );
            continue;
        };
        let runner = Arc::clone(&runner);
        let events = events.clone();
        in_flight.spawn(async move {
            let start = Instant::now();
            let result = run_with_retry(
                runner.as_ref(),
                &descriptor,
                &task.prompt,
                json_output,
                &policy,
                deadline,
                &events,
            )
            .await;
            AgentOutcome {
                agent: task.agent,
                attempts: result.attempts(),
                wall_time: start.elapsed(),
                result,
            }
        });
    }

    for agent in dispatched.iter() {
        if let Some(outcome) = outcomes.get(agent) {
            events.emit(ProgressEvent::AgentCompleted {
                outcome: outcome.clone(),
                at: now(),
            });
        }
    }

    while !in_flight.is_empty() {
        match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
            Ok(Some(Ok(outcome))) => {
                events.emit(ProgressEvent::AgentCompleted {
                    outcome: outcome.clone(),
                    at: now(),
                });
                outcomes.entry(outcome.agent.clone()).or_insert(outcome);
            }
            Ok(Some(Err(err))) => {
                tracing::error!(error = %err, "agent task failed to join");
            }
            Ok(None) => break,
            Err(_) => {
                // Global deadline: cancel everything still outstanding.
                // Cancelling one agent never blocks its siblings; resolved
                // outcomes stay as they are.
                tracing::warn!(
                    outstanding = in_flight.len(),
                    "global deadline elapsed, cancelling outstanding agents"
                );
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
                break;
            }
        }
    }

    let elapsed = started.elapsed();
    for agent in dispatched {
        if outcomes.contains_key(&agent) {
            continue;
        }
        let outcome = AgentOutcome {
            agent: agent.clone(),
            result: InvocationResult::TimedOut { elapsed },
            wall_time: elapsed,
            attempts: 0,
        };
        events.emit(ProgressEvent::AgentTimedOut {
            agent: agent.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
            at: now(),
        });
        events.emit(ProgressEvent::AgentCompleted {
            outcome: outcome.clone(),
            at: now(),
        });
        outcomes.insert(agent, outcome);
    }

    outcomes
}
