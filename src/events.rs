use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::coordinator::AgentOutcome;
use crate::pipeline::RunStage;
use crate::synthesis::SynthesisResult;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle events emitted while a run is in flight.
///
/// Events are append-only: once emitted they are never mutated, and
/// completion events arrive in the order agents actually resolve, not
/// dispatch order.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    AgentStarted {
        agent: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    AgentRetrying {
        agent: String,
        attempt: u32,
        reason: String,
        delay_ms: u64,
        at: DateTime<Utc>,
    },
    AgentCompleted {
        outcome: AgentOutcome,
        at: DateTime<Utc>,
    },
    AgentTimedOut {
        agent: String,
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
    StageChanged {
        stage: RunStage,
        at: DateTime<Utc>,
    },
    RunSynthesized {
        result: SynthesisResult,
        at: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn agent(&self) -> Option<&str> {
        match self {
            ProgressEvent::AgentStarted { agent, .. }
            | ProgressEvent::AgentRetrying { agent, .. }
            | ProgressEvent::AgentTimedOut { agent, .. } => Some(agent),
            ProgressEvent::AgentCompleted { outcome, .. } => Some(&outcome.agent),
            ProgressEvent::StageChanged { .. } | ProgressEvent::RunSynthesized { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProgressEvent::AgentStarted { .. } => "agent_started",
            ProgressEvent::AgentRetrying { .. } => "agent_retrying",
            ProgressEvent::AgentCompleted { .. } => "agent_completed",
            ProgressEvent::AgentTimedOut { .. } => "agent_timed_out",
            ProgressEvent::StageChanged { .. } => "stage_changed",
            ProgressEvent::RunSynthesized { .. } => "run_synthesized",
        }
    }
}

/// Bounded, non-blocking publisher for [`ProgressEvent`].
///
/// The engine never waits for a consumer: when the channel is full the
/// event is dropped (newest-dropped policy) with a debug log. Consumers
/// that need completeness should size the channel generously via
/// [`EventSink::channel`].
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl EventSink {
    /// A sink that discards every event, for callers that only want the
    /// final result.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(event = event.label(), "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
