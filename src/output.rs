use crossterm::style::Stylize;

use crate::coordinator::AgentOutcome;
use crate::events::ProgressEvent;
use crate::synthesis::SynthesisResult;

fn styled_status(label: &str) -> String {
    let owned = label.to_string();
    if label.starts_with("SUCCESS") {
        owned.green().to_string()
    } else if label == "RATE_LIMITED" {
        owned.yellow().to_string()
    } else if label == "TIMEOUT" {
        owned.magenta().to_string()
    } else {
        owned.red().to_string()
    }
}

fn outcome_header(outcome: &AgentOutcome) -> String {
    format!(
        "{} [{}] ({:.1}s)",
        outcome.agent.clone().bold(),
        styled_status(&outcome.status_label()),
        outcome.wall_time.as_secs_f64()
    )
}

/// Side-by-side rendering for compare mode: every outcome gets its own
/// attributed section, failures included.
pub fn print_compare(result: &SynthesisResult) {
    for outcome in &result.provenance {
        println!("{}", outcome_header(outcome));
        if outcome.is_success() {
            println!("{}\n", outcome.output());
        } else {
            println!(
                "{}\n",
                outcome.result.failure_detail().unwrap_or_default().dim()
            );
        }
    }
}

/// Final answer for direct/pipeline mode, with a footnote for any agent
/// that did not contribute.
pub fn print_answer(result: &SynthesisResult) {
    println!("{}", result.answer);
    let failed = result.failed_agents();
    if !failed.is_empty() {
        println!();
        for outcome in failed {
            println!(
                "{}",
                format!(
                    "note: {} {} ({})",
                    outcome.agent,
                    outcome.status_label().to_ascii_lowercase(),
                    outcome.result.failure_detail().unwrap_or_default()
                )
                .dim()
            );
        }
    }
}

/// One dim progress line per lifecycle event, for direct-run output.
/// Returns `None` for events that the console does not surface.
pub fn progress_line(event: &ProgressEvent) -> Option<String> {
    let line = match event {
        ProgressEvent::AgentStarted { agent, attempt, .. } => {
            if *attempt > 1 {
                format!("[{agent}] attempt {attempt} started")
            } else {
                format!("[{agent}] started")
            }
        }
        ProgressEvent::AgentRetrying {
            agent,
            attempt,
            delay_ms,
            ..
        } => format!(
            "[{agent}] rate limited, retry {attempt} in {:.1}s",
            *delay_ms as f64 / 1000.0
        ),
        ProgressEvent::AgentCompleted { outcome, .. } => format!(
            "[{}] {} ({:.1}s)",
            outcome.agent,
            outcome.status_label(),
            outcome.wall_time.as_secs_f64()
        ),
        ProgressEvent::AgentTimedOut {
            agent, elapsed_ms, ..
        } => format!("[{agent}] timed out after {:.1}s", *elapsed_ms as f64 / 1000.0),
        ProgressEvent::StageChanged { stage, .. } => format!("stage: {}", stage.label()),
        ProgressEvent::RunSynthesized { .. } => return None,
    };
    Some(line.dim().to_string())
}
