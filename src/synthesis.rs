use std::collections::BTreeMap;

use anyhow::{Result, bail};

use crate::coordinator::AgentOutcome;

/// How the final answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStrategy {
    /// Single agent, answer passed through verbatim.
    DirectAnswer,
    /// Compare mode: outcomes surfaced independently, unmerged.
    SideBySide,
    /// Pipeline mode: the primary agent merged the worker outputs.
    PrimaryMerge,
    /// Pipeline fallback: successful outputs concatenated with
    /// per-agent attribution headers.
    AttributedConcat,
}

impl SynthesisStrategy {
    pub fn label(self) -> &'static str {
        match self {
            SynthesisStrategy::DirectAnswer => "direct",
            SynthesisStrategy::SideBySide => "side-by-side",
            SynthesisStrategy::PrimaryMerge => "primary-merge",
            SynthesisStrategy::AttributedConcat => "attributed-concat",
        }
    }
}

/// Final answer plus full provenance.
///
/// The provenance list contains every dispatched agent with its terminal
/// state, failures included; a failed participant is never silently
/// dropped.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub answer: String,
    pub provenance: Vec<AgentOutcome>,
    pub strategy: SynthesisStrategy,
}

impl SynthesisResult {
    pub fn failed_agents(&self) -> Vec<&AgentOutcome> {
        self.provenance
            .iter()
            .filter(|outcome| !outcome.is_success())
            .collect()
    }
}

/// Direct/delegate mode: the single agent's success is the answer
/// verbatim; its terminal failure is the run's failure.
pub fn synthesize_direct(outcomes: BTreeMap<String, AgentOutcome>) -> Result<SynthesisResult> {
    let Some(outcome) = outcomes.into_values().next() else {
        bail!("no agent outcome recorded for direct run");
    };
    if !outcome.is_success() {
        bail!(
            "agent '{}' {}: {}",
            outcome.agent,
            outcome.status_label().to_ascii_lowercase(),
            outcome.result.failure_detail().unwrap_or_default()
        );
    }
    Ok(SynthesisResult {
        answer: outcome.output().to_string(),
        provenance: vec![outcome],
        strategy: SynthesisStrategy::DirectAnswer,
    })
}

/// Compare mode: synthesis is the identity function. Each outcome stands
/// on its own in the provenance; the answer field carries the attributed
/// rendering for convenience only.
pub fn synthesize_compare(outcomes: BTreeMap<String, AgentOutcome>) -> Result<SynthesisResult> {
    let provenance: Vec<AgentOutcome> = outcomes.into_values().collect();
    if !provenance.iter().any(|outcome| outcome.is_success()) {
        bail!("no usable result: all {} agents failed", provenance.len());
    }
    Ok(SynthesisResult {
        answer: concat_with_attribution(&provenance),
        provenance,
        strategy: SynthesisStrategy::SideBySide,
    })
}

/// Baseline merge: successful outputs concatenated under per-agent
/// attribution headers. Failed agents contribute nothing to the answer
/// but remain in the provenance.
pub fn concat_with_attribution(outcomes: &[AgentOutcome]) -> String {
    let mut sections = Vec::new();
    for outcome in outcomes {
        if outcome.is_success() {
            sections.push(format!(
                "--- {} [{}] ---\n{}",
                outcome.agent.to_ascii_uppercase(),
                outcome.status_label(),
                outcome.output()
            ));
        }
    }
    sections.join("\n\n")
}

/// Prompt asking the primary agent to merge all collected results,
/// failures included so the merge can acknowledge gaps.
pub fn build_merge_prompt(original_prompt: &str, outcomes: &[AgentOutcome]) -> String {
    let mut parts = vec![format!(
        "ORIGINAL TASK: {original_prompt}\n\nRESULTS FROM AGENTS:\n"
    )];
    for outcome in outcomes {
        let body = if outcome.is_success() {
            outcome.output().to_string()
        } else {
            outcome.result.failure_detail().unwrap_or_default()
        };
        parts.push(format!(
            "--- {} [{}] ---\n{}\n",
            outcome.agent.to_ascii_uppercase(),
            outcome.status_label(),
            body
        ));
    }
    parts.push(
        "\nSynthesize these results into a single, coherent response. \
         Merge complementary information, resolve conflicts, and present \
         the best unified answer."
            .to_string(),
    );
    parts.join("\n")
}
