use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::agents::{AgentKind, AgentTable};
use crate::config::OrchestratorConfig;
use crate::coordinator::{AgentOutcome, DispatchTask, dispatch_all};
use crate::events::{EventSink, ProgressEvent, now};
use crate::invoker::{InvocationResult, ProcessRunner};
use crate::retry::run_with_retry;
use crate::synthesis::{
    SynthesisResult, SynthesisStrategy, build_merge_prompt, concat_with_attribution,
    synthesize_compare, synthesize_direct,
};
use crate::telemetry::TelemetrySink;

/// Pipeline states. `Failed` is reachable from any state on
/// unrecoverable error; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Analyzing,
    Delegating,
    Collecting,
    Synthesizing,
    Done,
    Failed,
}

impl RunStage {
    pub fn label(self) -> &'static str {
        match self {
            RunStage::Analyzing => "analyzing",
            RunStage::Delegating => "delegating",
            RunStage::Collecting => "collecting",
            RunStage::Synthesizing => "synthesizing",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }
}

/// How a submitted prompt should be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Single-agent direct execution.
    Direct { agent: String },
    /// Parallel dispatch to the listed agents (all installed agents when
    /// empty), results surfaced side by side.
    Compare { agents: Vec<String> },
    /// analyze -> delegate -> collect -> synthesize, one consolidated
    /// answer.
    Pipeline,
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Direct { .. } => "direct",
            RunMode::Compare { .. } => "compare",
            RunMode::Pipeline => "pipeline",
        }
    }
}

/// One submission to the engine.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub mode: RunMode,
    pub global_timeout: Option<Duration>,
}

/// Pure selection function from (prompt, installed agents) to the
/// candidate set for pipeline mode.
pub type SelectionPolicy = fn(&str, &AgentTable) -> Vec<String>;

/// Default policy: every installed agent participates.
pub fn select_all_agents(_prompt: &str, table: &AgentTable) -> Vec<String> {
    table.names()
}

/// Delegation plan returned by the primary agent's analysis step.
/// Unknown fields are tolerated; model output is not a strict schema.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationPlan {
    pub delegate: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub subtasks: Vec<PlannedSubtask>,
    #[serde(default)]
    pub self_task: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedSubtask {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

/// The orchestration engine: owns the descriptor table, configuration,
/// the process boundary and the event sink for the process lifetime.
pub struct Engine {
    table: AgentTable,
    config: OrchestratorConfig,
    runner: Arc<dyn ProcessRunner>,
    events: EventSink,
    telemetry: TelemetrySink,
    selection: SelectionPolicy,
}

impl Engine {
    pub fn new(
        table: AgentTable,
        config: OrchestratorConfig,
        runner: Arc<dyn ProcessRunner>,
        events: EventSink,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            table,
            config,
            runner,
            events,
            telemetry,
            selection: select_all_agents,
        }
    }

    pub fn with_selection_policy(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn table(&self) -> &AgentTable {
        &self.table
    }

    /// Run one prompt to a final [`SynthesisResult`].
    ///
    /// Per-agent failures are handled inside the run and reported through
    /// the provenance list; only run-level failures (no agents, no usable
    /// result) surface as `Err`.
    pub async fn submit(&self, request: RunRequest) -> Result<SynthesisResult> {
        let global_timeout = request.global_timeout.unwrap_or(self.config.global_timeout);
        let deadline = Instant::now() + global_timeout;
        self.telemetry.emit(
            "run_submitted",
            json!({
                "mode": request.mode.label(),
                "timeout_secs": global_timeout.as_secs(),
                "prompt_chars": request.prompt.len(),
            }),
        );

        let result = self.execute(&request, deadline).await;
        match &result {
            Ok(synthesis) => {
                self.stage(RunStage::Done);
                self.events.emit(ProgressEvent::RunSynthesized {
                    result: synthesis.clone(),
                    at: now(),
                });
                self.telemetry.emit(
                    "run_done",
                    json!({
                        "strategy": synthesis.strategy.label(),
                        "agents": synthesis.provenance.len(),
                        "failed": synthesis.failed_agents().len(),
                    }),
                );
            }
            Err(err) => {
                self.stage(RunStage::Failed);
                self.telemetry
                    .emit("run_failed", json!({ "error": format!("{err:#}") }));
            }
        }
        result
    }

    async fn execute(&self, request: &RunRequest, deadline: Instant) -> Result<SynthesisResult> {
        self.stage(RunStage::Analyzing);
        if self.table.is_empty() {
            bail!(
                "no agents detected; install at least one of: claude (Claude Code), \
                 gemini (Gemini CLI), codex (Codex CLI)"
            );
        }

        match &request.mode {
            RunMode::Direct { agent } => {
                if !self.table.contains(agent) {
                    bail!(
                        "agent '{}' is not installed; available: {}",
                        agent,
                        self.table.names().join(", ")
                    );
                }
                let outcomes = self
                    .collect(
                        vec![DispatchTask {
                            agent: agent.clone(),
                            prompt: request.prompt.clone(),
                        }],
                        deadline,
                    )
                    .await;
                self.stage(RunStage::Synthesizing);
                synthesize_direct(outcomes)
            }
            RunMode::Compare { agents } => {
                let mut candidates: Vec<String> = if agents.is_empty() {
                    self.table.names()
                } else {
                    agents
                        .iter()
                        .filter(|name| self.table.contains(name))
                        .cloned()
                        .collect()
                };
                let mut seen = std::collections::BTreeSet::new();
                candidates.retain(|name| seen.insert(name.clone()));
                if candidates.is_empty() {
                    bail!(
                        "none of the requested agents are installed; available: {}",
                        self.table.names().join(", ")
                    );
                }
                let tasks = candidates
                    .into_iter()
                    .map(|agent| DispatchTask {
                        agent,
                        prompt: request.prompt.clone(),
                    })
                    .collect();
                let outcomes = self.collect(tasks, deadline).await;
                self.stage(RunStage::Synthesizing);
                synthesize_compare(outcomes)
            }
            RunMode::Pipeline => self.run_pipeline(&request.prompt, deadline).await,
        }
    }

    async fn run_pipeline(&self, prompt: &str, deadline: Instant) -> Result<SynthesisResult> {
        let candidates = (self.selection)(prompt, &self.table);
        let candidates: Vec<String> = candidates
            .into_iter()
            .filter(|name| self.table.contains(name))
            .collect();
        if candidates.is_empty() {
            bail!("selection policy produced no installed agents");
        }

        let primary = if self.table.contains(&self.config.primary) {
            self.config.primary.clone()
        } else {
            let fallback = candidates[0].clone();
            tracing::warn!(
                configured = %self.config.primary,
                fallback = %fallback,
                "primary agent not available, falling back"
            );
            fallback
        };
        // The coordinator-only policy is tied to the configured primary;
        // a fallback primary both plans and works.
        let coordinator_only = self.config.coordinator_only && primary == self.config.primary;

        let plan = match self.analyze(prompt, &candidates, &primary, deadline).await {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "analysis failed, falling back");
                return self
                    .pipeline_fallback(prompt, &candidates, &primary, coordinator_only, deadline)
                    .await;
            }
        };
        tracing::info!(
            delegate = plan.delegate,
            subtasks = plan.subtasks.len(),
            reasoning = %plan.reasoning,
            "delegation plan"
        );

        if !plan.delegate {
            return self
                .pipeline_fallback(prompt, &candidates, &primary, coordinator_only, deadline)
                .await;
        }

        let mut tasks = build_dispatch_tasks(&plan.subtasks, &self.table, &primary, coordinator_only);
        if let Some(self_task) = plan
            .self_task
            .as_ref()
            .filter(|task| !task.trim().is_empty())
        {
            if coordinator_only {
                tracing::info!(primary = %primary, "ignoring self_task for coordinator-only primary");
            } else {
                merge_task(&mut tasks, &primary, self_task);
            }
        }
        if tasks.is_empty() {
            tracing::warn!("plan produced no valid subtasks, falling back");
            return self
                .pipeline_fallback(prompt, &candidates, &primary, coordinator_only, deadline)
                .await;
        }

        let outcomes = self.collect(tasks, deadline).await;
        self.stage(RunStage::Synthesizing);
        self.merge(prompt, outcomes, &primary, deadline).await
    }

    /// Analysis failed or the plan chose not to delegate. A
    /// coordinator-only primary broadcasts to the workers; otherwise the
    /// primary answers the prompt directly.
    async fn pipeline_fallback(
        &self,
        prompt: &str,
        candidates: &[String],
        primary: &str,
        coordinator_only: bool,
        deadline: Instant,
    ) -> Result<SynthesisResult> {
        if coordinator_only {
            let tasks: Vec<DispatchTask> = candidates
                .iter()
                .filter(|agent| agent.as_str() != primary)
                .map(|agent| DispatchTask {
                    agent: agent.clone(),
                    prompt: prompt.to_string(),
                })
                .collect();
            if tasks.is_empty() {
                bail!("no worker agents available for coordinator-only primary '{primary}'");
            }
            let outcomes = self.collect(tasks, deadline).await;
            self.stage(RunStage::Synthesizing);
            return self.merge(prompt, outcomes, primary, deadline).await;
        }

        tracing::info!(primary = %primary, "no delegation, running on primary");
        let outcomes = self
            .collect(
                vec![DispatchTask {
                    agent: primary.to_string(),
                    prompt: prompt.to_string(),
                }],
                deadline,
            )
            .await;
        self.stage(RunStage::Synthesizing);
        synthesize_direct(outcomes)
    }

    async fn collect(
        &self,
        tasks: Vec<DispatchTask>,
        deadline: Instant,
    ) -> BTreeMap<String, AgentOutcome> {
        self.stage(RunStage::Delegating);
        tracing::info!(agents = tasks.len(), "dispatching agents");
        self.stage(RunStage::Collecting);
        dispatch_all(
            Arc::clone(&self.runner),
            &self.table,
            tasks,
            self.config.json_output,
            self.config.retry,
            deadline,
            &self.events,
        )
        .await
    }

    /// Ask the primary agent for a delegation plan.
    async fn analyze(
        &self,
        prompt: &str,
        candidates: &[String],
        primary: &str,
        deadline: Instant,
    ) -> Result<DelegationPlan> {
        let descriptor = self
            .table
            .get(primary)
            .with_context(|| format!("primary agent '{primary}' missing from table"))?;
        let coordinator_only = self.config.coordinator_only && primary == self.config.primary;
        let analysis = analysis_prompt(prompt, candidates, primary, coordinator_only);

        let result = run_with_retry(
            self.runner.as_ref(),
            descriptor,
            &analysis,
            true,
            &self.config.retry,
            deadline,
            &self.events,
        )
        .await;
        let InvocationResult::Success { output, .. } = result else {
            bail!(
                "primary agent '{}' failed during analysis: {}",
                primary,
                result.failure_detail().unwrap_or_default()
            );
        };
        parse_plan(&output)
    }

    /// Merge collected outcomes into one answer. The default strategy
    /// asks the primary agent to synthesize; if that invocation fails the
    /// answer degrades to attributed concatenation of the successful
    /// outputs. Every dispatched agent stays in the provenance either
    /// way.
    async fn merge(
        &self,
        prompt: &str,
        outcomes: BTreeMap<String, AgentOutcome>,
        primary: &str,
        deadline: Instant,
    ) -> Result<SynthesisResult> {
        let provenance: Vec<AgentOutcome> = outcomes.into_values().collect();
        if !provenance.iter().any(|outcome| outcome.is_success()) {
            let states: Vec<String> = provenance
                .iter()
                .map(|outcome| format!("{}: {}", outcome.agent, outcome.status_label()))
                .collect();
            bail!(
                "no usable result: all {} agents failed ({})",
                provenance.len(),
                states.join(", ")
            );
        }

        let Some(descriptor) = self.table.get(primary) else {
            return Ok(SynthesisResult {
                answer: concat_with_attribution(&provenance),
                provenance,
                strategy: SynthesisStrategy::AttributedConcat,
            });
        };

        tracing::info!(results = provenance.len(), primary = %primary, "synthesizing results");
        let merge_prompt = build_merge_prompt(prompt, &provenance);
        let merged = run_with_retry(
            self.runner.as_ref(),
            descriptor,
            &merge_prompt,
            false,
            &self.config.retry,
            deadline,
            &self.events,
        )
        .await;
        match merged {
            InvocationResult::Success { output, .. } => Ok(SynthesisResult {
                answer: output,
                provenance,
                strategy: SynthesisStrategy::PrimaryMerge,
            }),
            other => {
                tracing::warn!(
                    primary = %primary,
                    detail = other.failure_detail().unwrap_or_default(),
                    "primary merge failed, concatenating successful outputs"
                );
                Ok(SynthesisResult {
                    answer: concat_with_attribution(&provenance),
                    provenance,
                    strategy: SynthesisStrategy::AttributedConcat,
                })
            }
        }
    }

    fn stage(&self, stage: RunStage) {
        self.events.emit(ProgressEvent::StageChanged { stage, at: now() });
        self.telemetry
            .emit("stage", json!({ "stage": stage.label() }));
    }
}

/// Convert plan subtasks into dispatch tasks, dropping entries with an
/// empty prompt, an unknown agent, or the coordinator-only primary.
/// Multiple subtasks for the same agent are folded into one prompt so
/// each agent keeps exactly one outcome slot.
pub fn build_dispatch_tasks(
    subtasks: &[PlannedSubtask],
    table: &AgentTable,
    primary: &str,
    coordinator_only: bool,
) -> Vec<DispatchTask> {
    let mut tasks: Vec<DispatchTask> = Vec::new();
    for subtask in subtasks {
        let Some(prompt) = subtask.prompt.as_ref().filter(|p| !p.trim().is_empty()) else {
            tracing::warn!(agent = %subtask.agent, "skipping subtask with empty prompt");
            continue;
        };
        if !table.contains(&subtask.agent) {
            tracing::warn!(agent = %subtask.agent, "skipping subtask for unavailable agent");
            continue;
        }
        if coordinator_only && subtask.agent == primary {
            tracing::warn!(
                agent = %subtask.agent,
                "skipping subtask for coordinator-only primary"
            );
            continue;
        }
        merge_task(&mut tasks, &subtask.agent, prompt);
    }
    tasks
}

fn merge_task(tasks: &mut Vec<DispatchTask>, agent: &str, prompt: &str) {
    if let Some(existing) = tasks.iter_mut().find(|task| task.agent == agent) {
        existing.prompt.push_str("\n\n");
        existing.prompt.push_str(prompt);
    } else {
        tasks.push(DispatchTask {
            agent: agent.to_string(),
            prompt: prompt.to_string(),
        });
    }
}

/// Build the analysis request sent to the primary agent.
pub fn analysis_prompt(
    prompt: &str,
    candidates: &[String],
    primary: &str,
    coordinator_only: bool,
) -> String {
    let mut roster = String::new();
    for name in candidates {
        if let Some(kind) = AgentKind::from_name(name) {
            roster.push_str(&format!("- {}: Best for {}\n", name, kind.strengths()));
        } else {
            roster.push_str(&format!("- {name}\n"));
        }
    }

    let mut out = format!(
        "You are Cortex, an AI orchestrator coordinating AI development agents.\n\n\
         AVAILABLE AGENTS:\n{roster}\n\
         TASK: Analyze the user's request and create a delegation plan.\n\n\
         RULES:\n\
         1. If the task is simple enough for one agent, set \"delegate\": false and handle it yourself.\n\
         2. If the task benefits from multiple agents, create subtasks with specific prompts.\n\
         3. Each subtask prompt must be self-contained (the receiving agent has no prior context).\n\
         4. You can assign tasks to yourself too.\n\n\
         Respond with ONLY this JSON (no markdown, no explanation):\n\
         {{\n\
           \"delegate\": true/false,\n\
           \"reasoning\": \"Brief explanation of your delegation decision\",\n\
           \"subtasks\": [\n\
             {{\n\
               \"agent\": \"agent name\",\n\
               \"prompt\": \"Specific, self-contained prompt for this agent\",\n\
               \"priority\": \"high|medium|low\"\n\
             }}\n\
           ],\n\
           \"self_task\": \"What you will handle directly (null if delegating everything)\"\n\
         }}"
    );

    if coordinator_only {
        out.push_str(&format!(
            "\n\nPRIMARY POLICY:\n\
             - The primary agent ({primary}) is coordinator-only.\n\
             - Always set \"delegate\": true.\n\
             - Do not assign any subtask to \"{primary}\".\n\
             - Always set \"self_task\": null."
        ));
    }

    out.push_str(&format!(
        "\n\nAVAILABLE (installed) AGENTS: {}\n\nUSER REQUEST:\n{}",
        candidates.join(", "),
        prompt
    ));
    out
}

/// Parse a delegation plan out of model output that may wrap the JSON in
/// markdown fences or surrounding prose.
pub fn parse_plan(output: &str) -> Result<DelegationPlan> {
    let block = extract_json_block(output)
        .with_context(|| "no JSON object found in delegation output")?;
    let plan: DelegationPlan = serde_json::from_str(&block)
        .with_context(|| "invalid delegation plan JSON")?;
    Ok(plan)
}

/// Extract the outermost `{...}` block, stripping a markdown code fence
/// first if present.
pub fn extract_json_block(text: &str) -> Option<String> {
    let mut text = text.trim();
    if let Some(fence_start) = text.find("```") {
        let after = &text[fence_start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(fence_end) = after.find("```") {
            text = after[..fence_end].trim();
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}
