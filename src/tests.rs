use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;
use tokio::time::Instant;

use crate::agents::detect::extract_semver;
use crate::agents::*;
use crate::config::*;
use crate::coordinator::*;
use crate::error::*;
use crate::events::*;
use crate::invoker::*;
use crate::pipeline::*;
use crate::retry::*;
use crate::synthesis::*;
use crate::telemetry::TelemetrySink;

// ---------------------------------------------------------------------------
// Scripted process boundary
// ---------------------------------------------------------------------------

enum Script {
    Respond {
        delay: Duration,
        output: ProcessOutput,
    },
    /// Never resolves within any realistic test deadline.
    Hang,
}

#[derive(Default)]
struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self::default()
    }

    fn script(&self, binary: &str, output: ProcessOutput) {
        self.script_after(binary, Duration::ZERO, output);
    }

    fn script_after(&self, binary: &str, delay: Duration, output: ProcessOutput) {
        self.scripts
            .lock()
            .unwrap()
            .entry(binary.to_string())
            .or_default()
            .push_back(Script::Respond { delay, output });
    }

    fn script_hang(&self, binary: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(binary.to_string())
            .or_default()
            .push_back(Script::Hang);
    }

    fn call_count(&self, binary: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == binary)
            .count()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, binary: &str, _args: &[String], timeout: Duration) -> ProcessOutput {
        self.calls.lock().unwrap().push(binary.to_string());
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(binary)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Script::Respond { delay, output }) => {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return ProcessOutput::TimedOut;
                }
                tokio::time::sleep(delay).await;
                output
            }
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                ProcessOutput::TimedOut
            }
            None => ProcessOutput::SpawnFailed {
                not_found: true,
                detail: format!("{binary}: unscripted call"),
            },
        }
    }
}

fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput::Exited {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn rate_limited() -> ProcessOutput {
    ProcessOutput::Exited {
        code: 1,
        stdout: String::new(),
        stderr: "Error: 429 Too Many Requests. Retry after: 7".to_string(),
    }
}

fn nonzero(code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput::Exited {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_descriptor(kind: AgentKind) -> AgentDescriptor {
    let mut descriptor = AgentDescriptor::new(kind, format!("{}-bin", kind.name()));
    descriptor.timeout = Duration::from_secs(5);
    descriptor
}

fn test_table() -> AgentTable {
    let mut table = AgentTable::new();
    table.insert(test_descriptor(AgentKind::Claude));
    table.insert(test_descriptor(AgentKind::Gemini));
    table.insert(test_descriptor(AgentKind::Codex));
    table
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(60),
        jitter: false,
    }
}

fn test_config() -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::default();
    cfg.global_timeout = Duration::from_secs(120);
    cfg.retry = quick_retry();
    cfg
}

fn test_engine(table: AgentTable, runner: Arc<ScriptedRunner>) -> Engine {
    Engine::new(
        table,
        test_config(),
        runner,
        EventSink::disabled(),
        TelemetrySink::disabled(),
    )
}

fn success_outcome(agent: &str, output: &str) -> AgentOutcome {
    AgentOutcome {
        agent: agent.to_string(),
        result: InvocationResult::Success {
            output: output.to_string(),
            stderr: String::new(),
            duration: Duration::from_secs(1),
            attempts: 1,
        },
        wall_time: Duration::from_secs(1),
        attempts: 1,
    }
}

fn failed_outcome(agent: &str) -> AgentOutcome {
    AgentOutcome {
        agent: agent.to_string(),
        result: InvocationResult::Failed {
            reason: FailureReason::NonZeroExit {
                code: 2,
                stderr: "boom".to_string(),
            },
        },
        wall_time: Duration::from_secs(1),
        attempts: 1,
    }
}

fn plan_json(subtasks: &[(&str, &str)]) -> String {
    json!({
        "delegate": true,
        "reasoning": "split work",
        "subtasks": subtasks
            .iter()
            .map(|(agent, prompt)| json!({ "agent": agent, "prompt": prompt, "priority": "high" }))
            .collect::<Vec<_>>(),
        "self_task": null,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Classification and parsing
// ---------------------------------------------------------------------------

#[test]
fn rate_limit_markers_match_common_messages() {
    assert!(looks_rate_limited("Error: 429 Too Many Requests"));
    assert!(looks_rate_limited("RESOURCE_EXHAUSTED: quota exceeded"));
    assert!(looks_rate_limited("the model is currently Overloaded"));
    assert!(looks_rate_limited("You have hit your tokens per min cap"));
    assert!(!looks_rate_limited("task completed successfully"));
}

#[test]
fn retry_after_hint_parsed_from_output() {
    assert_eq!(
        extract_retry_after("please Retry After: 12 seconds"),
        Some(Duration::from_secs(12))
    );
    assert_eq!(
        extract_retry_after("retry-after 2.5"),
        Some(Duration::from_secs_f64(2.5))
    );
    assert_eq!(extract_retry_after("retry later"), None);
}

#[test]
fn strip_ansi_removes_csi_and_osc() {
    assert_eq!(strip_ansi("\u{1b}[1;32mbold green\u{1b}[0m"), "bold green");
    assert_eq!(strip_ansi("\u{1b}]0;title\u{7}body"), "body");
    assert_eq!(strip_ansi("plain text"), "plain text");
}

#[test]
fn extract_semver_finds_version() {
    assert_eq!(
        extract_semver("claude 1.2.34 (build 7)").as_deref(),
        Some("1.2.34")
    );
    assert_eq!(extract_semver("v0.9.1-beta").as_deref(), Some("0.9.1"));
    assert_eq!(extract_semver("no version here 42"), None);
}

#[test]
fn claude_args_include_prompt_and_flags() {
    let mut descriptor = test_descriptor(AgentKind::Claude);
    descriptor.default_model = Some("opus".to_string());
    descriptor.max_turns = Some(15);
    let args = descriptor.build_args("explain this", true);
    assert_eq!(args[0], "-p");
    assert_eq!(args[1], "explain this");
    assert!(args.windows(2).any(|w| w == ["--output-format", "json"]));
    assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
    assert!(args.windows(2).any(|w| w == ["--permission-mode", "dontAsk"]));
    assert!(args.windows(2).any(|w| w == ["--max-turns", "15"]));
}

#[test]
fn codex_args_put_prompt_last() {
    let mut descriptor = test_descriptor(AgentKind::Codex);
    descriptor.extra_args = vec!["--skip-git-repo-check".to_string()];
    let args = descriptor.build_args("write a test", true);
    assert_eq!(args[0], "exec");
    assert!(args.contains(&"--full-auto".to_string()));
    assert!(args.contains(&"--json".to_string()));
    assert!(args.contains(&"--skip-git-repo-check".to_string()));
    assert_eq!(args.last().map(String::as_str), Some("write a test"));
}

#[test]
fn gemini_args_put_prompt_last() {
    let descriptor = test_descriptor(AgentKind::Gemini);
    let args = descriptor.build_args("search the docs", false);
    assert!(args.contains(&"-y".to_string()));
    assert!(!args.contains(&"--output-format".to_string()));
    assert_eq!(args.last().map(String::as_str), Some("search the docs"));
}

#[test]
fn gemini_stderr_filter_drops_punycode_noise() {
    let descriptor = test_descriptor(AgentKind::Gemini);
    let filtered = descriptor.filter_stderr(
        "(node:1) [DEP0040] DeprecationWarning: The `punycode` module is deprecated\nreal error",
    );
    assert_eq!(filtered, "real error");

    let claude = test_descriptor(AgentKind::Claude);
    assert_eq!(claude.filter_stderr(" kept as-is \n"), "kept as-is");
}

#[test]
fn extract_json_block_handles_fences_and_prose() {
    let fenced = "Here is the plan:\n```json\n{\"delegate\": false}\n```\nthanks";
    assert_eq!(
        extract_json_block(fenced).as_deref(),
        Some("{\"delegate\": false}")
    );
    let prose = "Sure! {\"delegate\": true, \"subtasks\": []} hope that helps";
    assert_eq!(
        extract_json_block(prose).as_deref(),
        Some("{\"delegate\": true, \"subtasks\": []}")
    );
    assert_eq!(extract_json_block("no json at all"), None);
}

#[test]
fn parse_plan_rejects_missing_delegate() {
    assert!(parse_plan("{\"reasoning\": \"hm\"}").is_err());
    let plan = parse_plan("{\"delegate\": true, \"subtasks\": [{\"agent\": \"codex\", \"prompt\": \"do it\"}]}")
        .unwrap();
    assert!(plan.delegate);
    assert_eq!(plan.subtasks.len(), 1);
}

#[test]
fn build_dispatch_tasks_filters_and_merges() {
    let table = test_table();
    let subtasks = vec![
        PlannedSubtask {
            agent: "codex".to_string(),
            prompt: Some("part one".to_string()),
            priority: Some("high".to_string()),
        },
        PlannedSubtask {
            agent: "codex".to_string(),
            prompt: Some("part two".to_string()),
            priority: None,
        },
        PlannedSubtask {
            agent: "gemini".to_string(),
            prompt: Some("   ".to_string()),
            priority: None,
        },
        PlannedSubtask {
            agent: "mystery".to_string(),
            prompt: Some("who are you".to_string()),
            priority: None,
        },
        PlannedSubtask {
            agent: "claude".to_string(),
            prompt: Some("skipped for coordinator-only".to_string()),
            priority: None,
        },
    ];
    let tasks = build_dispatch_tasks(&subtasks, &table, "claude", true);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].agent, "codex");
    assert_eq!(tasks[0].prompt, "part one\n\npart two");
}

#[test]
fn analysis_prompt_lists_installed_agents_and_policy() {
    let prompt = analysis_prompt(
        "refactor the parser",
        &["claude".to_string(), "codex".to_string()],
        "claude",
        true,
    );
    assert!(prompt.contains("claude: Best for reasoning"));
    assert!(prompt.contains("coordinator-only"));
    assert!(prompt.contains("USER REQUEST:\nrefactor the parser"));
}

// ---------------------------------------------------------------------------
// Backoff policy
// ---------------------------------------------------------------------------

#[test]
fn backoff_delay_grows_and_caps() {
    let policy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
        jitter: false,
    };
    assert_eq!(policy.backoff_delay(1, None), Duration::from_secs(5));
    assert_eq!(policy.backoff_delay(2, None), Duration::from_secs(10));
    assert_eq!(policy.backoff_delay(3, None), Duration::from_secs(20));
    assert_eq!(policy.backoff_delay(5, None), Duration::from_secs(60));
}

#[test]
fn backoff_uses_server_hint_capped() {
    let policy = quick_retry();
    assert_eq!(
        policy.backoff_delay(1, Some(Duration::from_secs(7))),
        Duration::from_secs(7)
    );
    assert_eq!(
        policy.backoff_delay(1, Some(Duration::from_secs(600))),
        Duration::from_secs(60)
    );
}

#[test]
fn jitter_stays_within_bounds() {
    let policy = RetryPolicy {
        jitter: true,
        ..quick_retry()
    };
    for _ in 0..100 {
        let delay = policy.with_jitter(Duration::from_secs(10));
        assert!(delay >= Duration::from_secs(8));
        assert!(delay <= Duration::from_secs(12));
    }
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invoke_once_classifies_rate_limit_over_exit_code() {
    let runner = ScriptedRunner::new();
    runner.script(
        "claude-bin",
        ProcessOutput::Exited {
            code: 0,
            stdout: "quota exceeded, slow down".to_string(),
            stderr: String::new(),
        },
    );
    let descriptor = test_descriptor(AgentKind::Claude);
    let request = InvocationRequest {
        agent: "claude".to_string(),
        prompt: "hi".to_string(),
        timeout: Duration::from_secs(5),
        attempt: 1,
        json_output: false,
    };
    let result = invoke_once(&runner, &descriptor, &request, &EventSink::disabled()).await;
    assert!(matches!(result, InvocationResult::RateLimited { .. }));
}

#[tokio::test]
async fn invoke_once_reports_missing_binary() {
    let runner = ScriptedRunner::new();
    let descriptor = test_descriptor(AgentKind::Claude);
    let request = InvocationRequest {
        agent: "claude".to_string(),
        prompt: "hi".to_string(),
        timeout: Duration::from_secs(5),
        attempt: 1,
        json_output: false,
    };
    let result = invoke_once(&runner, &descriptor, &request, &EventSink::disabled()).await;
    assert!(matches!(
        result,
        InvocationResult::Failed {
            reason: FailureReason::NotInstalled { .. }
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn invoke_once_times_out_on_silent_process() {
    let runner = ScriptedRunner::new();
    runner.script_after("claude-bin", Duration::from_secs(60), ok("late"));
    let descriptor = test_descriptor(AgentKind::Claude);
    let request = InvocationRequest {
        agent: "claude".to_string(),
        prompt: "hi".to_string(),
        timeout: Duration::from_secs(2),
        attempt: 1,
        json_output: false,
    };
    let result = invoke_once(&runner, &descriptor, &request, &EventSink::disabled()).await;
    assert!(matches!(result, InvocationResult::TimedOut { .. }));
}

// ---------------------------------------------------------------------------
// Retry controller
// ---------------------------------------------------------------------------

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_after_rate_limits() {
    let runner = ScriptedRunner::new();
    runner.script("claude-bin", rate_limited());
    runner.script("claude-bin", rate_limited());
    runner.script("claude-bin", ok("finally"));
    let descriptor = test_descriptor(AgentKind::Claude);

    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &quick_retry(),
        far_deadline(),
        &EventSink::disabled(),
    )
    .await;

    match result {
        InvocationResult::Success {
            output, attempts, ..
        } => {
            assert_eq!(output, "finally");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(runner.call_count("claude-bin"), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_exhausts_attempt_budget() {
    let runner = ScriptedRunner::new();
    for _ in 0..4 {
        runner.script("claude-bin", rate_limited());
    }
    let descriptor = test_descriptor(AgentKind::Claude);

    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &quick_retry(),
        far_deadline(),
        &EventSink::disabled(),
    )
    .await;

    assert!(matches!(
        result,
        InvocationResult::Failed {
            reason: FailureReason::RetriesExhausted { attempts: 4 }
        }
    ));
    assert_eq!(runner.call_count("claude-bin"), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_never_retries_nonzero_exit() {
    let runner = ScriptedRunner::new();
    runner.script("claude-bin", nonzero(2, "syntax error"));
    let descriptor = test_descriptor(AgentKind::Claude);

    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &quick_retry(),
        far_deadline(),
        &EventSink::disabled(),
    )
    .await;

    assert!(matches!(
        result,
        InvocationResult::Failed {
            reason: FailureReason::NonZeroExit { code: 2, .. }
        }
    ));
    assert_eq!(runner.call_count("claude-bin"), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_never_retries_timeout() {
    let runner = ScriptedRunner::new();
    runner.script_after("claude-bin", Duration::from_secs(60), ok("late"));
    let mut descriptor = test_descriptor(AgentKind::Claude);
    descriptor.timeout = Duration::from_secs(1);

    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &quick_retry(),
        far_deadline(),
        &EventSink::disabled(),
    )
    .await;

    assert!(matches!(result, InvocationResult::TimedOut { .. }));
    assert_eq!(runner.call_count("claude-bin"), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_when_budget_cannot_fit_another_attempt() {
    let runner = ScriptedRunner::new();
    runner.script("claude-bin", rate_limited());
    let descriptor = test_descriptor(AgentKind::Claude);
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(60),
        jitter: false,
    };

    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &policy,
        Instant::now() + Duration::from_secs(3),
        &EventSink::disabled(),
    )
    .await;

    assert!(matches!(
        result,
        InvocationResult::Failed {
            reason: FailureReason::RetriesExhausted { attempts: 1 }
        }
    ));
    assert_eq!(runner.call_count("claude-bin"), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_honors_server_retry_after_hint() {
    let runner = ScriptedRunner::new();
    runner.script("claude-bin", rate_limited()); // carries "Retry after: 7"
    runner.script("claude-bin", ok("done"));
    let descriptor = test_descriptor(AgentKind::Claude);
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        jitter: false,
    };

    let start = Instant::now();
    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &policy,
        far_deadline(),
        &EventSink::disabled(),
    )
    .await;

    assert!(result.is_success());
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(7), "waited {waited:?}");
    assert!(waited < Duration::from_secs(8), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn retry_emits_retrying_events() {
    let runner = ScriptedRunner::new();
    runner.script("claude-bin", rate_limited());
    runner.script("claude-bin", ok("done"));
    let descriptor = test_descriptor(AgentKind::Claude);
    let (sink, mut rx) = EventSink::channel(32);

    let result = run_with_retry(
        &runner,
        &descriptor,
        "hi",
        false,
        &quick_retry(),
        far_deadline(),
        &sink,
    )
    .await;
    assert!(result.is_success());
    drop(sink);

    let mut saw_retrying = false;
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::AgentRetrying { agent, attempt, .. } = event {
            assert_eq!(agent, "claude");
            assert_eq!(attempt, 2);
            saw_retrying = true;
        }
    }
    assert!(saw_retrying);
}

// ---------------------------------------------------------------------------
// Parallel coordinator
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn coordinator_marks_hung_agent_timed_out_at_global_deadline() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script_after("claude-bin", Duration::from_secs(1), ok("fast answer"));
    runner.script_hang("gemini-bin");
    let table = test_table();
    let tasks = vec![
        DispatchTask {
            agent: "claude".to_string(),
            prompt: "hi".to_string(),
        },
        DispatchTask {
            agent: "gemini".to_string(),
            prompt: "hi".to_string(),
        },
    ];

    let outcomes = dispatch_all(
        runner.clone(),
        &table,
        tasks,
        false,
        quick_retry(),
        Instant::now() + Duration::from_secs(3),
        &EventSink::disabled(),
    )
    .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes["claude"].is_success());
    assert_eq!(outcomes["claude"].output(), "fast answer");
    assert!(matches!(
        outcomes["gemini"].result,
        InvocationResult::TimedOut { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn coordinator_emits_completions_in_arrival_order() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script_after("claude-bin", Duration::from_secs(2), ok("slow"));
    runner.script_after("gemini-bin", Duration::from_millis(100), ok("quick"));
    let table = test_table();
    let (sink, mut rx) = EventSink::channel(64);

    let outcomes = dispatch_all(
        runner.clone(),
        &table,
        vec![
            DispatchTask {
                agent: "claude".to_string(),
                prompt: "hi".to_string(),
            },
            DispatchTask {
                agent: "gemini".to_string(),
                prompt: "hi".to_string(),
            },
        ],
        false,
        quick_retry(),
        Instant::now() + Duration::from_secs(30),
        &sink,
    )
    .await;
    drop(sink);

    assert_eq!(outcomes.len(), 2);
    let mut completed = Vec::new();
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::AgentCompleted { outcome, .. } = event {
            completed.push(outcome.agent);
        }
    }
    assert_eq!(completed, vec!["gemini".to_string(), "claude".to_string()]);
}

#[tokio::test]
async fn coordinator_records_unknown_agent_as_not_installed() {
    let runner = Arc::new(ScriptedRunner::new());
    let table = test_table();

    let outcomes = dispatch_all(
        runner,
        &table,
        vec![DispatchTask {
            agent: "mystery".to_string(),
            prompt: "hi".to_string(),
        }],
        false,
        quick_retry(),
        Instant::now() + Duration::from_secs(5),
        &EventSink::disabled(),
    )
    .await;

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes["mystery"].result,
        InvocationResult::Failed {
            reason: FailureReason::NotInstalled { .. }
        }
    ));
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

#[test]
fn synthesize_direct_passes_output_through() {
    let mut outcomes = BTreeMap::new();
    outcomes.insert("codex".to_string(), success_outcome("codex", "the answer"));
    let result = synthesize_direct(outcomes).unwrap();
    assert_eq!(result.answer, "the answer");
    assert_eq!(result.strategy, SynthesisStrategy::DirectAnswer);
    assert_eq!(result.provenance.len(), 1);
}

#[test]
fn synthesize_direct_failure_is_run_error() {
    let mut outcomes = BTreeMap::new();
    outcomes.insert(
        "claude".to_string(),
        AgentOutcome {
            agent: "claude".to_string(),
            result: InvocationResult::Failed {
                reason: FailureReason::NotInstalled {
                    binary: "claude".to_string(),
                },
            },
            wall_time: Duration::ZERO,
            attempts: 1,
        },
    );
    let err = synthesize_direct(outcomes).unwrap_err();
    assert_eq!(categorize_error(&err), ErrorCategory::Agents);
}

#[test]
fn synthesize_compare_keeps_every_outcome() {
    let mut outcomes = BTreeMap::new();
    outcomes.insert("claude".to_string(), success_outcome("claude", "a"));
    outcomes.insert("gemini".to_string(), failed_outcome("gemini"));
    let result = synthesize_compare(outcomes).unwrap();
    assert_eq!(result.strategy, SynthesisStrategy::SideBySide);
    assert_eq!(result.provenance.len(), 2);
    assert_eq!(result.failed_agents().len(), 1);
}

#[test]
fn synthesize_compare_all_failed_is_run_error() {
    let mut outcomes = BTreeMap::new();
    outcomes.insert("claude".to_string(), failed_outcome("claude"));
    outcomes.insert("gemini".to_string(), failed_outcome("gemini"));
    assert!(synthesize_compare(outcomes).is_err());
}

#[test]
fn concat_with_attribution_uses_only_successes() {
    let outcomes = vec![
        success_outcome("claude", "x"),
        failed_outcome("gemini"),
    ];
    let merged = concat_with_attribution(&outcomes);
    assert!(merged.contains("--- CLAUDE [SUCCESS] ---"));
    assert!(merged.contains('x'));
    assert!(!merged.contains("GEMINI"));
}

#[test]
fn merge_prompt_includes_failed_participants() {
    let outcomes = vec![
        success_outcome("claude", "x"),
        failed_outcome("gemini"),
    ];
    let prompt = build_merge_prompt("original task", &outcomes);
    assert!(prompt.contains("ORIGINAL TASK: original task"));
    assert!(prompt.contains("--- CLAUDE [SUCCESS] ---"));
    assert!(prompt.contains("--- GEMINI [FAILED] ---"));
}

#[test]
fn status_label_reports_retries() {
    let result = InvocationResult::Success {
        output: String::new(),
        stderr: String::new(),
        duration: Duration::ZERO,
        attempts: 3,
    };
    assert_eq!(result.status_label(), "SUCCESS (retried 2x)");
}

// ---------------------------------------------------------------------------
// Engine end-to-end (scripted)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pipeline_delegates_and_merges_with_primary() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script(
        "claude-bin",
        ok(&plan_json(&[
            ("gemini", "research the topic"),
            ("codex", "write the code"),
        ])),
    );
    runner.script("gemini-bin", ok("research notes"));
    runner.script("codex-bin", ok("fn main() {}"));
    runner.script("claude-bin", ok("merged answer"));
    let engine = test_engine(test_table(), runner.clone());

    let result = engine
        .submit(RunRequest {
            prompt: "build the feature".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap();

    assert_eq!(result.answer, "merged answer");
    assert_eq!(result.strategy, SynthesisStrategy::PrimaryMerge);
    let agents: Vec<&str> = result
        .provenance
        .iter()
        .map(|outcome| outcome.agent.as_str())
        .collect();
    assert_eq!(agents, vec!["codex", "gemini"]);
    assert_eq!(runner.call_count("claude-bin"), 2);
}

#[tokio::test(start_paused = true)]
async fn pipeline_broadcasts_to_workers_when_analysis_is_unparseable() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script("claude-bin", ok("I cannot produce JSON, sorry"));
    runner.script("gemini-bin", ok("gemini says"));
    runner.script("codex-bin", ok("codex says"));
    runner.script("claude-bin", ok("merged from broadcast"));
    let engine = test_engine(test_table(), runner.clone());

    let result = engine
        .submit(RunRequest {
            prompt: "tricky request".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap();

    assert_eq!(result.answer, "merged from broadcast");
    assert_eq!(result.provenance.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn pipeline_partial_failure_still_synthesizes() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script(
        "claude-bin",
        ok(&plan_json(&[("gemini", "part a"), ("codex", "part b")])),
    );
    runner.script("gemini-bin", ok("useful output"));
    runner.script("codex-bin", nonzero(1, "crashed"));
    runner.script("claude-bin", ok("merged around the failure"));
    let engine = test_engine(test_table(), runner.clone());

    let result = engine
        .submit(RunRequest {
            prompt: "prompt".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap();

    assert_eq!(result.provenance.len(), 2);
    assert_eq!(result.failed_agents().len(), 1);
    assert_eq!(result.failed_agents()[0].agent, "codex");
}

#[tokio::test(start_paused = true)]
async fn pipeline_all_workers_failed_is_run_error() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script("claude-bin", ok(&plan_json(&[("gemini", "only task")])));
    runner.script("gemini-bin", nonzero(1, "broken"));
    let engine = test_engine(test_table(), runner.clone());

    let err = engine
        .submit(RunRequest {
            prompt: "prompt".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("no usable result"));
    assert_eq!(categorize_error(&err), ErrorCategory::Agents);
}

#[tokio::test(start_paused = true)]
async fn pipeline_merge_failure_falls_back_to_concatenation() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script("claude-bin", ok(&plan_json(&[("gemini", "task")])));
    runner.script("gemini-bin", ok("gemini output"));
    runner.script("claude-bin", nonzero(1, "merge crashed"));
    let engine = test_engine(test_table(), runner.clone());

    let result = engine
        .submit(RunRequest {
            prompt: "prompt".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap();

    assert_eq!(result.strategy, SynthesisStrategy::AttributedConcat);
    assert!(result.answer.contains("--- GEMINI [SUCCESS] ---"));
    assert!(result.answer.contains("gemini output"));
}

#[tokio::test]
async fn direct_mode_missing_agent_is_input_error() {
    let runner = Arc::new(ScriptedRunner::new());
    let engine = test_engine(test_table(), runner);

    let err = engine
        .submit(RunRequest {
            prompt: "hi".to_string(),
            mode: RunMode::Direct {
                agent: "mystery".to_string(),
            },
            global_timeout: None,
        })
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("not installed"));
}

#[tokio::test]
async fn compare_mode_surfaces_outcomes_independently() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script("claude-bin", ok("claude view"));
    runner.script("gemini-bin", nonzero(1, "gemini broke"));
    runner.script("codex-bin", ok("codex view"));
    let engine = test_engine(test_table(), runner);

    let result = engine
        .submit(RunRequest {
            prompt: "compare this".to_string(),
            mode: RunMode::Compare { agents: Vec::new() },
            global_timeout: None,
        })
        .await
        .unwrap();

    assert_eq!(result.strategy, SynthesisStrategy::SideBySide);
    assert_eq!(result.provenance.len(), 3);
    assert_eq!(result.failed_agents().len(), 1);
}

#[tokio::test]
async fn empty_table_fails_before_dispatch() {
    let runner = Arc::new(ScriptedRunner::new());
    let engine = test_engine(AgentTable::new(), runner);

    let err = engine
        .submit(RunRequest {
            prompt: "hi".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap_err();
    assert_eq!(categorize_error(&err), ErrorCategory::Agents);
}

#[tokio::test(start_paused = true)]
async fn stage_events_walk_the_pipeline() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.script("claude-bin", ok(&plan_json(&[("gemini", "task")])));
    runner.script("gemini-bin", ok("out"));
    runner.script("claude-bin", ok("merged"));
    let (sink, mut rx) = EventSink::channel(128);
    let engine = Engine::new(
        test_table(),
        test_config(),
        runner,
        sink,
        TelemetrySink::disabled(),
    );

    engine
        .submit(RunRequest {
            prompt: "prompt".to_string(),
            mode: RunMode::Pipeline,
            global_timeout: None,
        })
        .await
        .unwrap();
    drop(engine);

    let mut stages = Vec::new();
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::StageChanged { stage, .. } = event {
            stages.push(stage);
        }
    }
    assert_eq!(stages.first(), Some(&RunStage::Analyzing));
    assert_eq!(stages.last(), Some(&RunStage::Done));
    assert!(stages.contains(&RunStage::Collecting));
    assert!(stages.contains(&RunStage::Synthesizing));
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_sink_drops_instead_of_blocking_when_full() {
    let (sink, mut rx) = EventSink::channel(1);
    for _ in 0..5 {
        sink.emit(ProgressEvent::StageChanged {
            stage: RunStage::Analyzing,
            at: now(),
        });
    }
    drop(sink);

    let mut received = 0;
    while rx.recv().await.is_some() {
        received += 1;
    }
    assert_eq!(received, 1);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn default_config_written_on_first_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let file = load_config(Some(path.as_path())).unwrap();
    assert!(path.exists());
    assert_eq!(file.primary, "claude");
    assert_eq!(file.parallel_timeout, 600);
    assert_eq!(file.agents["codex"].extra_args, vec!["--skip-git-repo-check"]);
}

#[test]
fn malformed_config_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "primary = [not valid").unwrap();
    let file = load_config(Some(path.as_path())).unwrap();
    assert_eq!(file.primary, "claude");
}

#[test]
fn config_file_resolves_to_engine_settings() {
    let raw = "\
primary = \"codex\"
parallel_timeout = 120
max_retries = 5
retry_base_delay = 2.0
retry_max_delay = 30.0

[agents.codex]
timeout = 90
default_model = \"o4\"
";
    let file: ConfigFile = toml::from_str(raw).unwrap();
    let cfg = OrchestratorConfig::from_file(&file);
    assert_eq!(cfg.primary, "codex");
    assert!(!cfg.coordinator_only);
    assert_eq!(cfg.global_timeout, Duration::from_secs(120));
    assert_eq!(cfg.retry.max_retries, 5);
    assert_eq!(cfg.retry.base_delay, Duration::from_secs(2));
    assert_eq!(cfg.retry.max_delay, Duration::from_secs(30));
}

#[test]
fn claude_primary_defaults_to_coordinator_only() {
    let cfg = OrchestratorConfig::default();
    assert_eq!(cfg.primary, "claude");
    assert!(cfg.coordinator_only);
}

#[test]
fn build_table_merges_detection_and_settings() {
    use crate::agents::detect::DetectedAgent;

    let mut detected = BTreeMap::new();
    detected.insert(
        "claude".to_string(),
        DetectedAgent {
            kind: AgentKind::Claude,
            binary_path: "/usr/local/bin/claude".to_string(),
            version: "2.1.0".to_string(),
        },
    );
    let mut file = ConfigFile::default();
    file.agents.get_mut("claude").unwrap().default_model = Some("opus".to_string());

    let table = build_table(&detected, &file);
    assert_eq!(table.len(), 1);
    let descriptor = table.get("claude").unwrap();
    assert_eq!(descriptor.binary_path, "/usr/local/bin/claude");
    assert_eq!(descriptor.version, "2.1.0");
    assert_eq!(descriptor.default_model.as_deref(), Some("opus"));
    assert_eq!(descriptor.max_turns, Some(15));
}

// ---------------------------------------------------------------------------
// Telemetry and errors
// ---------------------------------------------------------------------------

#[test]
fn telemetry_sink_appends_jsonl() {
    let dir = tempdir().unwrap();
    let mut cfg = OrchestratorConfig::default();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir.path().join("telemetry.jsonl");
    let sink = TelemetrySink::new(&cfg, "test".to_string());

    sink.emit("run_submitted", json!({ "mode": "pipeline" }));
    sink.emit("run_done", json!({ "strategy": "primary-merge" }));

    let raw = std::fs::read_to_string(&cfg.telemetry_path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["event"], "run_submitted");
    assert_eq!(first["mode"], "pipeline");
    assert_eq!(first["command"], "test");
}

#[test]
fn error_categories_carry_hints() {
    let err = anyhow::anyhow!("no agents detected; install at least one");
    assert_eq!(categorize_error(&err), ErrorCategory::Agents);
    let rendered = format_cli_error(&err);
    assert!(rendered.starts_with("[AGENTS]"));
    assert!(rendered.contains("Hint:"));

    let err = anyhow::anyhow!("agent 'codex' timed out after 300s");
    assert_eq!(categorize_error(&err), ErrorCategory::Timeout);
}
