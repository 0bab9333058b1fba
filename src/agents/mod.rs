pub mod detect;

use std::collections::BTreeMap;
use std::time::Duration;

/// The fixed set of CLI agents the engine knows how to drive.
///
/// Capability is enumerated here rather than discovered at runtime; a kind
/// that is not installed simply never makes it into the [`AgentTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentKind {
    Claude,
    Gemini,
    Codex,
}

pub const KNOWN_AGENT_KINDS: &[AgentKind] =
    &[AgentKind::Claude, AgentKind::Gemini, AgentKind::Codex];

impl AgentKind {
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Codex => "codex",
        }
    }

    pub fn binary(self) -> &'static str {
        self.name()
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentKind::Claude => "Claude Code",
            AgentKind::Gemini => "Gemini CLI",
            AgentKind::Codex => "Codex CLI",
        }
    }

    pub fn provider(self) -> &'static str {
        match self {
            AgentKind::Claude => "Anthropic",
            AgentKind::Gemini => "Google",
            AgentKind::Codex => "OpenAI",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        KNOWN_AGENT_KINDS
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
    }

    /// One-line capability hint surfaced to the analysis prompt.
    pub fn strengths(self) -> &'static str {
        match self {
            AgentKind::Claude => "reasoning, planning, documentation, debugging, architecture",
            AgentKind::Gemini => "web search, research, quick factual queries, Google ecosystem",
            AgentKind::Codex => {
                "code generation, code review, sandboxed execution, file operations"
            }
        }
    }
}

/// Static launch/capability record for one installed agent.
///
/// Immutable once built; owned by the [`AgentTable`] for the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub kind: AgentKind,
    pub name: String,
    pub binary_path: String,
    pub version: String,
    pub timeout: Duration,
    pub auto_approve: bool,
    pub default_model: Option<String>,
    pub max_turns: Option<u32>,
    pub extra_args: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(kind: AgentKind, binary_path: impl Into<String>) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            binary_path: binary_path.into(),
            version: "unknown".to_string(),
            timeout: Duration::from_secs(300),
            auto_approve: true,
            default_model: None,
            max_turns: None,
            extra_args: Vec::new(),
        }
    }

    /// Argument list for one invocation, prompt substituted in.
    ///
    /// Flag layout follows each tool's own CLI contract; for Codex and
    /// Gemini the prompt is a positional argument and must come last.
    pub fn build_args(&self, prompt: &str, json_output: bool) -> Vec<String> {
        let mut args = Vec::new();
        match self.kind {
            AgentKind::Claude => {
                args.push("-p".to_string());
                args.push(prompt.to_string());
                if json_output {
                    args.push("--output-format".to_string());
                    args.push("json".to_string());
                }
                if let Some(model) = &self.default_model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if self.auto_approve {
                    args.push("--permission-mode".to_string());
                    args.push("dontAsk".to_string());
                }
                if let Some(max_turns) = self.max_turns {
                    args.push("--max-turns".to_string());
                    args.push(max_turns.to_string());
                }
                args.extend(self.extra_args.iter().cloned());
            }
            AgentKind::Codex => {
                args.push("exec".to_string());
                if let Some(model) = &self.default_model {
                    args.push("-m".to_string());
                    args.push(model.clone());
                }
                if self.auto_approve {
                    args.push("--full-auto".to_string());
                }
                if json_output {
                    args.push("--json".to_string());
                }
                args.extend(self.extra_args.iter().cloned());
                args.push(prompt.to_string());
            }
            AgentKind::Gemini => {
                if json_output {
                    args.push("--output-format".to_string());
                    args.push("json".to_string());
                }
                if let Some(model) = &self.default_model {
                    args.push("-m".to_string());
                    args.push(model.clone());
                }
                if self.auto_approve {
                    args.push("-y".to_string());
                }
                args.extend(self.extra_args.iter().cloned());
                args.push(prompt.to_string());
            }
        }
        args
    }

    /// Drop stderr lines that are known tool noise rather than failure
    /// detail. Gemini's Node runtime prints a punycode deprecation warning
    /// on every invocation.
    pub fn filter_stderr(&self, stderr: &str) -> String {
        match self.kind {
            AgentKind::Gemini => stderr
                .lines()
                .filter(|line| {
                    !line.to_ascii_lowercase().contains("punycode")
                        && !line.contains("DeprecationWarning")
                })
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
            _ => stderr.trim().to_string(),
        }
    }
}

/// Markers that indicate a rate-limited response across the supported
/// CLI tools. Matching is case-insensitive substring search over the
/// combined stdout/stderr text.
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "rate_limit",
    "too many requests",
    "429",
    "quota exceeded",
    "quota_exceeded",
    "resource exhausted",
    "resource_exhausted",
    "overloaded",
    "retry after",
    "retry-after",
    "retry_after",
    "tokens per min",
    "requests per min",
];

pub fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    RATE_LIMIT_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Extract a server-suggested retry delay from `retry after: <seconds>`
/// style messages, if present.
pub fn extract_retry_after(text: &str) -> Option<Duration> {
    let lower = text.to_ascii_lowercase();
    for marker in ["retry after", "retry-after", "retry_after"] {
        let mut cursor = 0usize;
        while let Some(offset) = lower[cursor..].find(marker) {
            let rest = &lower[cursor + offset + marker.len()..];
            let rest = rest.trim_start_matches([':', ' ', '\t']);
            let digits: String = rest
                .chars()
                .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
                .collect();
            if let Ok(secs) = digits.parse::<f64>()
                && secs.is_finite()
                && secs >= 0.0
            {
                return Some(Duration::from_secs_f64(secs));
            }
            cursor += offset + marker.len();
        }
    }
    None
}

/// Registry of installed agents, keyed by agent name.
#[derive(Debug, Clone, Default)]
pub struct AgentTable {
    agents: BTreeMap<String, AgentDescriptor>,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: AgentDescriptor) {
        self.agents.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
