#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Agents,
    RateLimit,
    Timeout,
    Input,
    Config,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Agents => "AGENTS",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Agents => {
                "Install at least one agent CLI (claude, gemini, codex) and check `cortex status`."
            }
            ErrorCategory::RateLimit => {
                "The agent's API quota is exhausted. Wait a few minutes or raise max_retries in ~/.cortex/config.toml."
            }
            ErrorCategory::Timeout => {
                "Raise the per-agent timeout or the global parallel_timeout in ~/.cortex/config.toml, or pass --timeout."
            }
            ErrorCategory::Input => "Run cortex --help and correct command arguments.",
            ErrorCategory::Config => {
                "Check ~/.cortex/config.toml; delete it to regenerate the commented defaults."
            }
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("rate limit") || msg.contains("rate_limited") || msg.contains("retries") {
        return ErrorCategory::RateLimit;
    }

    if msg.contains("timed out") || msg.contains("timeout") {
        return ErrorCategory::Timeout;
    }

    if msg.contains("not installed")
        || msg.contains("no agents detected")
        || msg.contains("no usable result")
        || msg.contains("no worker agents")
        || msg.contains("not found on path")
    {
        return ErrorCategory::Agents;
    }

    if msg.contains("invalid value") || msg.contains("unknown argument") || msg.contains("usage:") {
        return ErrorCategory::Input;
    }

    if msg.contains("config") || msg.contains("toml") {
        return ErrorCategory::Config;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {err:#}\nHint: {}", category.code(), category.hint())
}
