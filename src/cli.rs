use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "cortex",
    version,
    about = "Coordinate installed AI CLI agents: delegate, compare, or orchestrate",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Prompt to orchestrate across all installed agents (pipeline mode)
    pub prompt: Option<String>,

    /// Path to the config file (default: ~/.cortex/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the global run timeout in seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Suppress per-agent progress lines on stderr
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a prompt directly on one agent")]
    Run {
        agent: String,
        prompt: String,
        /// Model override for this invocation
        #[arg(long)]
        model: Option<String>,
        /// Extra arguments appended to the agent command (shell-style quoting)
        #[arg(long, value_name = "ARGS")]
        extra_args: Option<String>,
    },
    #[command(about = "Run the same prompt on several agents and compare side by side")]
    Compare {
        prompt: String,
        /// Agents to compare (comma separated; default: all installed)
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
    },
    #[command(about = "Analyze, delegate, collect, and synthesize one consolidated answer")]
    Orchestrate { prompt: String },
    #[command(about = "Show detected agents and resolved configuration")]
    Status,
}
