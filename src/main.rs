use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cortex_cli::agents::detect::detect_all;
use cortex_cli::cli::{Cli, Commands};
use cortex_cli::config::{OrchestratorConfig, build_table, load_config};
use cortex_cli::error::format_cli_error;
use cortex_cli::events::EventSink;
use cortex_cli::invoker::{ProcessRunner, TokioProcessRunner};
use cortex_cli::output::{print_answer, print_compare, progress_line};
use cortex_cli::pipeline::{Engine, RunMode, RunRequest};
use cortex_cli::status::run_status;
use cortex_cli::synthesis::SynthesisStrategy;
use cortex_cli::telemetry::TelemetrySink;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("{}", format_cli_error(&err));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file = load_config(cli.config.as_deref())?;
    let cfg = OrchestratorConfig::from_file(&file);
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);

    let detected = detect_all(Arc::clone(&runner)).await;
    let mut table = build_table(&detected, &file);

    let (command_label, mode, prompt) = match &cli.command {
        Some(Commands::Status) => {
            return run_status(&cfg, &detected, &table);
        }
        Some(Commands::Run {
            agent,
            prompt,
            model,
            extra_args,
        }) => {
            // Per-invocation overrides replace the descriptor for this run.
            if let Some(mut descriptor) = table.get(agent).cloned() {
                if let Some(model) = model {
                    descriptor.default_model = Some(model.clone());
                }
                if let Some(extra) = extra_args {
                    descriptor.extra_args = shlex::split(extra)
                        .ok_or_else(|| anyhow::anyhow!("invalid --extra-args quoting: {extra}"))?;
                }
                table.insert(descriptor);
            }
            (
                "run",
                RunMode::Direct {
                    agent: agent.clone(),
                },
                prompt.clone(),
            )
        }
        Some(Commands::Compare { prompt, agents }) => (
            "compare",
            RunMode::Compare {
                agents: agents.clone(),
            },
            prompt.clone(),
        ),
        Some(Commands::Orchestrate { prompt }) => ("orchestrate", RunMode::Pipeline, prompt.clone()),
        None => {
            let Some(prompt) = cli.prompt.clone() else {
                bail!("usage: cortex <prompt>, or cortex --help for subcommands");
            };
            ("orchestrate", RunMode::Pipeline, prompt)
        }
    };

    let (events, printer) = if cli.quiet {
        (EventSink::disabled(), None)
    } else {
        let (sink, mut rx) = EventSink::channel(cfg.event_capacity);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(line) = progress_line(&event) {
                    eprintln!("{line}");
                }
            }
        });
        (sink, Some(handle))
    };

    let telemetry = TelemetrySink::new(&cfg, command_label.to_string());
    let engine = Engine::new(table, cfg, runner, events, telemetry);
    let request = RunRequest {
        prompt,
        mode,
        global_timeout: cli.timeout.map(Duration::from_secs),
    };

    let result = engine.submit(request).await;
    // Close the event channel so the printer drains and exits.
    drop(engine);
    if let Some(handle) = printer {
        let _ = handle.await;
    }

    let result = result?;
    if result.strategy == SynthesisStrategy::SideBySide {
        print_compare(&result);
    } else {
        print_answer(&result);
    }
    Ok(())
}
