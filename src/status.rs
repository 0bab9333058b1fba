use std::collections::BTreeMap;

use anyhow::Result;

use crate::agents::AgentTable;
use crate::agents::detect::DetectedAgent;
use crate::config::OrchestratorConfig;

/// Print detected agents and the resolved runtime settings.
pub fn run_status(
    cfg: &OrchestratorConfig,
    detected: &BTreeMap<String, DetectedAgent>,
    table: &AgentTable,
) -> Result<()> {
    println!("Detected agents:");
    if detected.is_empty() {
        println!("- none (install claude, gemini, or codex and re-run)");
    }
    for agent in detected.values() {
        println!(
            "- {} ({}, {}) v{} at {}",
            agent.kind.name(),
            agent.kind.display_name(),
            agent.kind.provider(),
            agent.version,
            agent.binary_path
        );
    }

    let primary_installed = table.contains(&cfg.primary);
    println!(
        "Primary: {} ({}{})",
        cfg.primary,
        if primary_installed { "installed" } else { "NOT installed" },
        if cfg.coordinator_only { ", coordinator-only" } else { "" }
    );
    println!(
        "Global timeout: {}s, retries: {} (base {:.1}s, cap {:.1}s), json_output: {}",
        cfg.global_timeout.as_secs(),
        cfg.retry.max_retries,
        cfg.retry.base_delay.as_secs_f64(),
        cfg.retry.max_delay.as_secs_f64(),
        cfg.json_output
    );

    println!("Agent settings:");
    for descriptor in table.iter() {
        println!(
            "- {}: timeout={}s auto_approve={} model={} max_turns={} extra_args={:?}",
            descriptor.name,
            descriptor.timeout.as_secs(),
            descriptor.auto_approve,
            descriptor.default_model.as_deref().unwrap_or("<default>"),
            descriptor
                .max_turns
                .map(|turns| turns.to_string())
                .unwrap_or_else(|| "<unlimited>".to_string()),
            descriptor.extra_args
        );
    }

    if cfg.telemetry_enabled {
        println!("Telemetry: enabled ({})", cfg.telemetry_path.display());
    } else {
        println!("Telemetry: disabled");
    }
    Ok(())
}
