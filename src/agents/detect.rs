use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use super::{AgentKind, KNOWN_AGENT_KINDS};
use crate::invoker::{ProcessOutput, ProcessRunner};

pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// An agent binary found on PATH, with its probed version.
#[derive(Debug, Clone)]
pub struct DetectedAgent {
    pub kind: AgentKind,
    pub binary_path: String,
    pub version: String,
}

/// Probe PATH for every known agent and query each one's version
/// concurrently. Agents whose binary is missing are omitted; a failed
/// version probe still counts as detected (version "unknown").
pub async fn detect_all(runner: Arc<dyn ProcessRunner>) -> BTreeMap<String, DetectedAgent> {
    let mut probes = JoinSet::new();
    for kind in KNOWN_AGENT_KINDS.iter().copied() {
        let Some(path) = find_on_path(kind.binary()) else {
            tracing::debug!(agent = kind.name(), "not found on PATH");
            continue;
        };
        let path = path.to_string_lossy().into_owned();
        tracing::info!(agent = kind.name(), path = %path, "found agent binary");
        let runner = Arc::clone(&runner);
        probes.spawn(async move {
            let output = runner
                .run(&path, &["--version".to_string()], VERSION_PROBE_TIMEOUT)
                .await;
            let version = match output {
                ProcessOutput::Exited { stdout, stderr, .. } => extract_semver(&stdout)
                    .or_else(|| extract_semver(&stderr))
                    .unwrap_or_else(|| "unknown".to_string()),
                other => {
                    tracing::warn!(agent = kind.name(), ?other, "version probe failed");
                    "unknown".to_string()
                }
            };
            DetectedAgent {
                kind,
                binary_path: path,
                version,
            }
        });
    }

    let mut detected = BTreeMap::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(agent) => {
                detected.insert(agent.kind.name().to_string(), agent);
            }
            Err(err) => tracing::warn!(error = %err, "agent detection task failed"),
        }
    }
    detected
}

/// Resolve a binary name against PATH, like `which`.
pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(binary);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

/// First `major.minor.patch` sequence in the text, if any.
pub fn extract_semver(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut idx = 0usize;
    while idx < bytes.len() {
        if bytes[idx].is_ascii_digit() {
            let start = idx;
            let mut end = idx;
            let mut dots = 0usize;
            while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
                if bytes[end] == b'.' {
                    // A trailing dot is not part of the version.
                    if end + 1 >= bytes.len() || !bytes[end + 1].is_ascii_digit() {
                        break;
                    }
                    dots += 1;
                }
                end += 1;
            }
            if dots >= 2 {
                return Some(text[start..end].to_string());
            }
            idx = end.max(idx + 1);
        } else {
            idx += 1;
        }
    }
    None
}
