//! Locating a Factorio executable that matches a save's version.
//!
//! Candidates are probed in order: user-supplied paths first, then (opt-in)
//! platform-default install locations. A candidate that fails to start, hangs,
//! or prints no version is simply "no version" and resolution moves on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::ReplayError;
use crate::version::GameVersion;

/// Bound on how long one `--version` probe may take. Keeps discovery moving
/// past unresponsive or non-existent binaries.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// One probed candidate, kept for the resolution failure diagnostic.
#[derive(Debug, Clone)]
pub struct ProbeAttempt {
    pub path: PathBuf,
    pub version: Option<GameVersion>,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Version: (\d+)\.(\d+)\.(\d+)").expect("version pattern is valid")
    })
}

/// Run `<executable> --version` and parse the reported version.
///
/// Returns `None` on spawn failure, timeout, or missing pattern — an expected
/// negative result during discovery, not an error.
pub async fn probe_version(executable: &Path) -> Option<GameVersion> {
    let mut cmd = Command::new(executable);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(executable = %executable.display(), %err, "probe failed to start");
            return None;
        }
        Err(_) => {
            tracing::debug!(executable = %executable.display(), "probe timed out");
            return None;
        }
    };

    parse_version_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_version_output(stdout: &str) -> Option<GameVersion> {
    let captures = version_pattern().captures(stdout)?;
    Some(GameVersion::new(
        captures[1].parse().ok()?,
        captures[2].parse().ok()?,
        captures[3].parse().ok()?,
    ))
}

/// Static per-platform list of well-known Factorio install locations,
/// consulted after all user-supplied paths and only when autodetection is on.
pub fn default_lookup_paths() -> Vec<PathBuf> {
    if cfg!(windows) {
        let mut paths = vec![PathBuf::from("factorio.exe")];
        if let Ok(program_files_x86) = std::env::var("ProgramFiles(x86)") {
            paths.push(
                Path::new(&program_files_x86)
                    .join("Steam\\steamapps\\common\\Factorio\\bin\\x64\\factorio.exe"),
            );
        }
        if let Ok(program_files) = std::env::var("ProgramFiles") {
            paths.push(Path::new(&program_files).join("Factorio\\bin\\x64\\factorio.exe"));
        }
        paths
    } else {
        let mut paths = vec![PathBuf::from("factorio")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".local/share/Steam/steamapps/common/Factorio/bin/x64/factorio"));
            paths.push(home.join(
                "Library/Application Support/Steam/steamapps/common/Factorio/factorio.app/Contents/MacOS/factorio",
            ));
            paths.push(home.join(".factorio/bin/x64/factorio"));
        }
        paths.push(PathBuf::from("/Applications/factorio.app/Contents/MacOS/factorio"));
        paths.push(PathBuf::from("/usr/share/factorio/bin/x64/factorio"));
        paths.push(PathBuf::from("/usr/share/games/factorio/bin/x64/factorio"));
        paths
    }
}

/// Probe candidates in order and return the first whose version equals
/// `target` exactly. Stops probing at the first match.
pub async fn find_factorio_matching_version(
    user_paths: &[PathBuf],
    include_default_paths: bool,
    target: GameVersion,
) -> Result<PathBuf, ReplayError> {
    let mut candidates: Vec<PathBuf> = user_paths.to_vec();
    if include_default_paths {
        candidates.extend(default_lookup_paths());
    }

    let mut attempts = Vec::new();
    for candidate in candidates {
        let probed = probe_version(&candidate).await;
        tracing::debug!(candidate = %candidate.display(), version = ?probed, "probed candidate");
        if probed == Some(target) {
            return Ok(candidate);
        }
        attempts.push(ProbeAttempt {
            path: candidate,
            version: probed,
        });
    }

    Err(ReplayError::NoMatchingExecutable {
        version: target,
        attempts,
    })
}
