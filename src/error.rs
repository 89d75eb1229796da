//! Error types for the replay pipeline.

use crate::locate::ProbeAttempt;
use crate::version::GameVersion;

/// Error type for replay runs.
///
/// A failed probe of a single candidate executable is deliberately not
/// represented here; during resolution it is treated as "no version" and the
/// next candidate is tried.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// A required save archive member is absent.
    #[error("could not find {member} in save file")]
    MemberNotFound { member: String },

    /// A required save archive member exists but cannot be interpreted.
    #[error("malformed {member} in save file: {reason}")]
    MalformedMember { member: String, reason: String },

    /// No candidate executable's probed version matched the save's version.
    #[error("{}", resolution_failure_message(.version, .attempts))]
    NoMatchingExecutable {
        version: GameVersion,
        attempts: Vec<ProbeAttempt>,
    },

    /// The save does not use the freeplay scenario.
    #[error("save did not use the freeplay scenario (pass --allow-not-freeplay to override)")]
    NotFreeplay,

    /// The reconciled mod set is not one of the accepted sets.
    #[error("invalid set of mods enabled: {} (pass --allow-any-mods to override)", .enabled.join(", "))]
    DisallowedMods { enabled: Vec<String> },

    /// The `--sync-mods` invocation exited non-zero.
    #[error("failed to sync mods with save (exit code {code})")]
    SyncFailed { code: i32 },

    /// The main replay invocation exited non-zero. The exit code has already
    /// been recorded in the output file by the time this is raised.
    #[error("Factorio exited with code {code}")]
    ReplayFailed { code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to read save archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("failed to parse mod-list.json: {0}")]
    ModList(#[from] serde_json::Error),
}

fn resolution_failure_message(version: &GameVersion, attempts: &[ProbeAttempt]) -> String {
    let mut message = format!("could not find a Factorio executable with version {version}. Tried:");
    for attempt in attempts {
        match &attempt.version {
            Some(probed) => {
                message.push_str(&format!("\n  {} (version {probed})", attempt.path.display()))
            }
            None => message.push_str(&format!("\n  {} (no version)", attempt.path.display())),
        }
    }
    message
}
