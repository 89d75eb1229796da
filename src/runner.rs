//! The replay pipeline.
//!
//! One invocation runs strictly sequential steps: read the save's version,
//! resolve a matching executable, patch the save with the replay script, run a
//! short `--sync-mods` pass, then run the replay itself while tee-ing
//! instrumented lines to the output file until the scenario finishes.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::error::ReplayError;
use crate::instance::{enabled_mods, is_allowed_mod_set, setup_data_dir_with_save};
use crate::locate::find_factorio_matching_version;
use crate::process::game::{
    launch_factorio, scenario_finished_pattern, terminate_on_first_match, FactorioProcess,
};
use crate::save::{SaveArchive, FREEPLAY_CONTROL_LUA, REPLAY_SCRIPT};

/// Prefix the instrumentation payload puts on every line it prints.
pub const REPLAY_LINE_PREFIX: &str = "REPLAY_SCRIPT:";
/// Payload line confirming the replay script is live; arms the
/// scenario-completion watcher.
pub const STARTED_MARKER: &str = "Started replay script";

#[cfg(windows)]
const EOL: &str = "\r\n";
#[cfg(not(windows))]
const EOL: &str = "\n";

/// Options for one replay run, mirroring the CLI surface.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// User-supplied candidate executables, probed before default paths.
    pub executables: Vec<PathBuf>,
    /// Also probe platform-default install locations.
    pub include_default_paths: bool,
    /// Directory receiving `instances/` and `output/`.
    pub output_dir: PathBuf,
    /// Output log file name; defaults to `<save>-replay.log`.
    pub out_file_name: Option<String>,
    /// Path to the save archive to replay.
    pub save_file: PathBuf,
    /// Extra arguments passed through to Factorio.
    pub factorio_args: Vec<String>,
    /// Skip the enabled-mods allow-list check.
    pub allow_any_mods: bool,
    /// Skip the freeplay-scenario check.
    pub allow_not_freeplay: bool,
}

/// Execute the whole pipeline. Any step failing aborts the run; a child still
/// running when a later step fails is killed before the error propagates.
pub async fn run_replay(opts: RunOptions) -> Result<(), ReplayError> {
    let mut save = SaveArchive::read_from(&opts.save_file)?;
    let version = save.replay_version()?;
    println!("Factorio version: {version}");

    let factorio_path =
        find_factorio_matching_version(&opts.executables, opts.include_default_paths, version)
            .await?;
    tracing::info!(executable = %factorio_path.display(), "resolved factorio executable");

    let data_dir = opts
        .output_dir
        .join("instances")
        .join(version.to_string());
    let log_output_file = opts
        .output_dir
        .join("output")
        .join(opts.out_file_name.clone().unwrap_or_else(|| {
            let stem = opts
                .save_file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "save".to_string());
            format!("{stem}-replay.log")
        }));
    if let Some(parent) = log_output_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let save_info = setup_data_dir_with_save(&data_dir, &mut save, REPLAY_SCRIPT)?;

    if !opts.allow_not_freeplay
        && save_info.original_control_lua.trim() != FREEPLAY_CONTROL_LUA.trim()
    {
        return Err(ReplayError::NotFreeplay);
    }

    sync_mods(&opts, &factorio_path, &data_dir).await?;

    if !opts.allow_any_mods {
        let enabled = enabled_mods(&data_dir)?;
        if !is_allowed_mod_set(&enabled) {
            return Err(ReplayError::DisallowedMods { enabled });
        }
    }

    println!("Log output file: {}", log_output_file.display());
    let out_file = File::create(&log_output_file)?;

    let factorio = launch_factorio(&factorio_path, &data_dir, &opts.factorio_args, true)?;
    let result = drive_replay(&factorio, out_file).await;
    // Scoped teardown: a no-op after a clean exit, a kill-and-wait otherwise.
    factorio.shutdown().await;
    result?;

    println!("Done!");
    Ok(())
}

/// Run the `--sync-mods` pass so the engine reconciles the mod set the save
/// needs. Lines go to the console; a non-zero exit aborts the pipeline.
async fn sync_mods(
    opts: &RunOptions,
    factorio_path: &std::path::Path,
    data_dir: &std::path::Path,
) -> Result<(), ReplayError> {
    let mut sync_args = opts.factorio_args.clone();
    sync_args.push("--sync-mods".to_string());
    sync_args.push(opts.save_file.display().to_string());

    let sync = launch_factorio(factorio_path, data_dir, &sync_args, true)?;
    let echo = spawn_console_echo(sync.subscribe());
    sync.stream_output();
    let exit_code = sync.wait_for_exit().await;
    let _ = echo.await;

    if exit_code != 0 {
        return Err(ReplayError::SyncFailed { code: exit_code });
    }
    Ok(())
}

/// Attach the echo, tee, and completion watcher to a freshly launched replay
/// process, wait it out, and record the exit code in the output file.
async fn drive_replay(factorio: &FactorioProcess, out_file: File) -> Result<(), ReplayError> {
    let echo = spawn_console_echo(factorio.subscribe());
    let tee = spawn_replay_tee(factorio.subscribe(), out_file);
    let watcher = spawn_completion_watcher(factorio);
    // All three consumers are attached; only now does stdout start flowing.
    factorio.stream_output();

    let exit_code = factorio.wait_for_exit().await;

    let mut out_file = tee.await.map_err(std::io::Error::other)??;
    write!(out_file, "Factorio exited with code: {exit_code}{EOL}")?;
    out_file.flush()?;

    watcher.abort();
    let _ = echo.await;

    if exit_code != 0 {
        return Err(ReplayError::ReplayFailed { code: exit_code });
    }
    Ok(())
}

fn spawn_console_echo(mut rx: UnboundedReceiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{line}");
        }
    })
}

/// Tee every instrumented line (prefix stripped, along with any whitespace
/// right after it) to the output file in arrival order. Returns the file so
/// the caller can append the exit summary.
fn spawn_replay_tee(
    mut rx: UnboundedReceiver<String>,
    mut out_file: File,
) -> JoinHandle<std::io::Result<File>> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Some(rest) = line.strip_prefix(REPLAY_LINE_PREFIX) {
                out_file.write_all(rest.trim_start().as_bytes())?;
                out_file.write_all(EOL.as_bytes())?;
            }
        }
        Ok(out_file)
    })
}

/// Two-phase watcher on a single subscription: once the payload confirms it
/// started, terminate the process on the engine's scenario-deletion line.
/// Using one subscription means no line can slip between the phases.
fn spawn_completion_watcher(factorio: &FactorioProcess) -> JoinHandle<()> {
    let mut rx = factorio.subscribe();
    let killer = factorio.killer();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let started = line
                .strip_prefix(REPLAY_LINE_PREFIX)
                .is_some_and(|rest| rest.contains(STARTED_MARKER));
            if started {
                terminate_on_first_match(rx, killer, scenario_finished_pattern()).await;
                break;
            }
        }
    })
}
