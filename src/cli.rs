//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::error::ReplayError;
use crate::runner::{run_replay, RunOptions};

/// Replay a Factorio save with instrumented log capture.
#[derive(Debug, Parser)]
#[command(name = "factorio-replay", version, about)]
pub struct Cli {
    /// Path to the replay save file (zip)
    pub save_file: PathBuf,

    /// Output file name for the log file. Defaults to "<save>-replay.log"
    #[arg(short, long)]
    pub out: Option<String>,

    /// Directory to use for outputs: creates "output/" for log files and
    /// "instances/" for per-version Factorio data directories
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Path to a Factorio executable. Can be given multiple times; candidates
    /// are probed in order and take precedence over autodetected paths
    #[arg(short, long = "factorio", action = ArgAction::Append)]
    pub factorio: Vec<PathBuf>,

    /// Do not probe default Factorio install locations
    #[arg(long)]
    pub no_autodetect: bool,

    /// Don't check for a valid set of enabled mods
    #[arg(long)]
    pub allow_any_mods: bool,

    /// Allow non-freeplay scenario saves
    #[arg(long)]
    pub allow_not_freeplay: bool,

    /// Additional arguments passed through to Factorio
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub factorio_args: Vec<String>,
}

impl Cli {
    pub fn into_run_options(self) -> std::io::Result<RunOptions> {
        Ok(RunOptions {
            executables: self.factorio,
            include_default_paths: !self.no_autodetect,
            output_dir: std::path::absolute(self.directory)?,
            out_file_name: self.out,
            save_file: std::path::absolute(self.save_file)?,
            factorio_args: self.factorio_args,
            allow_any_mods: self.allow_any_mods,
            allow_not_freeplay: self.allow_not_freeplay,
        })
    }
}

pub async fn run(cli: Cli) -> Result<(), ReplayError> {
    let opts = cli.into_run_options()?;
    run_replay(opts).await
}
