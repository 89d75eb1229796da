pub mod cli;
pub mod error;
pub mod instance;
pub mod locate;
pub mod process;
pub mod runner;
pub mod save;
pub mod version;

pub use error::ReplayError;
pub use locate::{find_factorio_matching_version, probe_version, ProbeAttempt};
pub use process::{launch_factorio, FactorioProcess, LineFanout, LineSplitter, Signal};
pub use runner::{run_replay, RunOptions};
pub use save::{SaveArchive, SaveInfo};
pub use version::GameVersion;
