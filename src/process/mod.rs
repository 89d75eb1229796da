pub mod game;
pub mod lines;

pub use game::{launch_factorio, FactorioProcess, ProcessKiller, Signal};
pub use lines::{LineFanout, LineSplitter};
