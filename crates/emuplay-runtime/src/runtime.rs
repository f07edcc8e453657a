mod control;
mod handle;
mod runner;
mod state;
mod types;

pub use handle::{Runtime, RuntimeHandle};
pub use types::{EmulationFlags, EmulationState, Pacing, RuntimeConfig, RuntimeError};
