//! Simulation-facing types shared by the emuplay crates.
//!
//! The per-cycle simulation, renderer, audio output and input devices live
//! outside this workspace; they are reached through the traits in
//! [`machine`] and [`services`].

pub mod demo;
pub mod error;
pub mod input;
pub mod machine;
pub mod reset_kind;
pub mod services;
pub mod snapshot;

pub use error::{MachineError, SnapshotError};
pub use input::{Button, FrameFlags, InputFrame, PORT_COUNT, PortMasks};
pub use machine::{Machine, RomInfo};
pub use reset_kind::ResetKind;
pub use services::{AudioSink, IdleInput, InputPoller, NullAudio, NullRenderer, Renderer};
pub use snapshot::{Snapshot, SnapshotMeta, StateHash};
