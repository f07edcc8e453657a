use std::time::Duration;

use bitflags::bitflags;
use emuplay_core::{MachineError, SnapshotError};
use emuplay_netplay::{NetplayConfig, NetplayError};

use crate::{movie::MovieError, snapshot_store::SnapshotStoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationState {
    Stopped,
    Running,
    Paused,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EmulationFlags: u8 {
        const PAUSED = 1 << 0;
        const SHOW_FPS = 1 << 1;
        const SHOW_OVERLAY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Advance on the wall clock, one frame per period.
    Realtime(Duration),
    /// Advance only through [`RuntimeHandle::step_frames`].
    ///
    /// [`RuntimeHandle::step_frames`]: crate::RuntimeHandle::step_frames
    Manual,
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Realtime(FRAME_DURATION_NTSC)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub pacing: Pacing,
    pub netplay: NetplayConfig,
    pub snapshots: SnapshotStoreConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime control channel disconnected")]
    ControlChannelDisconnected,
    #[error("runtime did not respond in time for {op}")]
    ControlTimeout { op: &'static str },
    #[error("failed to spawn runner thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("emulation is not running")]
    NotRunning,
    #[error("no ROM loaded")]
    NoRom,
    #[error("cannot record a movie while connected to a host")]
    RecordWhileClient,
    #[error("a movie is already playing or recording")]
    MovieActive,
    #[error("not allowed during a netplay session")]
    NetplayActive,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Movie(#[from] MovieError),
    #[error(transparent)]
    Netplay(#[from] NetplayError),
    #[error(transparent)]
    Machine(#[from] MachineError),
}

// NTSC: ~60.0988 Hz
pub(crate) const FRAME_DURATION_NTSC: Duration = Duration::from_nanos(16_639_263);
pub(crate) const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const STEP_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
