use std::net::SocketAddr;
use std::path::PathBuf;

use crossbeam_channel::Sender;
use emuplay_core::{ResetKind, RomInfo, SnapshotMeta, StateHash};
use emuplay_netplay::{ConnectionData, PeerIdentity};

use super::types::{EmulationFlags, RuntimeError};

pub(crate) type ReplySender<T> = Sender<Result<T, RuntimeError>>;
pub(crate) type ControlReplySender = ReplySender<()>;

/// Requests for the runner thread, handled between frames.
pub(crate) enum ControlMessage {
    Shutdown,
    Run(ControlReplySender),
    Pause(ControlReplySender),
    Resume(ControlReplySender),
    Reset(ResetKind, ControlReplySender),
    Stop(ControlReplySender),
    StepFrames(u64, ReplySender<u64>),
    SetFlags(EmulationFlags, ControlReplySender),
    ClearFlags(EmulationFlags, ControlReplySender),
    SaveState(usize, ReplySender<SnapshotMeta>),
    LoadState(usize, ReplySender<SnapshotMeta>),
    StartServer(u16, ReplySender<SocketAddr>),
    StopServer(ControlReplySender),
    Connect(ConnectionData, ControlReplySender),
    Disconnect(ControlReplySender),
    Peers(ReplySender<Vec<PeerIdentity>>),
    MoviePlay(PathBuf, ControlReplySender),
    MovieRecord {
        path: PathBuf,
        reset: bool,
        reply: ControlReplySender,
    },
    MovieStop(ControlReplySender),
    SetRom(Option<RomInfo>, ControlReplySender),
    Render(ControlReplySender),
    TakeScreenshot(ControlReplySender),
    StateHash(ReplySender<StateHash>),
}
