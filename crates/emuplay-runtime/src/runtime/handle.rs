use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use emuplay_core::{ResetKind, RomInfo, SnapshotMeta, StateHash};
use emuplay_netplay::{ConnectionData, NetplaySession, PeerIdentity};
use tracing::info;

use super::{
    control::{ControlMessage, ReplySender},
    runner::Runner,
    state::RuntimeState,
    types::{
        CONTROL_REPLY_TIMEOUT, EmulationFlags, EmulationState, RuntimeConfig, RuntimeError,
        STEP_REPLY_TIMEOUT,
    },
};
use crate::{
    bus::{ListenerHandle, NotificationBus, NotificationEvent, NotificationListener},
    context::EmulationContext,
    snapshot_store::SnapshotStore,
};

struct RuntimeInner {
    ctrl_tx: Sender<ControlMessage>,
    state: Arc<RuntimeState>,
    bus: NotificationBus,
    store: Arc<SnapshotStore>,
    connect_timeout: Duration,
}

/// Owner of the runner thread. Dropping it stops the game and joins the
/// thread; [`Runtime::release`] does the same and hands the collaborators
/// back.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    join: Option<JoinHandle<EmulationContext>>,
}

#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn initialize(config: RuntimeConfig, ctx: EmulationContext) -> Result<Self, RuntimeError> {
        let (ctrl_tx, ctrl_rx) = unbounded::<ControlMessage>();

        let bus = NotificationBus::new();
        let store = Arc::new(SnapshotStore::new(config.snapshots.clone(), bus.clone()));
        store.set_rom(ctx.rom.clone());
        let session = NetplaySession::new(config.netplay.clone())?;
        let state = Arc::new(RuntimeState::new());

        let runner = Runner::new(
            ctx,
            ctrl_rx,
            Arc::clone(&state),
            bus.clone(),
            Arc::clone(&store),
            session,
            config.pacing,
        );
        let join = thread::Builder::new()
            .name("emuplay-runner".to_string())
            .spawn(move || {
                let mut runner = runner;
                runner.run();
                runner.into_context()
            })
            .map_err(RuntimeError::Spawn)?;

        let inner = Arc::new(RuntimeInner {
            ctrl_tx,
            state,
            bus,
            store,
            connect_timeout: config.netplay.handshake_timeout + CONTROL_REPLY_TIMEOUT,
        });
        info!(pacing = ?config.pacing, "runtime initialized");

        Ok(Self {
            inner,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Stop the game, leave any netplay session, finalize a movie and return
    /// the collaborators. Handles still alive afterwards get
    /// [`RuntimeError::ControlChannelDisconnected`].
    pub fn release(mut self) -> Option<EmulationContext> {
        let _ = self.inner.ctrl_tx.send(ControlMessage::Shutdown);
        let ctx = self.join.take()?.join().ok();
        info!("runtime released");
        ctx
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.inner.ctrl_tx.send(ControlMessage::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl RuntimeHandle {
    fn send_with_reply<T>(
        &self,
        op: &'static str,
        timeout: Duration,
        build: impl FnOnce(ReplySender<T>) -> ControlMessage,
    ) -> Result<T, RuntimeError> {
        let (reply_tx, reply_rx): (_, Receiver<Result<T, RuntimeError>>) = bounded(1);
        self.inner
            .ctrl_tx
            .send(build(reply_tx))
            .map_err(|_| RuntimeError::ControlChannelDisconnected)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(RuntimeError::ControlTimeout { op }),
            Err(RecvTimeoutError::Disconnected) => Err(RuntimeError::ControlChannelDisconnected),
        }
    }

    pub fn run(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("run", CONTROL_REPLY_TIMEOUT, ControlMessage::Run)
    }

    /// Refused while a netplay peer is connected; a
    /// [`NotificationEvent::PauseRejected`] is published instead.
    pub fn pause(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("pause", CONTROL_REPLY_TIMEOUT, ControlMessage::Pause)
    }

    pub fn resume(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("resume", CONTROL_REPLY_TIMEOUT, ControlMessage::Resume)
    }

    /// Resets right away unless other players share the simulation: then the
    /// host stamps the reset into its next frame and a client asks the host
    /// to do so.
    pub fn reset(&self, kind: ResetKind) -> Result<(), RuntimeError> {
        self.send_with_reply("reset", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::Reset(kind, reply)
        })
    }

    /// Idempotent; also leaves netplay and finalizes a movie.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("stop", CONTROL_REPLY_TIMEOUT, ControlMessage::Stop)
    }

    /// Run up to `frames` frames right now, ignoring pacing. Returns how many
    /// actually ran: none while paused, fewer when a client runs out of host
    /// frames.
    pub fn step_frames(&self, frames: u64) -> Result<u64, RuntimeError> {
        self.send_with_reply("step_frames", STEP_REPLY_TIMEOUT, |reply| {
            ControlMessage::StepFrames(frames, reply)
        })
    }

    pub fn set_flags(&self, flags: EmulationFlags) -> Result<(), RuntimeError> {
        self.send_with_reply("set_flags", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::SetFlags(flags, reply)
        })
    }

    pub fn clear_flags(&self, flags: EmulationFlags) -> Result<(), RuntimeError> {
        self.send_with_reply("clear_flags", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::ClearFlags(flags, reply)
        })
    }

    pub fn check_flag(&self, flag: EmulationFlags) -> bool {
        self.inner.state.flags().contains(flag)
    }

    pub fn flags(&self) -> EmulationFlags {
        self.inner.state.flags()
    }

    pub fn state(&self) -> EmulationState {
        self.inner.state.emulation_state()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == EmulationState::Paused
    }

    /// Next frame the runner will simulate.
    pub fn frame(&self) -> u64 {
        self.inner.state.frame.load(Ordering::Acquire)
    }

    pub fn save_state(&self, slot: usize) -> Result<SnapshotMeta, RuntimeError> {
        self.send_with_reply("save_state", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::SaveState(slot, reply)
        })
    }

    pub fn load_state(&self, slot: usize) -> Result<SnapshotMeta, RuntimeError> {
        self.send_with_reply("load_state", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::LoadState(slot, reply)
        })
    }

    pub fn state_info(&self, slot: usize) -> Result<SnapshotMeta, RuntimeError> {
        Ok(self.inner.store.describe(slot)?)
    }

    pub fn start_server(&self, port: u16) -> Result<SocketAddr, RuntimeError> {
        self.send_with_reply("start_server", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::StartServer(port, reply)
        })
    }

    pub fn stop_server(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("stop_server", CONTROL_REPLY_TIMEOUT, ControlMessage::StopServer)
    }

    /// Join a host and load its state, then run. Blocks until the join
    /// completes or the handshake deadline passes.
    pub fn connect(&self, data: ConnectionData) -> Result<(), RuntimeError> {
        self.send_with_reply("connect", self.inner.connect_timeout, |reply| {
            ControlMessage::Connect(data, reply)
        })
    }

    pub fn disconnect(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("disconnect", CONTROL_REPLY_TIMEOUT, ControlMessage::Disconnect)
    }

    pub fn peers(&self) -> Result<Vec<PeerIdentity>, RuntimeError> {
        self.send_with_reply("peers", CONTROL_REPLY_TIMEOUT, ControlMessage::Peers)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.connected.load(Ordering::Acquire)
    }

    pub fn is_server_running(&self) -> bool {
        self.inner.state.server_running.load(Ordering::Acquire)
    }

    pub fn movie_play(&self, path: impl Into<PathBuf>) -> Result<(), RuntimeError> {
        let path = path.into();
        self.send_with_reply("movie_play", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::MoviePlay(path, reply)
        })
    }

    /// Start recording. With `reset` the movie starts from power-on,
    /// otherwise from the current state.
    pub fn movie_record(&self, path: impl Into<PathBuf>, reset: bool) -> Result<(), RuntimeError> {
        let path = path.into();
        self.send_with_reply("movie_record", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::MovieRecord { path, reset, reply }
        })
    }

    pub fn movie_stop(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("movie_stop", CONTROL_REPLY_TIMEOUT, ControlMessage::MovieStop)
    }

    pub fn movie_playing(&self) -> bool {
        self.inner.state.playing.load(Ordering::Acquire)
    }

    pub fn movie_recording(&self) -> bool {
        self.inner.state.recording.load(Ordering::Acquire)
    }

    pub fn set_rom(&self, rom: Option<RomInfo>) -> Result<(), RuntimeError> {
        self.send_with_reply("set_rom", CONTROL_REPLY_TIMEOUT, |reply| {
            ControlMessage::SetRom(rom, reply)
        })
    }

    pub fn render(&self) -> Result<(), RuntimeError> {
        self.send_with_reply("render", CONTROL_REPLY_TIMEOUT, ControlMessage::Render)
    }

    pub fn take_screenshot(&self) -> Result<(), RuntimeError> {
        self.send_with_reply(
            "take_screenshot",
            CONTROL_REPLY_TIMEOUT,
            ControlMessage::TakeScreenshot,
        )
    }

    /// SHA-1 of the current machine state.
    pub fn state_hash(&self) -> Result<StateHash, RuntimeError> {
        self.send_with_reply("state_hash", CONTROL_REPLY_TIMEOUT, ControlMessage::StateHash)
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.inner.bus
    }

    pub fn subscribe(&self, listener: impl NotificationListener + 'static) -> ListenerHandle {
        self.inner.bus.subscribe(listener)
    }

    pub fn subscribe_channel(&self, capacity: usize) -> (ListenerHandle, Receiver<NotificationEvent>) {
        self.inner.bus.subscribe_channel(capacity)
    }

    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        self.inner.bus.unsubscribe(handle)
    }
}
