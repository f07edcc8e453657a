use std::{
    mem,
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use emuplay_core::{FrameFlags, InputFrame, ResetKind, RomInfo, StateHash};
use emuplay_netplay::{ConnectionData, NetplaySession, PeerIdentity, SessionEvent, SessionRole};
use tracing::{debug, error, info, warn};

use super::{
    control::ControlMessage,
    state::RuntimeState,
    types::{EmulationFlags, Pacing, RuntimeError},
};
use crate::{
    bus::{NotificationBus, NotificationEvent},
    context::EmulationContext,
    movie::{Movie, MovieHeader, MoviePlayer, MovieRecorder, MovieStart},
    snapshot_store::SnapshotStore,
};

/// Why a wait on the control channel ended.
enum Wake {
    Shutdown,
    /// A control message ran; state or deadline may have moved.
    Control,
    /// The frame deadline arrived.
    Due,
}

const SLEEP_SLICE: Duration = Duration::from_millis(4);
// Below this the wait spins instead of sleeping.
const SPIN_WINDOW: Duration = Duration::from_micros(300);
const SPIN_YIELD_EVERY: u32 = 512;
// Frames may start this much before their deadline.
const FRAME_LEAD: Duration = Duration::from_micros(50);
const MAX_CATCH_UP_FRAMES: u32 = 3;
const IDLE_POLL: Duration = Duration::from_millis(10);
// Host frames a client may hold before it runs extra frames to catch up.
const CLIENT_BACKLOG: usize = 1;

enum MovieState {
    Idle,
    Recording(MovieRecorder),
    Playing(MoviePlayer),
}

pub(crate) struct Runner {
    ctx: EmulationContext,
    ctrl_rx: Receiver<ControlMessage>,
    state: Arc<RuntimeState>,
    bus: NotificationBus,
    store: Arc<SnapshotStore>,
    session: NetplaySession,
    movie: MovieState,
    /// Local reset to stamp into the next recorded frame.
    recorded_reset: Option<ResetKind>,
    /// Joined peers still waiting for their snapshot.
    unsynced_peers: Vec<PeerIdentity>,
    pacing: Pacing,
    frame: u64,
    next_frame_deadline: Instant,
    audio_buf: Vec<f32>,
}

impl Runner {
    pub(crate) fn new(
        ctx: EmulationContext,
        ctrl_rx: Receiver<ControlMessage>,
        state: Arc<RuntimeState>,
        bus: NotificationBus,
        store: Arc<SnapshotStore>,
        session: NetplaySession,
        pacing: Pacing,
    ) -> Self {
        Self {
            ctx,
            ctrl_rx,
            state,
            bus,
            store,
            session,
            movie: MovieState::Idle,
            recorded_reset: None,
            unsynced_peers: Vec::new(),
            pacing,
            frame: 0,
            next_frame_deadline: Instant::now(),
            audio_buf: Vec::new(),
        }
    }

    pub(crate) fn run(&mut self) {
        let mut last_running = self.state.is_running();

        loop {
            while let Ok(msg) = self.ctrl_rx.try_recv() {
                if self.handle_control(msg) {
                    return;
                }
            }
            self.service_netplay();

            let running = self.state.is_running();
            if running && !last_running {
                self.next_frame_deadline = Instant::now();
            }
            last_running = running;

            let frame_duration = match self.pacing {
                Pacing::Realtime(d) if running => d,
                _ => {
                    if let Some(Wake::Shutdown) = self.wait_control(IDLE_POLL) {
                        return;
                    }
                    continue;
                }
            };

            match self.wait_for_deadline() {
                Wake::Shutdown => return,
                Wake::Control => continue,
                Wake::Due => {}
            }

            let mut frames_run: u32 = 0;
            while frames_run < MAX_CATCH_UP_FRAMES && self.state.is_running() {
                let due = Instant::now() + FRAME_LEAD >= self.next_frame_deadline;
                let behind_host = self.session.buffered_frames() > CLIENT_BACKLOG;
                if !due && !behind_host {
                    break;
                }
                self.step_frame();
                if due {
                    self.next_frame_deadline += frame_duration;
                }
                frames_run += 1;
            }

            let now = Instant::now();
            if now > self.next_frame_deadline
                && now.duration_since(self.next_frame_deadline) > frame_duration * 2
            {
                self.next_frame_deadline = now;
            }
        }
    }

    /// Tear everything down and hand the collaborators back.
    pub(crate) fn into_context(mut self) -> EmulationContext {
        self.stop_game();
        self.ctx
    }

    fn dispatch(&mut self, msg: ControlMessage) -> Wake {
        if self.handle_control(msg) {
            Wake::Shutdown
        } else {
            Wake::Control
        }
    }

    /// Block on the control channel for at most `wait`. `None` on timeout.
    fn wait_control(&mut self, wait: Duration) -> Option<Wake> {
        match self.ctrl_rx.recv_timeout(wait) {
            Ok(msg) => Some(self.dispatch(msg)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Wake::Shutdown),
        }
    }

    /// Sleep toward the next frame deadline in short slices and spin through
    /// the last stretch. Any control message ends the wait early.
    fn wait_for_deadline(&mut self) -> Wake {
        let target = self
            .next_frame_deadline
            .checked_sub(FRAME_LEAD)
            .unwrap_or(self.next_frame_deadline);
        let mut spins: u32 = 0;
        loop {
            let left = target.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Wake::Due;
            }
            if left > SPIN_WINDOW {
                if let Some(wake) = self.wait_control((left - SPIN_WINDOW).min(SLEEP_SLICE)) {
                    return wake;
                }
                continue;
            }
            match self.ctrl_rx.try_recv() {
                Ok(msg) => return self.dispatch(msg),
                Err(TryRecvError::Disconnected) => return Wake::Shutdown,
                Err(TryRecvError::Empty) => {}
            }
            spins = spins.wrapping_add(1);
            if spins.is_multiple_of(SPIN_YIELD_EVERY) {
                thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> bool {
        match msg {
            ControlMessage::Shutdown => return true,
            ControlMessage::Run(reply) => {
                self.start_game();
                let _ = reply.send(Ok(()));
            }
            ControlMessage::Pause(reply) => {
                self.pause();
                let _ = reply.send(Ok(()));
            }
            ControlMessage::Resume(reply) => {
                self.resume();
                let _ = reply.send(Ok(()));
            }
            ControlMessage::Reset(kind, reply) => {
                let _ = reply.send(self.reset(kind));
            }
            ControlMessage::Stop(reply) => {
                self.stop_game();
                let _ = reply.send(Ok(()));
            }
            ControlMessage::StepFrames(frames, reply) => {
                let _ = reply.send(self.step_frames(frames));
            }
            ControlMessage::SetFlags(flags, reply) => {
                self.set_flags(flags);
                let _ = reply.send(Ok(()));
            }
            ControlMessage::ClearFlags(flags, reply) => {
                self.clear_flags(flags);
                let _ = reply.send(Ok(()));
            }
            ControlMessage::SaveState(slot, reply) => {
                let res = self.store.save(slot, self.ctx.machine.as_ref(), self.frame);
                let _ = reply.send(res.map_err(Into::into));
            }
            ControlMessage::LoadState(slot, reply) => {
                let _ = reply.send(self.load_state(slot));
            }
            ControlMessage::StartServer(port, reply) => {
                let _ = reply.send(self.start_server(port));
            }
            ControlMessage::StopServer(reply) => {
                if self.session.is_server_running() {
                    self.session.stop_server();
                    self.unsynced_peers.clear();
                    self.bus.publish(NotificationEvent::ServerStopped);
                }
                self.sync_net_state();
                let _ = reply.send(Ok(()));
            }
            ControlMessage::Connect(data, reply) => {
                let _ = reply.send(self.connect(data));
            }
            ControlMessage::Disconnect(reply) => {
                if self.session.role() == SessionRole::Client {
                    self.session.disconnect();
                    self.bus.publish(NotificationEvent::Disconnected);
                }
                self.sync_net_state();
                let _ = reply.send(Ok(()));
            }
            ControlMessage::Peers(reply) => {
                let _ = reply.send(Ok(self.session.peers()));
            }
            ControlMessage::MoviePlay(path, reply) => {
                let _ = reply.send(self.movie_play(path));
            }
            ControlMessage::MovieRecord { path, reset, reply } => {
                let _ = reply.send(self.movie_record(path, reset));
            }
            ControlMessage::MovieStop(reply) => {
                let _ = reply.send(self.finish_movie());
            }
            ControlMessage::SetRom(rom, reply) => {
                self.set_rom(rom);
                let _ = reply.send(Ok(()));
            }
            ControlMessage::Render(reply) => {
                self.ctx.renderer.render(self.frame);
                let _ = reply.send(Ok(()));
            }
            ControlMessage::TakeScreenshot(reply) => {
                let res = match &self.ctx.rom {
                    Some(rom) => {
                        self.ctx.renderer.take_screenshot(rom.path());
                        Ok(())
                    }
                    None => Err(RuntimeError::NoRom),
                };
                let _ = reply.send(res);
            }
            ControlMessage::StateHash(reply) => {
                let res = StateHash::of_machine(self.ctx.machine.as_ref()).map_err(Into::into);
                let _ = reply.send(res);
            }
        }

        false
    }

    fn start_game(&mut self) {
        if self.state.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.remove_flags(EmulationFlags::PAUSED);
        self.next_frame_deadline = Instant::now();
        info!(frame = self.frame, "game started");
        self.bus.publish(NotificationEvent::GameStarted);
    }

    fn stop_game(&mut self) {
        self.leave_netplay();
        if let Err(e) = self.finish_movie() {
            warn!(error = %e, "failed to finalize movie");
        }
        self.state.remove_flags(EmulationFlags::PAUSED);
        self.ctx.audio.clear();
        if self.state.started.swap(false, Ordering::AcqRel) {
            info!(frame = self.frame, "game stopped");
            self.bus.publish(NotificationEvent::GameStopped);
        }
    }

    fn pause(&mut self) {
        if !self.state.started.load(Ordering::Acquire)
            || self.state.flags().contains(EmulationFlags::PAUSED)
        {
            return;
        }
        if self.session.is_connected() {
            info!("pause refused during netplay");
            self.bus.publish(NotificationEvent::PauseRejected);
            return;
        }
        self.state.insert_flags(EmulationFlags::PAUSED);
        self.ctx.audio.clear();
        self.bus.publish(NotificationEvent::GamePaused);
    }

    fn resume(&mut self) {
        if !self.state.flags().contains(EmulationFlags::PAUSED) {
            return;
        }
        self.state.remove_flags(EmulationFlags::PAUSED);
        self.next_frame_deadline = Instant::now();
        if self.state.started.load(Ordering::Acquire) {
            self.bus.publish(NotificationEvent::GameResumed);
        }
    }

    fn set_flags(&mut self, flags: EmulationFlags) {
        if flags.contains(EmulationFlags::PAUSED) {
            self.pause();
        }
        let rest = flags - EmulationFlags::PAUSED;
        self.state.insert_flags(rest);
        if rest.contains(EmulationFlags::SHOW_FPS) {
            self.ctx.renderer.set_show_fps(true);
        }
    }

    fn clear_flags(&mut self, flags: EmulationFlags) {
        if flags.contains(EmulationFlags::PAUSED) {
            self.resume();
        }
        let rest = flags - EmulationFlags::PAUSED;
        self.state.remove_flags(rest);
        if rest.contains(EmulationFlags::SHOW_FPS) {
            self.ctx.renderer.set_show_fps(false);
        }
    }

    fn reset(&mut self, kind: ResetKind) -> Result<(), RuntimeError> {
        if self.session.is_connected() {
            self.session.schedule_reset(kind)?;
            debug!(?kind, "reset scheduled through netplay");
            return Ok(());
        }
        // With nobody else simulating, the reset is purely local.
        self.apply_reset(kind);
        if matches!(self.movie, MovieState::Recording(_)) {
            self.recorded_reset = Some(match (self.recorded_reset, kind) {
                (Some(ResetKind::PowerOn), _) => ResetKind::PowerOn,
                (_, kind) => kind,
            });
        }
        Ok(())
    }

    fn apply_reset(&mut self, kind: ResetKind) {
        self.ctx.machine.reset(kind);
        self.ctx.audio.clear();
        info!(?kind, frame = self.frame, "machine reset");
        self.bus.publish(NotificationEvent::GameReset);
    }

    fn step_frames(&mut self, frames: u64) -> Result<u64, RuntimeError> {
        if !self.state.started.load(Ordering::Acquire) {
            return Err(RuntimeError::NotRunning);
        }
        let mut advanced = 0;
        for _ in 0..frames {
            if !self.state.is_running() {
                break;
            }
            if self.step_frame() {
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Run one frame from the active input source. Returns whether the
    /// machine advanced.
    fn step_frame(&mut self) -> bool {
        self.service_netplay();
        let local = self.ctx.input.poll(self.frame);

        let input = match self.session.role() {
            SessionRole::Client => match self.session.next_client_frame() {
                Some(input) => input,
                None => return false,
            },
            SessionRole::Server => match self.session.host_frame(self.frame, local[0]) {
                Ok(input) => input,
                Err(e) => {
                    warn!(frame = self.frame, error = %e, "failed to broadcast frame");
                    self.bus.publish(NotificationEvent::NetplayError);
                    InputFrame::new(self.frame, local)
                }
            },
            SessionRole::Inactive => {
                let recorded = match &mut self.movie {
                    MovieState::Playing(player) => Some(player.next()),
                    _ => None,
                };
                match recorded {
                    Some(Some(recorded)) => InputFrame {
                        frame: self.frame,
                        ..recorded
                    },
                    Some(None) => {
                        self.finish_playback();
                        return false;
                    }
                    None => InputFrame::new(self.frame, local),
                }
            }
        };

        if let Some(kind) = input.commands.reset_kind() {
            self.apply_reset(kind);
        }
        if let Err(e) = self.ctx.machine.run_frame(&input.ports) {
            error!(frame = input.frame, error = %e, "simulation fault, stopping");
            self.stop_game();
            return false;
        }

        if self.session.role() == SessionRole::Client
            && let Err(e) = self.session.send_local_input(input.frame, local[0])
        {
            debug!(frame = input.frame, error = %e, "local input not sent");
        }
        if let MovieState::Recording(recorder) = &mut self.movie {
            let mut recorded = input;
            if let Some(kind) = self.recorded_reset.take() {
                recorded.commands |= FrameFlags::for_reset(kind);
            }
            recorder.push(recorded);
        }

        self.audio_buf.clear();
        self.ctx.machine.drain_audio(&mut self.audio_buf);
        if !self.audio_buf.is_empty() {
            self.ctx.audio.submit(&self.audio_buf);
        }
        self.ctx.renderer.render(input.frame);

        self.frame = input.frame + 1;
        self.state.frame.store(self.frame, Ordering::Release);

        if let MovieState::Playing(player) = &self.movie
            && player.is_finished()
        {
            self.finish_playback();
        }
        true
    }

    fn service_netplay(&mut self) {
        if self.session.role() == SessionRole::Inactive {
            return;
        }
        for event in self.session.poll(self.frame) {
            match event {
                SessionEvent::PeerJoined(peer) => {
                    // A paused host would leave the new peer waiting forever.
                    self.resume();
                    self.unsynced_peers.push(peer);
                }
                SessionEvent::PeerLeft { peer_id, reason } => {
                    self.unsynced_peers.retain(|p| p.peer_id != peer_id);
                    info!(peer_id, %reason, "peer disconnected");
                    self.bus.publish(NotificationEvent::PeerDisconnected);
                }
                SessionEvent::InputDropped { peer_id, frame } => {
                    debug!(peer_id, frame, "late input dropped");
                    self.bus.publish(NotificationEvent::InputDropped);
                }
                SessionEvent::ResetRequested { peer_id, kind } => {
                    debug!(peer_id, ?kind, "reset requested by peer");
                }
                SessionEvent::StateReplaced { frame, data } => self.replace_state(frame, &data),
                SessionEvent::Disconnected { reason } => {
                    warn!(%reason, "netplay session ended");
                    self.bus.publish(NotificationEvent::Disconnected);
                }
            }
        }
        self.sync_new_peers();
        self.sync_net_state();
    }

    /// Push the current state to joined peers. A peer whose snapshot cannot be
    /// taken right now is retried at the next frame boundary.
    fn sync_new_peers(&mut self) {
        if self.unsynced_peers.is_empty() {
            return;
        }
        let bytes = match self.store.capture(self.ctx.machine.as_ref(), self.frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "snapshot for joining peer deferred");
                return;
            }
        };
        for peer in mem::take(&mut self.unsynced_peers) {
            match self.session.send_snapshot(peer.peer_id, self.frame, &bytes) {
                Ok(()) => {
                    info!(
                        peer_id = peer.peer_id,
                        port = peer.port,
                        name = %peer.name,
                        frame = self.frame,
                        "peer synced"
                    );
                    self.bus.publish(NotificationEvent::PeerConnected);
                }
                Err(e) => {
                    warn!(peer_id = peer.peer_id, error = %e, "failed to sync peer");
                    self.bus.publish(NotificationEvent::NetplayError);
                }
            }
        }
    }

    fn replace_state(&mut self, frame: u64, data: &[u8]) {
        match self.store.load_from_bytes(data, self.ctx.machine.as_mut()) {
            Ok(_) => {
                self.frame = frame;
                self.state.frame.store(frame, Ordering::Release);
                self.ctx.audio.clear();
                info!(frame, "state replaced by host");
                self.bus.publish(NotificationEvent::StateLoaded);
            }
            Err(e) => {
                error!(frame, error = %e, "host state rejected, leaving session");
                self.session.disconnect();
                self.bus.publish(NotificationEvent::NetplayError);
                self.bus.publish(NotificationEvent::Disconnected);
            }
        }
    }

    fn sync_net_state(&self) {
        self.state
            .connected
            .store(self.session.is_connected(), Ordering::Release);
        self.state
            .server_running
            .store(self.session.is_server_running(), Ordering::Release);
    }

    fn leave_netplay(&mut self) {
        match self.session.role() {
            SessionRole::Server => {
                self.session.stop_server();
                self.unsynced_peers.clear();
                self.bus.publish(NotificationEvent::ServerStopped);
            }
            SessionRole::Client => {
                self.session.disconnect();
                self.bus.publish(NotificationEvent::Disconnected);
            }
            SessionRole::Inactive => {}
        }
        self.sync_net_state();
    }

    fn load_state(&mut self, slot: usize) -> Result<emuplay_core::SnapshotMeta, RuntimeError> {
        if !matches!(self.movie, MovieState::Idle) {
            return Err(RuntimeError::MovieActive);
        }
        if self.session.role() == SessionRole::Client {
            return Err(RuntimeError::NetplayActive);
        }
        let meta = self.store.load(slot, self.ctx.machine.as_mut())?;
        self.ctx.audio.clear();
        if self.session.role() == SessionRole::Server {
            match self.store.capture(self.ctx.machine.as_ref(), self.frame) {
                Ok(bytes) => self.session.resync_all(self.frame, &bytes),
                Err(e) => warn!(error = %e, "could not resync peers after load"),
            }
        }
        Ok(meta)
    }

    fn start_server(&mut self, port: u16) -> Result<std::net::SocketAddr, RuntimeError> {
        if matches!(self.movie, MovieState::Playing(_)) {
            return Err(RuntimeError::MovieActive);
        }
        let was_running = self.session.is_server_running();
        let addr = self.session.start_server(port)?;
        if !was_running {
            self.bus.publish(NotificationEvent::ServerStarted);
        }
        self.sync_net_state();
        Ok(addr)
    }

    fn connect(&mut self, data: ConnectionData) -> Result<(), RuntimeError> {
        if !matches!(self.movie, MovieState::Idle) {
            return Err(RuntimeError::MovieActive);
        }
        let sync = self.session.connect(data)?;
        if let Err(e) = self.store.load_from_bytes(&sync.data, self.ctx.machine.as_mut()) {
            warn!(error = %e, "host state rejected");
            self.session.disconnect();
            self.sync_net_state();
            return Err(e.into());
        }
        self.frame = sync.frame;
        self.state.frame.store(sync.frame, Ordering::Release);
        self.ctx.audio.clear();
        self.sync_net_state();
        info!(frame = sync.frame, "connected to host");
        self.bus.publish(NotificationEvent::Connected);
        // The host never waits for us, so a joined client must be running.
        self.start_game();
        self.resume();
        Ok(())
    }

    fn movie_play(&mut self, path: PathBuf) -> Result<(), RuntimeError> {
        if self.session.role() != SessionRole::Inactive {
            return Err(RuntimeError::NetplayActive);
        }
        if !matches!(self.movie, MovieState::Idle) {
            return Err(RuntimeError::MovieActive);
        }
        let movie = Movie::load(&path)?;
        movie.header.check_rom(self.ctx.rom.as_ref())?;
        match &movie.header.start {
            MovieStart::PowerOn => self.ctx.machine.reset(ResetKind::PowerOn),
            MovieStart::Snapshot(bytes) => {
                self.store.load_from_bytes(bytes, self.ctx.machine.as_mut())?;
            }
        }
        self.ctx.audio.clear();

        let player = MoviePlayer::new(movie);
        info!(path = %path.display(), frames = player.len(), "movie playback started");
        self.bus.publish(NotificationEvent::PlaybackStarted);
        if player.is_finished() {
            self.bus.publish(NotificationEvent::PlaybackFinished);
        } else {
            self.movie = MovieState::Playing(player);
            self.state.playing.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn movie_record(&mut self, path: PathBuf, reset: bool) -> Result<(), RuntimeError> {
        match self.session.role() {
            SessionRole::Client => return Err(RuntimeError::RecordWhileClient),
            // A local power cycle would desync every peer.
            SessionRole::Server if reset => return Err(RuntimeError::NetplayActive),
            _ => {}
        }
        if !matches!(self.movie, MovieState::Idle) {
            return Err(RuntimeError::MovieActive);
        }
        let start = if reset {
            self.apply_reset(ResetKind::PowerOn);
            MovieStart::PowerOn
        } else {
            MovieStart::Snapshot(self.store.capture(self.ctx.machine.as_ref(), self.frame)?)
        };
        let header = MovieHeader::new(self.ctx.rom.as_ref(), start);
        info!(path = %path.display(), reset, "movie recording started");
        self.movie = MovieState::Recording(MovieRecorder::new(path, header));
        self.recorded_reset = None;
        self.state.recording.store(true, Ordering::Release);
        self.bus.publish(NotificationEvent::RecordingStarted);
        Ok(())
    }

    fn finish_playback(&mut self) {
        if let MovieState::Playing(player) = mem::replace(&mut self.movie, MovieState::Idle) {
            self.state.playing.store(false, Ordering::Release);
            info!(frames = player.position(), "movie playback finished");
            self.bus.publish(NotificationEvent::PlaybackFinished);
        }
    }

    /// Stop whatever movie is active; a recording is written out.
    fn finish_movie(&mut self) -> Result<(), RuntimeError> {
        self.recorded_reset = None;
        match mem::replace(&mut self.movie, MovieState::Idle) {
            MovieState::Recording(recorder) => {
                self.state.recording.store(false, Ordering::Release);
                let res = recorder.finish();
                self.bus.publish(NotificationEvent::RecordingStopped);
                res?;
            }
            MovieState::Playing(player) => {
                self.state.playing.store(false, Ordering::Release);
                info!(frames = player.position(), "movie playback stopped");
            }
            MovieState::Idle => {}
        }
        Ok(())
    }

    fn set_rom(&mut self, rom: Option<RomInfo>) {
        info!(rom = rom.as_ref().map(|r| r.name.as_str()).unwrap_or("-"), "rom identity set");
        self.store.set_rom(rom.clone());
        self.ctx.rom = rom;
    }
}
