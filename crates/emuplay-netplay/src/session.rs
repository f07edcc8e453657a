//! Role-holding netplay session owned by the simulation thread.

use std::collections::VecDeque;
use std::net::SocketAddr;

use emuplay_core::{FrameFlags, InputFrame, ResetKind};
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::{
    client::{Client, ClientEvent},
    config::{ConnectionData, NetplayConfig, PeerIdentity},
    error::NetplayError,
    server::{Server, ServerEvent},
    sync::{INPUT_HORIZON_SLACK, InputMerger},
};

pub use crate::client::InitialSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Inactive,
    Server,
    Client,
}

/// What happened on the network since the last [`NetplaySession::poll`].
#[derive(Debug)]
pub enum SessionEvent {
    /// A peer finished its handshake and needs a snapshot via
    /// [`NetplaySession::send_snapshot`] before it can follow frames.
    PeerJoined(PeerIdentity),
    PeerLeft { peer_id: u32, reason: String },
    /// Client input arrived after its target frame had already run.
    InputDropped { peer_id: u32, frame: u64 },
    ResetRequested { peer_id: u32, kind: ResetKind },
    /// The host replaced the whole state; load it before the next frame.
    StateReplaced { frame: u64, data: Vec<u8> },
    /// The client session ended; local input is authoritative again.
    Disconnected { reason: String },
}

struct ClientState {
    client: Client,
    frames: VecDeque<InputFrame>,
    /// Counter the next received frame must carry.
    expected: u64,
    max_backlog: usize,
}

enum Role {
    Inactive,
    Server {
        server: Server,
        merger: InputMerger,
        pending_reset: Option<ResetKind>,
    },
    Client(ClientState),
}

pub struct NetplaySession {
    config: NetplayConfig,
    io: Runtime,
    role: Role,
}

impl NetplaySession {
    pub fn new(config: NetplayConfig) -> Result<Self, NetplayError> {
        let io = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("netplay-io")
            .enable_all()
            .build()?;
        Ok(Self {
            config,
            io,
            role: Role::Inactive,
        })
    }

    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    pub fn role(&self) -> SessionRole {
        match self.role {
            Role::Inactive => SessionRole::Inactive,
            Role::Server { .. } => SessionRole::Server,
            Role::Client(_) => SessionRole::Client,
        }
    }

    /// A client with a live host, or a host with at least one peer.
    pub fn is_connected(&self) -> bool {
        match &self.role {
            Role::Inactive => false,
            Role::Server { server, .. } => server.peer_count() > 0,
            Role::Client(_) => true,
        }
    }

    pub fn is_server_running(&self) -> bool {
        matches!(self.role, Role::Server { .. })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Server { server, .. } => Some(server.local_addr()),
            _ => None,
        }
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        match &self.role {
            Role::Server { server, .. } => server.peers(),
            _ => Vec::new(),
        }
    }

    /// Start hosting. Starting an already running host is a no-op.
    pub fn start_server(&mut self, port: u16) -> Result<SocketAddr, NetplayError> {
        match &self.role {
            Role::Server { server, .. } => return Ok(server.local_addr()),
            Role::Client(_) => return Err(NetplayError::AlreadyActive("client")),
            Role::Inactive => {}
        }
        let server = Server::start(&self.io, port, self.config.clone())?;
        let addr = server.local_addr();
        self.role = Role::Server {
            server,
            merger: InputMerger::new(u64::from(self.config.input_delay) + INPUT_HORIZON_SLACK),
            pending_reset: None,
        };
        Ok(addr)
    }

    pub fn stop_server(&mut self) {
        if let Role::Server { server, .. } = &self.role {
            server.stop();
            self.role = Role::Inactive;
        }
    }

    /// Join a host. Blocks until the initial state arrives or the handshake
    /// deadline passes; the caller must load the returned state before
    /// running the next frame.
    pub fn connect(&mut self, data: ConnectionData) -> Result<InitialSync, NetplayError> {
        match self.role {
            Role::Inactive => {}
            Role::Server { .. } => return Err(NetplayError::AlreadyActive("server")),
            Role::Client(_) => return Err(NetplayError::AlreadyActive("client")),
        }
        let (client, sync) = Client::connect(&self.io, data, &self.config)?;
        self.role = Role::Client(ClientState {
            client,
            frames: VecDeque::new(),
            expected: sync.frame,
            max_backlog: self.config.max_frame_backlog,
        });
        Ok(sync)
    }

    pub fn disconnect(&mut self) {
        if let Role::Client(_) = self.role
            && let Role::Client(state) = std::mem::replace(&mut self.role, Role::Inactive)
        {
            state.client.disconnect();
        }
    }

    /// Tear down whichever role is active. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop_server();
        self.disconnect();
    }

    /// Drain network events. `next_frame` is the next frame this side will
    /// run and decides whether client input is late.
    pub fn poll(&mut self, next_frame: u64) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        match &mut self.role {
            Role::Inactive => {}
            Role::Server {
                server,
                merger,
                pending_reset,
            } => {
                for ev in server.poll_events() {
                    match ev {
                        ServerEvent::PeerJoined(identity) => out.push(SessionEvent::PeerJoined(identity)),
                        ServerEvent::PeerLeft {
                            peer_id,
                            port,
                            reason,
                        } => {
                            merger.release_port(port);
                            out.push(SessionEvent::PeerLeft { peer_id, reason });
                        }
                        ServerEvent::Input {
                            peer_id,
                            port,
                            frame,
                            buttons,
                        } => {
                            if let Err(dropped) = merger.accept(port, frame, buttons, next_frame) {
                                warn!(
                                    peer_id,
                                    frame = dropped.frame,
                                    next_frame,
                                    "input outside the schedule window dropped"
                                );
                                out.push(SessionEvent::InputDropped { peer_id, frame });
                            }
                        }
                        ServerEvent::ResetRequested { peer_id, kind } => {
                            info!(peer_id, ?kind, "peer requested reset");
                            *pending_reset = Some(match (*pending_reset, kind) {
                                (Some(ResetKind::PowerOn), _) => ResetKind::PowerOn,
                                (_, kind) => kind,
                            });
                            out.push(SessionEvent::ResetRequested { peer_id, kind });
                        }
                    }
                }
            }
            Role::Client(state) => {
                if let Err(reason) = drain_client(state, &mut out) {
                    warn!(%reason, "leaving netplay session");
                    self.role = Role::Inactive;
                    out.push(SessionEvent::Disconnected { reason });
                }
            }
        }
        out
    }

    /// Queue the join snapshot for a peer announced by
    /// [`SessionEvent::PeerJoined`].
    pub fn send_snapshot(&self, peer_id: u32, frame: u64, data: &[u8]) -> Result<(), NetplayError> {
        match &self.role {
            Role::Server { server, .. } => server.send_snapshot(peer_id, frame, data),
            _ => Err(NetplayError::NotConnected),
        }
    }

    /// Push a replacement state to every peer (host loaded a save slot).
    pub fn resync_all(&self, frame: u64, data: &[u8]) {
        if let Role::Server { server, .. } = &self.role {
            for peer in server.peers() {
                if let Err(e) = server.send_snapshot(peer.peer_id, frame, data) {
                    warn!(peer_id = peer.peer_id, error = %e, "resync failed");
                }
            }
        }
    }

    /// Build, broadcast and return the authoritative frame. Host only.
    pub fn host_frame(&mut self, frame: u64, host_buttons: u8) -> Result<InputFrame, NetplayError> {
        let Role::Server {
            server,
            merger,
            pending_reset,
        } = &mut self.role
        else {
            return Err(NetplayError::NotConnected);
        };
        let commands = pending_reset
            .take()
            .map(FrameFlags::for_reset)
            .unwrap_or_default();
        let input = InputFrame::new(frame, merger.merge(frame, host_buttons)).with_commands(commands);
        server.broadcast(&input)?;
        Ok(input)
    }

    /// Next host frame to apply on a client, in order.
    pub fn next_client_frame(&mut self) -> Option<InputFrame> {
        match &mut self.role {
            Role::Client(state) => state.frames.pop_front(),
            _ => None,
        }
    }

    /// Client frames received but not yet applied.
    pub fn buffered_frames(&self) -> usize {
        match &self.role {
            Role::Client(state) => state.frames.len(),
            _ => 0,
        }
    }

    /// Send local pad state after applying `applied_frame`. Client only.
    pub fn send_local_input(&self, applied_frame: u64, buttons: u8) -> Result<(), NetplayError> {
        match &self.role {
            Role::Client(state) => {
                let target = applied_frame + 1 + u64::from(state.client.input_delay());
                state.client.send_input(target, buttons)
            }
            _ => Err(NetplayError::NotConnected),
        }
    }

    /// Negotiate a reset: the host stamps it into its next frame, a client
    /// asks the host.
    pub fn schedule_reset(&mut self, kind: ResetKind) -> Result<(), NetplayError> {
        match &mut self.role {
            Role::Inactive => Err(NetplayError::NotConnected),
            Role::Server { pending_reset, .. } => {
                if *pending_reset != Some(ResetKind::PowerOn) {
                    *pending_reset = Some(kind);
                }
                Ok(())
            }
            Role::Client(state) => state.client.request_reset(kind),
        }
    }
}

impl Drop for NetplaySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move received client events into the frame queue. `Err` ends the session.
fn drain_client(state: &mut ClientState, out: &mut Vec<SessionEvent>) -> Result<(), String> {
    while let Some(ev) = state.client.try_next_event() {
        match ev {
            ClientEvent::Frame(input) => {
                if input.frame != state.expected {
                    return Err(
                        NetplayError::FrameGap {
                            expected: state.expected,
                            found: input.frame,
                        }
                        .to_string(),
                    );
                }
                if state.frames.len() >= state.max_backlog {
                    return Err(format!(
                        "frame backlog exceeded {} frames",
                        state.max_backlog
                    ));
                }
                state.expected += 1;
                state.frames.push_back(input);
            }
            ClientEvent::Snapshot { frame, data } => {
                state.frames.clear();
                state.expected = frame;
                out.push(SessionEvent::StateReplaced { frame, data });
            }
            ClientEvent::Closed(reason) => return Err(reason),
        }
    }
    Ok(())
}
