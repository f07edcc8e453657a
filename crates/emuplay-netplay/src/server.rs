//! Host role: accept peers, admit them with a handshake and fan the
//! authoritative frame stream out to every synced peer.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use emuplay_core::{InputFrame, ResetKind, snapshot::unix_millis};
use emuplay_proto::{
    constants::VERSION,
    limits::{MAX_AVATAR_LEN, MAX_NAME_LEN, TCP_RX_BUFFER_SIZE},
    messages::{
        input::{self as wire, ClientInput, ResetRequest},
        session::{Disconnect, Hello, Reject, RejectReason, Welcome},
        sync::{Ping, Pong, Snapshot},
    },
    msg_id::MsgId,
};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    runtime::Runtime,
    sync::mpsc::{self, error::TrySendError},
    time::{interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{NetplayConfig, PeerIdentity},
    error::NetplayError,
    framing::{PacketOwned, TcpFramer},
    transport::{OutboundTx, frame, read_packets, spawn_writer},
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Network events delivered to the simulation thread.
#[derive(Debug)]
pub enum ServerEvent {
    /// Handshake done; the peer waits for its snapshot.
    PeerJoined(PeerIdentity),
    PeerLeft {
        peer_id: u32,
        port: u8,
        reason: String,
    },
    Input {
        peer_id: u32,
        port: u8,
        frame: u64,
        buttons: u8,
    },
    ResetRequested {
        peer_id: u32,
        kind: ResetKind,
    },
}

struct PeerSlot {
    identity: PeerIdentity,
    outbound: OutboundTx,
    cancel: CancellationToken,
    /// Set once the snapshot is queued; only synced peers get frames.
    synced: bool,
    last_seen: Instant,
}

struct ServerShared {
    config: NetplayConfig,
    peers: Mutex<BTreeMap<u32, PeerSlot>>,
    next_peer_id: AtomicU32,
    events_tx: mpsc::Sender<ServerEvent>,
}

impl ServerShared {
    fn touch(&self, peer_id: u32) {
        if let Some(slot) = self.peers.lock().get_mut(&peer_id) {
            slot.last_seen = Instant::now();
        }
    }

    /// Assign an id and a free controller port, or say why not.
    fn admit(
        &self,
        hello: Hello,
        addr: SocketAddr,
        outbound: &OutboundTx,
        cancel: &CancellationToken,
    ) -> Result<PeerIdentity, RejectReason> {
        if hello.proto_version != VERSION {
            return Err(RejectReason::UnsupportedVersion);
        }
        if hello.name.is_empty() || hello.name.len() > MAX_NAME_LEN {
            return Err(RejectReason::MalformedHandshake);
        }
        if hello.avatar.len() > MAX_AVATAR_LEN {
            return Err(RejectReason::AvatarTooLarge);
        }

        let mut peers = self.peers.lock();
        let port = (1..=self.config.max_peers)
            .find(|p| peers.values().all(|slot| slot.identity.port != *p))
            .ok_or(RejectReason::ServerFull)?;

        let identity = PeerIdentity {
            peer_id: self.next_peer_id.fetch_add(1, Ordering::Relaxed),
            port,
            name: hello.name,
            avatar: hello.avatar,
            addr,
        };
        peers.insert(
            identity.peer_id,
            PeerSlot {
                identity: identity.clone(),
                outbound: outbound.clone(),
                cancel: cancel.clone(),
                synced: false,
                last_seen: Instant::now(),
            },
        );
        Ok(identity)
    }
}

pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    shared: Arc<ServerShared>,
    events_rx: mpsc::Receiver<ServerEvent>,
}

impl Server {
    /// Bind and start accepting on `rt`. Port 0 picks an ephemeral port.
    pub fn start(rt: &Runtime, port: u16, config: NetplayConfig) -> Result<Self, NetplayError> {
        let bind = SocketAddr::new(config.bind_ip, port);
        let listener = rt.block_on(TcpListener::bind(bind)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetplayError::PortInUse(port)
            } else {
                NetplayError::BindFailed(format!("{bind}: {e}"))
            }
        })?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::channel(config.inbound_queue);
        let shared = Arc::new(ServerShared {
            config,
            peers: Mutex::new(BTreeMap::new()),
            next_peer_id: AtomicU32::new(1),
            events_tx,
        });
        let shutdown = CancellationToken::new();

        rt.spawn(accept_loop(listener, Arc::clone(&shared), shutdown.clone()));
        rt.spawn(liveness_loop(Arc::clone(&shared), shutdown.clone()));

        info!(%local_addr, "netplay host listening");
        Ok(Self {
            local_addr,
            shutdown,
            shared,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drain everything the network side produced since the last call.
    pub fn poll_events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events_rx.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Queue a full state for `peer_id` and include it in the frame stream
    /// from now on.
    pub fn send_snapshot(&self, peer_id: u32, frame_no: u64, data: &[u8]) -> Result<(), NetplayError> {
        let bytes = frame(
            0,
            &Snapshot {
                frame: frame_no,
                data: data.to_vec(),
            },
        )?;
        let mut peers = self.shared.peers.lock();
        let slot = peers.get_mut(&peer_id).ok_or(NetplayError::NotConnected)?;
        match slot.outbound.try_send(bytes) {
            Ok(()) => {
                slot.synced = true;
                debug!(peer_id, frame = frame_no, len = data.len(), "snapshot queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(peer_id, "peer stalled before snapshot, dropping");
                slot.cancel.cancel();
                Err(NetplayError::ConnectionLost("peer stalled".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(NetplayError::ConnectionLost("peer gone".to_string()))
            }
        }
    }

    /// Send the authoritative frame to every synced peer. Returns how many
    /// peers it was queued for.
    pub fn broadcast(&self, input: &InputFrame) -> Result<usize, NetplayError> {
        let bytes = frame(
            0,
            &wire::InputFrame {
                frame: input.frame,
                ports: input.ports,
                commands: input.commands.bits(),
            },
        )?;
        let peers = self.shared.peers.lock();
        let mut sent = 0;
        for (peer_id, slot) in peers.iter().filter(|(_, s)| s.synced) {
            match slot.outbound.try_send(bytes.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(peer_id, frame = input.frame, "peer stalled, dropping");
                    slot.cancel.cancel();
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(sent)
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.shared
            .peers
            .lock()
            .values()
            .map(|slot| slot.identity.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Close the listener and every peer connection. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Ok(bytes) = frame(0, &Disconnect { reason: "host stopped".to_string() }) {
            for slot in self.shared.peers.lock().values() {
                let _ = slot.outbound.try_send(bytes.clone());
            }
        }
        self.shutdown.cancel();
        self.shared.peers.lock().clear();
        info!(local_addr = %self.local_addr, "netplay host stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, shutdown: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        debug!(%addr, "incoming connection");
        tokio::spawn(handle_connection(
            stream,
            addr,
            Arc::clone(&shared),
            shutdown.child_token(),
        ));
    }
    debug!("accept loop stopped");
}

/// Ping every peer and drop the ones that went quiet.
async fn liveness_loop(shared: Arc<ServerShared>, shutdown: CancellationToken) {
    let mut tick = interval(shared.config.keepalive_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        let Ok(ping) = frame(0, &Ping { t_ms: unix_millis() }) else {
            continue;
        };
        let now = Instant::now();
        for (peer_id, slot) in shared.peers.lock().iter() {
            if now.duration_since(slot.last_seen) > shared.config.peer_timeout {
                warn!(peer_id, "peer timed out");
                slot.cancel.cancel();
                continue;
            }
            let _ = slot.outbound.try_send(ping.clone());
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut read, write) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(shared.config.outbound_queue);
    let writer = spawn_writer(write, out_rx);
    let mut framer = TcpFramer::new(TCP_RX_BUFFER_SIZE);

    let handshake = tokio::select! {
        _ = cancel.cancelled() => None,
        res = timeout(shared.config.handshake_timeout, read_hello(&mut read, &mut framer)) => Some(res),
    };

    let admitted = match handshake {
        None => None,
        Some(Err(_)) => {
            warn!(%addr, "handshake timed out");
            None
        }
        Some(Ok(Err(e))) => {
            warn!(%addr, error = %e, "malformed handshake");
            reject(&out_tx, RejectReason::MalformedHandshake).await;
            None
        }
        Some(Ok(Ok((hello, rest)))) => match shared.admit(hello, addr, &out_tx, &cancel) {
            Ok(identity) => Some((identity, rest)),
            Err(reason) => {
                info!(%addr, ?reason, "peer rejected");
                reject(&out_tx, reason).await;
                None
            }
        },
    };

    if let Some((identity, rest)) = admitted {
        let peer_id = identity.peer_id;
        let port = identity.port;
        info!(peer_id, port, name = %identity.name, %addr, "peer joined");

        let welcome = Welcome {
            peer_id,
            port,
            input_delay: shared.config.input_delay,
        };
        let welcomed = match frame(peer_id, &welcome) {
            Ok(bytes) => out_tx.send(bytes).await.is_ok(),
            Err(_) => false,
        };
        let reason = if !welcomed {
            "failed to send welcome".to_string()
        } else if shared
            .events_tx
            .send(ServerEvent::PeerJoined(identity))
            .await
            .is_err()
        {
            "host session closed".to_string()
        } else {
            peer_loop(&mut read, &mut framer, rest, &shared, peer_id, port, &out_tx, &cancel).await
        };

        shared.peers.lock().remove(&peer_id);
        info!(peer_id, %reason, "peer left");
        let _ = shared
            .events_tx
            .send(ServerEvent::PeerLeft {
                peer_id,
                port,
                reason,
            })
            .await;
    }

    drop(out_tx);
    let abort = writer.abort_handle();
    if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
}

async fn read_hello(
    read: &mut OwnedReadHalf,
    framer: &mut TcpFramer,
) -> Result<(Hello, VecDeque<PacketOwned>), NetplayError> {
    loop {
        let Some(packets) = read_packets(read, framer).await? else {
            return Err(NetplayError::ConnectionLost(
                "closed during handshake".to_string(),
            ));
        };
        let mut packets = VecDeque::from(packets);
        if let Some(first) = packets.pop_front() {
            let hello = first.decode::<Hello>()?;
            return Ok((hello, packets));
        }
    }
}

async fn reject(out_tx: &OutboundTx, reason: RejectReason) {
    if let Ok(bytes) = frame(0, &Reject { reason }) {
        let _ = out_tx.send(bytes).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn peer_loop(
    read: &mut OwnedReadHalf,
    framer: &mut TcpFramer,
    mut pending: VecDeque<PacketOwned>,
    shared: &ServerShared,
    peer_id: u32,
    port: u8,
    out_tx: &OutboundTx,
    cancel: &CancellationToken,
) -> String {
    loop {
        while let Some(packet) = pending.pop_front() {
            shared.touch(peer_id);
            if let Err(reason) = handle_packet(packet, shared, peer_id, port, out_tx).await {
                return reason;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return "disconnected by host".to_string(),
            res = read_packets(read, framer) => match res {
                Ok(Some(packets)) => pending.extend(packets),
                Ok(None) => return "peer closed connection".to_string(),
                Err(e) => return format!("read failed: {e}"),
            },
        }
    }
}

async fn handle_packet(
    packet: PacketOwned,
    shared: &ServerShared,
    peer_id: u32,
    port: u8,
    out_tx: &OutboundTx,
) -> Result<(), String> {
    let event = match packet.msg_id {
        MsgId::ClientInput => {
            let msg: ClientInput = packet.decode().map_err(|e| e.to_string())?;
            ServerEvent::Input {
                peer_id,
                port,
                frame: msg.frame,
                buttons: msg.buttons,
            }
        }
        MsgId::ResetRequest => {
            let msg: ResetRequest = packet.decode().map_err(|e| e.to_string())?;
            let kind = if msg.power_cycle {
                ResetKind::PowerOn
            } else {
                ResetKind::Soft
            };
            ServerEvent::ResetRequested { peer_id, kind }
        }
        MsgId::Ping => {
            let msg: Ping = packet.decode().map_err(|e| e.to_string())?;
            if let Ok(bytes) = frame(0, &Pong { t_ms: msg.t_ms }) {
                let _ = out_tx.try_send(bytes);
            }
            return Ok(());
        }
        MsgId::Pong => return Ok(()),
        MsgId::Disconnect => {
            let msg: Disconnect = packet.decode().map_err(|e| e.to_string())?;
            return Err(format!("peer left: {}", msg.reason));
        }
        other => return Err(format!("unexpected {other:?} from peer")),
    };

    shared
        .events_tx
        .send(event)
        .await
        .map_err(|_| "host session closed".to_string())
}
