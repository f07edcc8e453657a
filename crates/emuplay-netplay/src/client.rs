//! Client role: join a host, receive the initial state, then follow the
//! host's frame stream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use emuplay_core::{FrameFlags, InputFrame, ResetKind};
use emuplay_proto::{
    constants::VERSION,
    limits::TCP_RX_BUFFER_SIZE,
    messages::{
        input::{self as wire, ClientInput, ResetRequest},
        session::{Disconnect, Hello, Reject, Welcome},
        sync::{Ping, Pong, Snapshot},
    },
    msg_id::MsgId,
};
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    runtime::Runtime,
    sync::mpsc::{self, error::TryRecvError, error::TrySendError},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ConnectionData, NetplayConfig},
    error::NetplayError,
    framing::{PacketOwned, TcpFramer},
    transport::{OutboundTx, frame, read_packets, spawn_writer},
};

/// Events the reader task hands to the simulation thread.
#[derive(Debug)]
pub enum ClientEvent {
    Frame(InputFrame),
    /// The host replaced the whole state (e.g. it loaded a save slot).
    Snapshot { frame: u64, data: Vec<u8> },
    Closed(String),
}

/// State received at the end of a successful join.
#[derive(Debug, Clone)]
pub struct InitialSync {
    /// Next frame to run once `data` is loaded.
    pub frame: u64,
    pub data: Vec<u8>,
}

pub struct Client {
    welcome: Welcome,
    server_addr: SocketAddr,
    outbound: OutboundTx,
    events_rx: mpsc::Receiver<ClientEvent>,
    cancel: CancellationToken,
}

impl Client {
    /// Connect, introduce ourselves and wait for the initial snapshot, all
    /// within `config.handshake_timeout`.
    pub fn connect(
        rt: &Runtime,
        data: ConnectionData,
        config: &NetplayConfig,
    ) -> Result<(Self, InitialSync), NetplayError> {
        data.validate()?;
        rt.block_on(async {
            match timeout(config.handshake_timeout, handshake(data, config)).await {
                Ok(res) => res,
                Err(_) => Err(NetplayError::Timeout),
            }
        })
    }

    pub fn peer_id(&self) -> u32 {
        self.welcome.peer_id
    }

    pub fn port(&self) -> u8 {
        self.welcome.port
    }

    pub fn input_delay(&self) -> u8 {
        self.welcome.input_delay
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Next event from the reader task, if any.
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        match self.events_rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(ClientEvent::Closed("reader stopped".to_string()))
            }
        }
    }

    /// Send our pad state for `frame`. Dropped when the socket cannot keep up.
    pub fn send_input(&self, frame_no: u64, buttons: u8) -> Result<(), NetplayError> {
        let bytes = frame(
            self.welcome.peer_id,
            &ClientInput {
                frame: frame_no,
                buttons,
            },
        )?;
        match self.outbound.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(frame = frame_no, "outbound queue full, input dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(NetplayError::NotConnected),
        }
    }

    pub fn request_reset(&self, kind: ResetKind) -> Result<(), NetplayError> {
        let msg = ResetRequest {
            power_cycle: kind == ResetKind::PowerOn,
        };
        self.outbound
            .try_send(frame(self.welcome.peer_id, &msg)?)
            .map_err(|_| NetplayError::ChannelSend)
    }

    /// Say goodbye and close. The writer flushes the goodbye before the
    /// socket goes down.
    pub fn disconnect(self) {
        if let Ok(bytes) = frame(
            self.welcome.peer_id,
            &Disconnect {
                reason: "client left".to_string(),
            },
        ) {
            let _ = self.outbound.try_send(bytes);
        }
        info!(server = %self.server_addr, "left netplay session");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handshake(
    data: ConnectionData,
    config: &NetplayConfig,
) -> Result<(Client, InitialSync), NetplayError> {
    let (host, port, name, avatar) = data.into_parts();
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| NetplayError::ConnectFailed(format!("{host}:{port}: {e}")))?;
    let _ = stream.set_nodelay(true);
    let server_addr = stream.peer_addr()?;

    let (mut read, write) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(config.outbound_queue);
    spawn_writer(write, out_rx);

    let hello = Hello {
        proto_version: VERSION,
        name,
        avatar,
    };
    out_tx
        .send(frame(0, &hello)?)
        .await
        .map_err(|_| NetplayError::ChannelSend)?;

    let mut framer = TcpFramer::new(TCP_RX_BUFFER_SIZE);
    let mut pending = VecDeque::new();

    let welcome: Welcome = loop {
        let packet = next_packet(&mut read, &mut framer, &mut pending).await?;
        match packet.msg_id {
            MsgId::Welcome => break packet.decode()?,
            MsgId::Ping => reply_pong(&packet, &out_tx),
            MsgId::Reject => {
                let reject: Reject = packet.decode()?;
                return Err(NetplayError::Rejected(reject.reason));
            }
            other => {
                return Err(NetplayError::HandshakeFailed(format!(
                    "expected Welcome, got {other:?}"
                )));
            }
        }
    };
    debug!(peer_id = welcome.peer_id, port = welcome.port, "welcomed by host");

    let sync = loop {
        let packet = next_packet(&mut read, &mut framer, &mut pending).await?;
        match packet.msg_id {
            MsgId::Snapshot => {
                let snap: Snapshot = packet.decode()?;
                break InitialSync {
                    frame: snap.frame,
                    data: snap.data,
                };
            }
            MsgId::Ping => reply_pong(&packet, &out_tx),
            MsgId::Disconnect => {
                let msg: Disconnect = packet.decode()?;
                return Err(NetplayError::ConnectionLost(msg.reason));
            }
            other => {
                return Err(NetplayError::HandshakeFailed(format!(
                    "expected Snapshot, got {other:?}"
                )));
            }
        }
    };

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(config.inbound_queue);
    tokio::spawn(reader_loop(
        read,
        framer,
        pending,
        events_tx,
        out_tx.clone(),
        cancel.clone(),
        config.peer_timeout,
    ));

    info!(%server_addr, peer_id = welcome.peer_id, frame = sync.frame, "joined netplay session");
    let client = Client {
        welcome,
        server_addr,
        outbound: out_tx,
        events_rx,
        cancel,
    };
    Ok((client, sync))
}

async fn next_packet(
    read: &mut OwnedReadHalf,
    framer: &mut TcpFramer,
    pending: &mut VecDeque<PacketOwned>,
) -> Result<PacketOwned, NetplayError> {
    loop {
        if let Some(packet) = pending.pop_front() {
            return Ok(packet);
        }
        match read_packets(read, framer).await? {
            Some(packets) => pending.extend(packets),
            None => {
                return Err(NetplayError::ConnectionLost(
                    "host closed the connection during handshake".to_string(),
                ));
            }
        }
    }
}

fn reply_pong(packet: &PacketOwned, out_tx: &OutboundTx) {
    if let Ok(ping) = packet.decode::<Ping>()
        && let Ok(bytes) = frame(0, &Pong { t_ms: ping.t_ms })
    {
        let _ = out_tx.try_send(bytes);
    }
}

fn to_event(packet: &PacketOwned, out_tx: &OutboundTx) -> Result<Option<ClientEvent>, String> {
    match packet.msg_id {
        MsgId::InputFrame => {
            let msg: wire::InputFrame = packet.decode().map_err(|e| e.to_string())?;
            Ok(Some(ClientEvent::Frame(InputFrame {
                frame: msg.frame,
                ports: msg.ports,
                commands: FrameFlags::from_bits_truncate(msg.commands),
            })))
        }
        MsgId::Snapshot => {
            let msg: Snapshot = packet.decode().map_err(|e| e.to_string())?;
            Ok(Some(ClientEvent::Snapshot {
                frame: msg.frame,
                data: msg.data,
            }))
        }
        MsgId::Ping => {
            reply_pong(packet, out_tx);
            Ok(None)
        }
        MsgId::Pong => Ok(None),
        MsgId::Disconnect => {
            let msg: Disconnect = packet.decode().map_err(|e| e.to_string())?;
            Err(format!("host closed the session: {}", msg.reason))
        }
        other => Err(format!("unexpected {other:?} from host")),
    }
}

async fn reader_loop(
    mut read: OwnedReadHalf,
    mut framer: TcpFramer,
    mut pending: VecDeque<PacketOwned>,
    events_tx: mpsc::Sender<ClientEvent>,
    out_tx: OutboundTx,
    cancel: CancellationToken,
    peer_timeout: Duration,
) {
    let reason = 'session: loop {
        while let Some(packet) = pending.pop_front() {
            match to_event(&packet, &out_tx) {
                Ok(Some(ev)) => {
                    if events_tx.send(ev).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(reason) => break 'session reason,
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            res = timeout(peer_timeout, read_packets(&mut read, &mut framer)) => match res {
                Ok(Ok(Some(packets))) => pending.extend(packets),
                Ok(Ok(None)) => break 'session "host closed the connection".to_string(),
                Ok(Err(e)) => break 'session format!("read failed: {e}"),
                Err(_) => break 'session format!("host silent for {peer_timeout:?}"),
            },
        }
    };

    warn!(%reason, "netplay connection closed");
    let _ = events_tx.send(ClientEvent::Closed(reason)).await;
}
