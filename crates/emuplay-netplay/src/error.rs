//! Netplay error types.

use emuplay_proto::{error::ProtoError, messages::session::RejectReason};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetplayError {
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("failed to bind listener: {0}")]
    BindFailed(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("rejected by host: {0:?}")]
    Rejected(RejectReason),

    #[error("timed out waiting for the host")]
    Timeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("frame gap: expected {expected}, got {found}")]
    FrameGap { expected: u64, found: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("session already active as {0}")]
    AlreadyActive(&'static str),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error")]
    ChannelSend,
}
