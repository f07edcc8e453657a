use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use emuplay_proto::limits::{MAX_AVATAR_LEN, MAX_NAME_LEN};

use crate::error::NetplayError;

pub const DEFAULT_PORT: u16 = 7777;

/// Tunables shared by host and client sessions.
#[derive(Debug, Clone)]
pub struct NetplayConfig {
    /// Address the host listens on.
    pub bind_ip: IpAddr,
    /// Frames between sampling a client pad and the frame it is scheduled for.
    pub input_delay: u8,
    /// Deadline for the whole join: connect, hello, welcome and snapshot.
    pub handshake_timeout: Duration,
    /// Silence after which a peer (or the host, seen from a client) is dropped.
    pub peer_timeout: Duration,
    /// Host keepalive period. Must be well below `peer_timeout`.
    pub keepalive_interval: Duration,
    /// Per-peer outbound queue depth. A peer that lets it fill up is dropped.
    pub outbound_queue: usize,
    /// Network to simulation queue depth.
    pub inbound_queue: usize,
    /// Host frames a client may hold unapplied before it gives up on the
    /// session.
    pub max_frame_backlog: usize,
    /// Remote players accepted by a host (ports 1..=max_peers).
    pub max_peers: u8,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            input_delay: 2,
            handshake_timeout: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(1),
            outbound_queue: 256,
            inbound_queue: 1024,
            max_frame_backlog: 600,
            max_peers: 3,
        }
    }
}

/// Everything needed for one connection attempt.
///
/// Built once per attempt and consumed by [`NetplaySession::connect`].
///
/// [`NetplaySession::connect`]: crate::session::NetplaySession::connect
#[derive(Debug, Clone)]
pub struct ConnectionData {
    host: String,
    port: u16,
    name: String,
    avatar: Vec<u8>,
}

impl ConnectionData {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            avatar: Vec::new(),
        }
    }

    pub fn with_avatar(mut self, avatar: Vec<u8>) -> Self {
        self.avatar = avatar;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn avatar(&self) -> &[u8] {
        &self.avatar
    }

    pub(crate) fn validate(&self) -> Result<(), NetplayError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(NetplayError::HandshakeFailed(format!(
                "display name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }
        if self.avatar.len() > MAX_AVATAR_LEN {
            return Err(NetplayError::HandshakeFailed(format!(
                "avatar is {} bytes, limit is {MAX_AVATAR_LEN}",
                self.avatar.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (String, u16, String, Vec<u8>) {
        (self.host, self.port, self.name, self.avatar)
    }
}

/// A connected remote player as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Unique for the lifetime of one host session.
    pub peer_id: u32,
    /// Controller port driven by this peer.
    pub port: u8,
    pub name: String,
    pub avatar: Vec<u8>,
    pub addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_avatar_is_valid() {
        assert!(ConnectionData::new("127.0.0.1", 7777, "P2").validate().is_ok());
    }

    #[test]
    fn oversized_avatar_is_refused_locally() {
        let data = ConnectionData::new("127.0.0.1", 7777, "P2")
            .with_avatar(vec![0; MAX_AVATAR_LEN + 1]);
        assert!(matches!(
            data.validate(),
            Err(NetplayError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn blank_name_is_refused_locally() {
        assert!(ConnectionData::new("127.0.0.1", 7777, "").validate().is_err());
    }
}
