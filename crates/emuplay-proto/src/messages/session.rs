use serde::{Deserialize, Serialize};

/// First message sent by a joining peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub proto_version: u8,
    pub name: String,
    /// Opaque avatar image. Postcard prefixes it with its length.
    pub avatar: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub peer_id: u32,
    /// Controller port driven by this peer (1..=3; the host owns port 0).
    pub port: u8,
    /// Frames between local sampling and the frame the input is scheduled for.
    pub input_delay: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnsupportedVersion,
    MalformedHandshake,
    AvatarTooLarge,
    ServerFull,
    NotReady,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub reason: RejectReason,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}
