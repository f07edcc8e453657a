use serde::{Deserialize, Serialize};

/// Authoritative input for one frame, broadcast by the host.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFrame {
    pub frame: u64,
    pub ports: [u8; 4],
    /// `FrameFlags` bits (reset / power).
    pub commands: u8,
}

/// A client's pad state, scheduled for `frame`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInput {
    pub frame: u64,
    pub buttons: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRequest {
    pub power_cycle: bool,
}
