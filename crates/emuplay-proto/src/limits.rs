//! Message size limits for the netplay protocol.

use crate::{constants::HEADER_LEN, msg_id::MsgId};

/// Maximum payload size for control messages (4 KB).
pub const MAX_CONTROL_PAYLOAD: usize = 4 * 1024;

/// Maximum payload size for data messages (4 MB).
///
/// Data messages carry state snapshots and the handshake avatar.
pub const MAX_DATA_PAYLOAD: usize = 4 * 1024 * 1024;

/// Largest avatar payload accepted in a handshake.
pub const MAX_AVATAR_LEN: usize = 64 * 1024;

/// Longest display name accepted in a handshake, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum TCP frame size (header + payload).
pub const MAX_TCP_FRAME: usize = HEADER_LEN + MAX_DATA_PAYLOAD;

/// Initial TCP receive buffer size.
pub const TCP_RX_BUFFER_SIZE: usize = 64 * 1024;

#[inline]
pub const fn is_data_message(msg_id: MsgId) -> bool {
    matches!(msg_id, MsgId::Hello | MsgId::Snapshot)
}

#[inline]
pub const fn max_payload_for(msg_id: MsgId) -> usize {
    if is_data_message(msg_id) {
        MAX_DATA_PAYLOAD
    } else {
        MAX_CONTROL_PAYLOAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_and_snapshot_use_large_limit() {
        assert_eq!(max_payload_for(MsgId::Snapshot), MAX_DATA_PAYLOAD);
        assert!(max_payload_for(MsgId::Hello) > MAX_AVATAR_LEN + MAX_NAME_LEN);
    }

    #[test]
    fn per_frame_messages_use_small_limit() {
        assert!(!is_data_message(MsgId::InputFrame));
        assert!(!is_data_message(MsgId::ClientInput));
        assert_eq!(max_payload_for(MsgId::Ping), MAX_CONTROL_PAYLOAD);
    }
}
