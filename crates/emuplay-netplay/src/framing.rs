use bytes::{Buf, Bytes, BytesMut};
use emuplay_proto::{
    codec::{decode_payload, try_decode_tcp_frames},
    error::ProtoError,
    header::Header,
    messages::Message,
    msg_id::MsgId,
};

/// A single decoded packet that owns its payload bytes.
/// This is safe to move across tasks/channels.
#[derive(Debug, Clone)]
pub struct PacketOwned {
    pub header: Header,
    pub msg_id: MsgId,
    pub payload: Bytes,
}

impl PacketOwned {
    pub fn decode<T: Message>(&self) -> Result<T, ProtoError> {
        decode_payload(self.msg_id, &self.payload)
    }
}

/// Receive-side TCP framing:
/// - keeps an internal receive buffer (`BytesMut`)
/// - decodes as many frames as possible
/// - returns owned packets and keeps the remaining bytes for the next read
pub struct TcpFramer {
    buf: BytesMut,
}

impl TcpFramer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    /// Mutable access to the receive buffer for socket reads.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Decode every complete frame and drop the consumed bytes.
    pub fn drain_packets(&mut self) -> Result<Vec<PacketOwned>, ProtoError> {
        let (views, consumed) = try_decode_tcp_frames(&self.buf)?;

        // Payloads borrow from `buf`, copy before advancing.
        let out = views
            .into_iter()
            .map(|v| PacketOwned {
                header: v.header,
                msg_id: v.msg_id,
                payload: Bytes::copy_from_slice(v.payload),
            })
            .collect();
        self.buf.advance(consumed);

        Ok(out)
    }
}
