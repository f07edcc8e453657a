use crate::{
    constants::{HEADER_LEN, TCP_LEN_PREFIX},
    error::ProtoError,
    header::Header,
    limits::{MAX_TCP_FRAME, max_payload_for},
    messages::Message,
    msg_id::MsgId,
    packet::PacketView,
};

/// Encode a message into a length-prefixed TCP frame.
///
/// The payload limit is selected from the message type.
pub fn encode_message<T: Message>(payload: &T) -> Result<Vec<u8>, ProtoError> {
    encode_message_from(0, payload)
}

/// Like [`encode_message`] but stamps the sender's peer id into the header.
pub fn encode_message_from<T: Message>(peer_id: u32, payload: &T) -> Result<Vec<u8>, ProtoError> {
    let msg_id = T::msg_id();

    let payload_bytes = postcard::to_stdvec(payload)?;
    if payload_bytes.len() > max_payload_for(msg_id) {
        return Err(ProtoError::PayloadTooLarge(payload_bytes.len()));
    }

    let mut header = Header::new(msg_id as u8);
    header.peer_id = peer_id;
    header.payload_len = payload_bytes.len() as u32;

    let frame_len = HEADER_LEN + payload_bytes.len();
    if frame_len > MAX_TCP_FRAME {
        return Err(ProtoError::FrameTooLarge(frame_len));
    }

    let mut out = Vec::with_capacity(TCP_LEN_PREFIX + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_le_bytes());

    let mut hbuf = [0u8; HEADER_LEN];
    header.encode_into(&mut hbuf);
    out.extend_from_slice(&hbuf);
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Decode as many complete frames as `in_buf` holds.
///
/// Returns the packets and the number of bytes consumed; trailing partial
/// frames are left for the next call.
pub fn try_decode_tcp_frames<'a>(
    in_buf: &'a [u8],
) -> Result<(Vec<PacketView<'a>>, usize), ProtoError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    loop {
        let Some(len_bytes) = in_buf.get(offset..offset + TCP_LEN_PREFIX) else {
            break;
        };
        let frame_len = u32::from_le_bytes(
            len_bytes
                .try_into()
                .map_err(|_| ProtoError::TooShort)?,
        ) as usize;

        if frame_len < HEADER_LEN {
            return Err(ProtoError::LengthMismatch);
        }
        if frame_len > MAX_TCP_FRAME {
            return Err(ProtoError::FrameTooLarge(frame_len));
        }

        let total_needed = TCP_LEN_PREFIX + frame_len;
        if in_buf.len().saturating_sub(offset) < total_needed {
            break;
        }

        let frame = &in_buf[offset + TCP_LEN_PREFIX..offset + total_needed];
        let (h, payload) = Header::decode(frame)?;
        let msg = MsgId::from_repr(h.msg_id).ok_or(ProtoError::UnknownMsgId(h.msg_id))?;
        if payload.len() > max_payload_for(msg) {
            return Err(ProtoError::PayloadTooLarge(payload.len()));
        }

        frames.push(PacketView::new(h, msg, payload));
        offset += total_needed;
    }

    Ok((frames, offset))
}

/// Decode a payload, checking that the packet carries `T`.
pub fn decode_payload<T: Message>(msg_id: MsgId, payload: &[u8]) -> Result<T, ProtoError> {
    if msg_id != T::msg_id() {
        return Err(ProtoError::UnexpectedMessage {
            expected: T::msg_id(),
            found: msg_id,
        });
    }
    Ok(postcard::from_bytes(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        input::ClientInput,
        session::{Hello, Welcome},
        sync::Ping,
    };

    #[test]
    fn partial_frames_are_left_in_buffer() {
        let a = encode_message(&Ping { t_ms: 1 }).unwrap();
        let b = encode_message(&ClientInput {
            frame: 42,
            buttons: 0x81,
        })
        .unwrap();

        let mut buf = a.clone();
        buf.extend_from_slice(&b[..b.len() - 1]);

        let (frames, consumed) = try_decode_tcp_frames(&buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_id, MsgId::Ping);
        assert_eq!(consumed, a.len());

        buf.push(*b.last().unwrap());
        let (frames, consumed) = try_decode_tcp_frames(&buf[consumed..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(consumed, b.len());
        let input: ClientInput = decode_payload(frames[0].msg_id, frames[0].payload).unwrap();
        assert_eq!(input.frame, 42);
    }

    #[test]
    fn sender_id_is_stamped() {
        let bytes = encode_message_from(7, &Ping { t_ms: 0 }).unwrap();
        let (frames, _) = try_decode_tcp_frames(&bytes).unwrap();
        assert_eq!(frames[0].header.peer_id, 7);
    }

    #[test]
    fn hello_carries_length_prefixed_avatar() {
        let hello = Hello {
            proto_version: 1,
            name: "P2".to_string(),
            avatar: vec![0xAB; 300],
        };
        let bytes = encode_message(&hello).unwrap();
        let (frames, _) = try_decode_tcp_frames(&bytes).unwrap();
        let decoded: Hello = decode_payload(frames[0].msg_id, frames[0].payload).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn wrong_message_type_is_rejected() {
        let bytes = encode_message(&Ping { t_ms: 0 }).unwrap();
        let (frames, _) = try_decode_tcp_frames(&bytes).unwrap();
        let res = decode_payload::<Welcome>(frames[0].msg_id, frames[0].payload);
        assert!(matches!(res, Err(ProtoError::UnexpectedMessage { .. })));
    }

    #[test]
    fn unknown_msg_id_is_an_error() {
        let mut bytes = encode_message(&Ping { t_ms: 0 }).unwrap();
        bytes[TCP_LEN_PREFIX + 3] = 0xEE;
        assert!(matches!(
            try_decode_tcp_frames(&bytes),
            Err(ProtoError::UnknownMsgId(0xEE))
        ));
    }

    #[test]
    fn oversized_length_prefix_is_refused_before_buffering() {
        let bogus = ((MAX_TCP_FRAME + 1) as u32).to_le_bytes();
        assert!(matches!(
            try_decode_tcp_frames(&bogus),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn control_payload_limit_applies_on_decode() {
        let mut header = Header::new(MsgId::Ping as u8);
        let payload = vec![0u8; crate::limits::MAX_CONTROL_PAYLOAD + 1];
        header.payload_len = payload.len() as u32;
        let mut hbuf = [0u8; HEADER_LEN];
        header.encode_into(&mut hbuf);

        let mut bytes = ((HEADER_LEN + payload.len()) as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&hbuf);
        bytes.extend_from_slice(&payload);
        assert!(matches!(
            try_decode_tcp_frames(&bytes),
            Err(ProtoError::PayloadTooLarge(_))
        ));
    }
}
