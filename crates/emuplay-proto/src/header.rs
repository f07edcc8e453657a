use crate::{
    constants::{HEADER_LEN, MAGIC, VERSION},
    error::ProtoError,
};

/// Packet header (wire format).
///
/// Fixed size, little-endian integers. Decoding requires the magic, the
/// current `VERSION`, and `buf.len() == HEADER_LEN + payload_len`.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u8,

    /// Message identifier. `decode()` does not validate it; upper layers should.
    pub msg_id: u8,

    /// Per-packet flags. Stored only.
    pub flags: u8,

    /// Server-assigned peer identifier. 0 means "not assigned yet" or "host".
    pub peer_id: u32,

    /// Sender sequence number. Stored only.
    pub seq: u32,

    pub payload_len: u32,
}

impl Header {
    pub const LEN: usize = HEADER_LEN;

    pub fn new(msg_id: u8) -> Self {
        Self {
            version: VERSION,
            msg_id,
            flags: 0,
            peer_id: 0,
            seq: 0,
            payload_len: 0,
        }
    }

    /// Offsets (bytes):
    /// - 0..2   magic
    /// - 2      version
    /// - 3      msg_id
    /// - 4      flags
    /// - 5      reserved (always 0)
    /// - 6..10  peer_id (u32 LE)
    /// - 10..14 seq (u32 LE)
    /// - 14..18 payload_len (u32 LE)
    pub fn encode_into(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.msg_id;
        out[4] = self.flags;
        out[5] = 0; // reserved

        out[6..10].copy_from_slice(&self.peer_id.to_le_bytes());
        out[10..14].copy_from_slice(&self.seq.to_le_bytes());
        out[14..18].copy_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Decode a buffer that contains exactly `[Header][Payload]`.
    pub fn decode(buf: &[u8]) -> Result<(Header, &[u8]), ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::TooShort);
        }
        if buf[0..2] != MAGIC {
            return Err(ProtoError::BadMagic);
        }

        let version = buf[2];
        if version != VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let msg_id = buf[3];
        let flags = buf[4];
        let peer_id = read_u32_le(buf, 6)?;
        let seq = read_u32_le(buf, 10)?;
        let payload_len = read_u32_le(buf, 14)?;

        if buf.len() != HEADER_LEN + payload_len as usize {
            return Err(ProtoError::LengthMismatch);
        }

        let h = Header {
            version,
            msg_id,
            flags,
            peer_id,
            seq,
            payload_len,
        };

        Ok((h, &buf[HEADER_LEN..]))
    }
}

fn read_u32_le(buf: &[u8], start: usize) -> Result<u32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::Header;
    use crate::constants::{HEADER_LEN, MAGIC};

    #[test]
    fn header_encode_offsets_are_locked() {
        let mut h = Header::new(0x12);
        h.flags = 0xA5;
        h.peer_id = 0x11223344;
        h.seq = 0x01020304;
        h.payload_len = 0x3344;

        let mut buf = [0u8; HEADER_LEN];
        h.encode_into(&mut buf);

        assert_eq!(&buf[0..2], &MAGIC);
        assert_eq!(buf[2], h.version);
        assert_eq!(buf[3], 0x12);
        assert_eq!(buf[4], 0xA5);
        assert_eq!(buf[5], 0);
        assert_eq!(&buf[6..10], &0x11223344u32.to_le_bytes());
        assert_eq!(&buf[10..14], &0x01020304u32.to_le_bytes());
        assert_eq!(&buf[14..18], &0x3344u32.to_le_bytes());
        assert_eq!(buf.len(), Header::LEN);
    }

    #[test]
    fn header_decode_requires_exact_total_length() {
        let mut h = Header::new(1);
        h.payload_len = 3;

        let mut packet = vec![0u8; HEADER_LEN + 3];
        let mut hbuf = [0u8; HEADER_LEN];
        h.encode_into(&mut hbuf);
        packet[..HEADER_LEN].copy_from_slice(&hbuf);
        packet[HEADER_LEN..].copy_from_slice(&[1, 2, 3]);

        let (decoded, payload) = Header::decode(&packet).unwrap();
        assert_eq!(decoded.payload_len, 3);
        assert_eq!(payload, &[1, 2, 3]);

        let mut too_long = packet.clone();
        too_long.push(9);
        assert!(Header::decode(&too_long).is_err());
        assert!(Header::decode(&packet[..packet.len() - 1]).is_err());
    }

    #[test]
    fn header_decode_rejects_other_versions() {
        let mut hbuf = [0u8; HEADER_LEN];
        Header::new(1).encode_into(&mut hbuf);
        hbuf[2] = 7;
        assert!(matches!(
            Header::decode(&hbuf),
            Err(crate::error::ProtoError::UnsupportedVersion(7))
        ));
    }
}
