/// Magic bytes at the beginning of every packet.
pub const MAGIC: [u8; 2] = *b"EP";

/// Wire-format protocol version.
/// Bump this only for breaking changes to the header layout or message formats.
pub const VERSION: u8 = 1;

/// Fixed header length in bytes (wire format).
pub const HEADER_LEN: usize = 18;

/// TCP framing prefix length in bytes.
///
/// Each packet is framed as `[u32 frame_len_le][Header][Payload]`, where
/// `frame_len_le` is the length of `[Header][Payload]`.
pub const TCP_LEN_PREFIX: usize = 4;
