//! Netplay wire protocol.
//!
//! Every packet is `[Header][postcard payload]`; on TCP each packet is
//! prefixed with its length as a little-endian `u32`.

pub mod codec;
pub mod constants;
pub mod error;
pub mod header;
pub mod limits;
pub mod messages;
pub mod msg_id;
pub mod packet;
