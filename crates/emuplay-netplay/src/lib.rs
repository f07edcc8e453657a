//! Lockstep netplay over TCP.
//!
//! One host runs the authoritative simulation and broadcasts the merged input
//! of every frame; clients join by receiving a full snapshot and then apply
//! exactly the host's frame stream. Socket I/O runs on a private tokio
//! runtime; the simulation thread only ever polls bounded queues.

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod server;
pub mod session;
pub mod sync;
mod transport;

pub use config::{ConnectionData, NetplayConfig, PeerIdentity};
pub use error::NetplayError;
pub use session::{InitialSync, NetplaySession, SessionEvent, SessionRole};
