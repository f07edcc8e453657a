pub mod bus;
pub mod context;
pub mod movie;
pub mod runtime;
pub mod snapshot_store;

pub use bus::{ListenerError, ListenerHandle, NotificationBus, NotificationEvent, NotificationListener};
pub use context::EmulationContext;
pub use movie::{Movie, MovieError, MovieHeader, MoviePlayer, MovieRecorder, MovieStart};
pub use runtime::{
    EmulationFlags, EmulationState, Pacing, Runtime, RuntimeConfig, RuntimeError, RuntimeHandle,
};
pub use snapshot_store::{SnapshotStore, SnapshotStoreConfig};
