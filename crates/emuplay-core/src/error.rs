use thiserror::Error;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("machine is mid-instruction, no consistent state is available")]
    MidInstruction,

    #[error("state blob is malformed: {0}")]
    Malformed(String),

    #[error("simulation fault: {0}")]
    Fault(String),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("slot {slot} is out of range (0..{count})")]
    InvalidSlot { slot: usize, count: usize },

    #[error("serialization failed: {0}")]
    SerializationFailed(#[source] MachineError),

    #[error("slot {0} is empty")]
    SlotEmpty(usize),

    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error("snapshot format version {found} does not match expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("snapshot was taken with a different ROM")]
    RomMismatch,

    #[error("machine rejected snapshot: {0}")]
    Apply(#[source] MachineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
