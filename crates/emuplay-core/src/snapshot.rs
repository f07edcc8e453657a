//! Versioned snapshot container.
//!
//! Wire/file layout:
//! - 0..4  magic `EPSS`
//! - 4..6  container version (u16 LE)
//! - 6..   postcard-encoded [`Snapshot`]
//!
//! The container is the same for save slots on disk and for the state pushed
//! to a joining netplay peer.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{
    error::{MachineError, SnapshotError},
    machine::Machine,
};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"EPSS";
pub const CONTAINER_VERSION: u16 = 1;
const PREFIX_LEN: usize = SNAPSHOT_MAGIC.len() + 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Layout version reported by the machine that produced the blob.
    pub format_version: u32,
    /// Frame counter at capture time.
    pub frame: u64,
    /// Wall clock at capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// CRC-32 of the state blob.
    pub checksum: u32,
    pub rom_hash: Option<[u8; 20]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn capture(
        machine: &dyn Machine,
        frame: u64,
        rom_hash: Option<[u8; 20]>,
    ) -> Result<Self, SnapshotError> {
        let data = machine
            .save_state()
            .map_err(SnapshotError::SerializationFailed)?;
        let meta = SnapshotMeta {
            format_version: machine.state_format_version(),
            frame,
            timestamp_ms: unix_millis(),
            checksum: crc32fast::hash(&data),
            rom_hash,
        };
        Ok(Self { meta, data })
    }

    pub fn checksum_ok(&self) -> bool {
        crc32fast::hash(&self.data) == self.meta.checksum
    }

    /// Copy this snapshot into `machine` after compatibility checks.
    ///
    /// The machine is untouched when any check fails.
    pub fn apply_to(
        &self,
        machine: &mut dyn Machine,
        rom_hash: Option<[u8; 20]>,
    ) -> Result<(), SnapshotError> {
        let expected = machine.state_format_version();
        if self.meta.format_version != expected {
            return Err(SnapshotError::VersionMismatch {
                expected,
                found: self.meta.format_version,
            });
        }
        if let (Some(ours), Some(theirs)) = (rom_hash, self.meta.rom_hash)
            && ours != theirs
        {
            return Err(SnapshotError::RomMismatch);
        }
        if !self.checksum_ok() {
            return Err(SnapshotError::Corrupt("checksum mismatch".to_string()));
        }
        machine.load_state(&self.data).map_err(SnapshotError::Apply)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let body = postcard::to_stdvec(self)
            .map_err(|e| SnapshotError::SerializationFailed(MachineError::Malformed(e.to_string())))?;
        let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a container and verify the blob checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < PREFIX_LEN {
            return Err(SnapshotError::Corrupt("container too short".to_string()));
        }
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Corrupt("bad magic".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CONTAINER_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: u32::from(CONTAINER_VERSION),
                found: u32::from(version),
            });
        }
        let snapshot: Snapshot = postcard::from_bytes(&bytes[PREFIX_LEN..])
            .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        if !snapshot.checksum_ok() {
            return Err(SnapshotError::Corrupt("checksum mismatch".to_string()));
        }
        Ok(snapshot)
    }
}

/// SHA-1 of a serialized machine state, used to compare peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash(pub [u8; 20]);

impl StateHash {
    pub fn of(state: &[u8]) -> Self {
        Self(Sha1::digest(state).into())
    }

    pub fn of_machine(machine: &dyn Machine) -> Result<Self, MachineError> {
        machine.save_state().map(|s| Self::of(&s))
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({self})")
    }
}

/// Wall-clock milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::demo::DemoMachine;

    fn captured() -> Snapshot {
        let mut machine = DemoMachine::new();
        for n in 0..10u8 {
            machine.run_frame(&[n, 0, 0, 0]).unwrap();
        }
        Snapshot::capture(&machine, 10, None).unwrap()
    }

    #[test]
    fn container_prefix_is_locked() {
        let bytes = captured().encode().unwrap();
        assert_eq!(&bytes[0..4], b"EPSS");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), CONTAINER_VERSION);
    }

    #[test]
    fn future_container_version_is_a_version_mismatch() {
        let mut bytes = captured().encode().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(SnapshotError::VersionMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn mid_instruction_capture_fails() {
        let mut machine = DemoMachine::new();
        machine.set_mid_instruction(true);
        assert!(matches!(
            Snapshot::capture(&machine, 0, None),
            Err(SnapshotError::SerializationFailed(MachineError::MidInstruction))
        ));
    }

    #[test]
    fn apply_rejects_other_layout_and_leaves_machine_alone() {
        let snapshot = captured();
        let mut target = DemoMachine::with_format_version(2);
        let before = StateHash::of_machine(&target).unwrap();

        assert!(matches!(
            snapshot.apply_to(&mut target, None),
            Err(SnapshotError::VersionMismatch {
                expected: 2,
                found: 1
            })
        ));
        assert_eq!(StateHash::of_machine(&target).unwrap(), before);
    }

    #[test]
    fn apply_rejects_other_rom() {
        let mut snapshot = captured();
        snapshot.meta.rom_hash = Some([1; 20]);
        let mut target = DemoMachine::new();
        assert!(matches!(
            snapshot.apply_to(&mut target, Some([2; 20])),
            Err(SnapshotError::RomMismatch)
        ));
        assert!(snapshot.apply_to(&mut target, None).is_ok());
    }

    proptest! {
        #[test]
        fn flipped_blob_byte_is_detected(idx in any::<prop::sample::Index>(), bit in 0u8..8) {
            let mut snapshot = captured();
            let i = idx.index(snapshot.data.len());
            snapshot.data[i] ^= 1 << bit;
            let bytes = snapshot.encode().unwrap();
            let decoded = Snapshot::decode(&bytes);
            prop_assert!(matches!(decoded, Err(SnapshotError::Corrupt(_))));
        }
    }
}
