use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::{error::MachineError, input::PortMasks, reset_kind::ResetKind};

/// The deterministic simulation driven one frame at a time.
///
/// Given identical state and identical inputs, every implementation must
/// produce byte-identical state; netplay and movie playback both rely on it.
pub trait Machine: Send {
    /// Advance the simulation by exactly one frame.
    fn run_frame(&mut self, ports: &PortMasks) -> Result<(), MachineError>;

    /// Reinitialize the simulation.
    fn reset(&mut self, kind: ResetKind);

    /// Serialize the full simulation state.
    ///
    /// Fails with [`MachineError::MidInstruction`] when no consistent state
    /// can be produced right now.
    fn save_state(&self) -> Result<Vec<u8>, MachineError>;

    /// Replace the full simulation state. On error the machine is unchanged.
    fn load_state(&mut self, data: &[u8]) -> Result<(), MachineError>;

    /// Layout version of the blobs produced by [`Machine::save_state`].
    fn state_format_version(&self) -> u32;

    /// Move audio produced since the last call into `out`.
    fn drain_audio(&mut self, out: &mut Vec<f32>) {
        let _ = out;
    }
}

/// Identity of the loaded program. Loading itself happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomInfo {
    pub path: PathBuf,
    pub name: String,
    /// SHA-1 of the ROM image.
    pub hash: [u8; 20],
}

impl RomInfo {
    pub fn from_image(path: impl Into<PathBuf>, image: &[u8]) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rom".to_string());
        let hash: [u8; 20] = Sha1::digest(image).into();
        Self { path, name, hash }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
