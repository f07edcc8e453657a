//! A small deterministic [`Machine`] for tests, tooling and the headless host.
//!
//! The state is a scrambled RAM page driven by an xorshift generator seeded
//! from the pad bytes, so any divergence in input order shows up in the hash
//! within a frame or two.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::MachineError,
    input::{PORT_COUNT, PortMasks},
    machine::Machine,
    reset_kind::ResetKind,
};

const RAM_LEN: usize = 64;
const POWER_ON_SEED: u64 = 0x9E37_79B9_7F4A_7C15;
const SAMPLES_PER_FRAME: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DemoState {
    frames: u64,
    seed: u64,
    ram: Vec<u8>,
    last_ports: PortMasks,
    soft_resets: u32,
}

impl Default for DemoState {
    fn default() -> Self {
        Self {
            frames: 0,
            seed: POWER_ON_SEED,
            ram: vec![0; RAM_LEN],
            last_ports: [0; PORT_COUNT],
            soft_resets: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemoMachine {
    state: DemoState,
    format_version: u32,
    mid_instruction: bool,
    audio: Vec<f32>,
}

impl Default for DemoMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoMachine {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self::with_format_version(Self::FORMAT_VERSION)
    }

    pub fn with_format_version(format_version: u32) -> Self {
        Self {
            state: DemoState::default(),
            format_version,
            mid_instruction: false,
            audio: Vec::new(),
        }
    }

    /// Simulate being stopped between two halves of an instruction.
    pub fn set_mid_instruction(&mut self, mid_instruction: bool) {
        self.mid_instruction = mid_instruction;
    }

    /// Frames run since the last power cycle.
    pub fn frames(&self) -> u64 {
        self.state.frames
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.state.seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.seed = x;
        x
    }
}

impl Machine for DemoMachine {
    fn run_frame(&mut self, ports: &PortMasks) -> Result<(), MachineError> {
        for (port, &mask) in ports.iter().enumerate() {
            self.state.seed ^= u64::from(mask) << (port * 8);
            let r = self.next_random();
            let idx = (r % RAM_LEN as u64) as usize;
            self.state.ram[idx] = self.state.ram[idx].wrapping_add(mask ^ (r >> 56) as u8);
        }
        self.state.last_ports = *ports;
        self.state.frames += 1;

        for i in 0..SAMPLES_PER_FRAME {
            let b = self.state.ram[(self.state.frames as usize + i) % RAM_LEN];
            self.audio.push(f32::from(b) / 255.0 - 0.5);
        }
        Ok(())
    }

    fn reset(&mut self, kind: ResetKind) {
        debug!(?kind, frames = self.state.frames, "demo machine reset");
        match kind {
            ResetKind::PowerOn => self.state = DemoState::default(),
            ResetKind::Soft => {
                self.state.frames = 0;
                self.state.soft_resets += 1;
                self.state.seed ^= u64::from(self.state.soft_resets);
            }
        }
        self.audio.clear();
    }

    fn save_state(&self) -> Result<Vec<u8>, MachineError> {
        if self.mid_instruction {
            return Err(MachineError::MidInstruction);
        }
        postcard::to_stdvec(&self.state).map_err(|e| MachineError::Malformed(e.to_string()))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), MachineError> {
        let state: DemoState =
            postcard::from_bytes(data).map_err(|e| MachineError::Malformed(e.to_string()))?;
        if state.ram.len() != RAM_LEN {
            return Err(MachineError::Malformed(format!(
                "ram page is {} bytes, expected {RAM_LEN}",
                state.ram.len()
            )));
        }
        self.state = state;
        self.audio.clear();
        Ok(())
    }

    fn state_format_version(&self) -> u32 {
        self.format_version
    }

    fn drain_audio(&mut self, out: &mut Vec<f32>) {
        out.append(&mut self.audio);
    }
}
