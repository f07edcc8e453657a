use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use super::types::{EmulationFlags, EmulationState};

/// Written by the runner thread, read lock-free by every handle.
pub(crate) struct RuntimeState {
    pub(crate) started: AtomicBool,
    pub(crate) flags: AtomicU8,
    pub(crate) frame: AtomicU64,
    pub(crate) connected: AtomicBool,
    pub(crate) server_running: AtomicBool,
    pub(crate) playing: AtomicBool,
    pub(crate) recording: AtomicBool,
}

impl RuntimeState {
    pub(crate) fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            flags: AtomicU8::new(0),
            frame: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            server_running: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            recording: AtomicBool::new(false),
        }
    }

    pub(crate) fn flags(&self) -> EmulationFlags {
        EmulationFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn insert_flags(&self, flags: EmulationFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: EmulationFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn emulation_state(&self) -> EmulationState {
        if !self.started.load(Ordering::Acquire) {
            EmulationState::Stopped
        } else if self.flags().contains(EmulationFlags::PAUSED) {
            EmulationState::Paused
        } else {
            EmulationState::Running
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.emulation_state() == EmulationState::Running
    }
}
