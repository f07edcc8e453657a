use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::reset_kind::ResetKind;

/// Number of controller ports carried by every frame.
pub const PORT_COUNT: usize = 4;

/// Controller bitmasks, one byte per port.
pub type PortMasks = [u8; PORT_COUNT];

/// Standard pad buttons.
///
/// Bit mapping: 0 A, 1 B, 2 Select, 3 Start, 4 Up, 5 Down, 6 Left, 7 Right
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    A = 0,
    B = 1,
    Select = 2,
    Start = 3,
    Up = 4,
    Down = 5,
    Left = 6,
    Right = 7,
}

impl Button {
    #[inline]
    pub const fn mask(self) -> u8 {
        1 << self as u8
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FrameFlags: u8 {
        const RESET = 1 << 0;
        const POWER = 1 << 1;
    }
}

impl FrameFlags {
    pub fn for_reset(kind: ResetKind) -> Self {
        match kind {
            ResetKind::PowerOn => Self::POWER,
            ResetKind::Soft => Self::RESET,
        }
    }

    /// Reset requested by these flags. Power cycling wins over a soft reset.
    pub fn reset_kind(self) -> Option<ResetKind> {
        if self.contains(Self::POWER) {
            Some(ResetKind::PowerOn)
        } else if self.contains(Self::RESET) {
            Some(ResetKind::Soft)
        } else {
            None
        }
    }
}

/// Input applied to one simulated frame.
///
/// `frame` is the index of the frame this input drives; frame `N` runs with
/// the machine in the state produced by frames `0..N`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrame {
    pub frame: u64,
    pub ports: PortMasks,
    pub commands: FrameFlags,
}

impl InputFrame {
    pub fn new(frame: u64, ports: PortMasks) -> Self {
        Self {
            frame,
            ports,
            commands: FrameFlags::empty(),
        }
    }

    pub fn with_commands(mut self, commands: FrameFlags) -> Self {
        self.commands = commands;
        self
    }
}

/// Position of the first counter gap in `frames`, which must start at `first`.
///
/// Returns `(expected, found)` for the first frame that breaks the sequence.
pub fn find_gap(frames: &[InputFrame], first: u64) -> Option<(u64, u64)> {
    frames
        .iter()
        .zip(first..)
        .find(|(f, expected)| f.frame != *expected)
        .map(|(f, expected)| (expected, f.frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_masks_follow_pad_bit_order() {
        assert_eq!(Button::A.mask(), 0x01);
        assert_eq!(Button::Start.mask(), 0x08);
        assert_eq!(Button::Right.mask(), 0x80);
    }

    #[test]
    fn power_flag_takes_priority() {
        let both = FrameFlags::RESET | FrameFlags::POWER;
        assert_eq!(both.reset_kind(), Some(ResetKind::PowerOn));
        assert_eq!(FrameFlags::RESET.reset_kind(), Some(ResetKind::Soft));
        assert_eq!(FrameFlags::empty().reset_kind(), None);
    }

    #[test]
    fn gap_detection_reports_first_break() {
        let frames: Vec<_> = [5, 6, 8, 9]
            .into_iter()
            .map(|n| InputFrame::new(n, [0; PORT_COUNT]))
            .collect();
        assert_eq!(find_gap(&frames, 5), Some((7, 8)));
        assert_eq!(find_gap(&frames[..2], 5), None);
        assert_eq!(find_gap(&frames, 4), Some((4, 5)));
    }
}
