//! Host-side merge of remote pad input into the authoritative frame.

use std::collections::BTreeMap;

use emuplay_core::{PORT_COUNT, PortMasks};

/// Frames past `input_delay` a client may schedule ahead of the host.
pub const INPUT_HORIZON_SLACK: u64 = 8;

/// Client input outside the window the host still accepts: its target frame
/// already ran, or it lies beyond the scheduling horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedInput {
    pub port: u8,
    pub frame: u64,
    pub next_frame: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Scheduled {
    ports: PortMasks,
    present: u8,
}

/// Schedules remote input by target frame and holds the last known state of
/// every port when a frame has no fresh input for it.
///
/// Port 0 always belongs to the host.
#[derive(Debug)]
pub struct InputMerger {
    pending: BTreeMap<u64, Scheduled>,
    held: PortMasks,
    horizon: u64,
}

impl InputMerger {
    /// `horizon` bounds how far past the host's next frame input may land.
    pub fn new(horizon: u64) -> Self {
        Self {
            pending: BTreeMap::new(),
            held: [0; PORT_COUNT],
            horizon,
        }
    }

    /// Schedule `buttons` on `port` for `frame`.
    ///
    /// `next_frame` is the next frame the host will run. Input for an older
    /// frame, or for one more than `horizon` frames ahead, is refused.
    pub fn accept(
        &mut self,
        port: u8,
        frame: u64,
        buttons: u8,
        next_frame: u64,
    ) -> Result<(), DroppedInput> {
        if frame < next_frame || frame - next_frame > self.horizon {
            return Err(DroppedInput {
                port,
                frame,
                next_frame,
            });
        }
        let idx = usize::from(port);
        if idx == 0 || idx >= PORT_COUNT {
            return Ok(());
        }
        let slot = self.pending.entry(frame).or_default();
        slot.ports[idx] = buttons;
        slot.present |= 1 << idx;
        Ok(())
    }

    /// Build the port masks for `frame` with the host pad on port 0.
    pub fn merge(&mut self, frame: u64, host: u8) -> PortMasks {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() >= frame {
                break;
            }
            entry.remove();
        }
        if let Some(slot) = self.pending.remove(&frame) {
            for idx in 1..PORT_COUNT {
                if slot.present & (1 << idx) != 0 {
                    self.held[idx] = slot.ports[idx];
                }
            }
        }
        self.held[0] = host;
        self.held
    }

    /// Forget a departed peer's port.
    pub fn release_port(&mut self, port: u8) {
        let idx = usize::from(port);
        if idx == 0 || idx >= PORT_COUNT {
            return;
        }
        self.held[idx] = 0;
        for slot in self.pending.values_mut() {
            slot.present &= !(1 << idx);
            slot.ports[idx] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn input_lands_on_its_target_frame_and_is_held() {
        let mut m = InputMerger::new(8);
        m.accept(1, 3, 0x08, 0).unwrap();

        assert_eq!(m.merge(0, 0x01), [0x01, 0, 0, 0]);
        assert_eq!(m.merge(1, 0x01), [0x01, 0, 0, 0]);
        assert_eq!(m.merge(2, 0x00), [0x00, 0, 0, 0]);
        assert_eq!(m.merge(3, 0x00), [0x00, 0x08, 0, 0]);
        assert_eq!(m.merge(4, 0x00), [0x00, 0x08, 0, 0]);
    }

    #[test]
    fn late_input_is_refused() {
        let mut m = InputMerger::new(8);
        let err = m.accept(2, 4, 0xFF, 5).unwrap_err();
        assert_eq!(
            err,
            DroppedInput {
                port: 2,
                frame: 4,
                next_frame: 5
            }
        );
        assert_eq!(m.merge(5, 0), [0; PORT_COUNT]);
    }

    #[test]
    fn host_port_cannot_be_overridden() {
        let mut m = InputMerger::new(8);
        m.accept(0, 1, 0xFF, 0).unwrap();
        assert_eq!(m.merge(1, 0x02)[0], 0x02);
    }

    #[test]
    fn released_port_goes_idle() {
        let mut m = InputMerger::new(8);
        m.accept(1, 0, 0x10, 0).unwrap();
        m.accept(1, 2, 0x20, 0).unwrap();
        assert_eq!(m.merge(0, 0)[1], 0x10);
        m.release_port(1);
        assert_eq!(m.merge(1, 0)[1], 0);
        assert_eq!(m.merge(2, 0)[1], 0);
    }

    #[test]
    fn input_past_the_horizon_is_refused_without_growing() {
        let mut m = InputMerger::new(4);
        assert!(m.accept(1, 14, 0x01, 10).is_ok());
        for i in 0..10_000u64 {
            let frame = 1_000_000_000 + i;
            assert_eq!(
                m.accept(1, frame, 0x02, 10),
                Err(DroppedInput {
                    port: 1,
                    frame,
                    next_frame: 10
                })
            );
        }
        assert!(m.accept(1, 15, 0x02, 10).is_err());
        assert_eq!(m.pending.len(), 1);
        assert_eq!(m.merge(14, 0)[1], 0x01);
    }

    proptest! {
        #[test]
        fn each_port_follows_its_latest_scheduled_value(
            script in prop::collection::vec((1u8..4, 0u64..32, any::<u8>()), 0..64)
        ) {
            let mut m = InputMerger::new(32);
            for &(port, frame, buttons) in &script {
                m.accept(port, frame, buttons, 0).unwrap();
            }
            let mut expected = [0u8; PORT_COUNT];
            for frame in 0..32u64 {
                for &(port, f, buttons) in &script {
                    if f == frame {
                        expected[usize::from(port)] = buttons;
                    }
                }
                expected[0] = frame as u8;
                prop_assert_eq!(m.merge(frame, frame as u8), expected);
            }
        }
    }
}
