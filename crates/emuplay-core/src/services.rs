//! External collaborators the controller calls into every frame.

use std::path::Path;

use crate::input::{PORT_COUNT, PortMasks};

pub trait Renderer: Send {
    /// Present the frame buffer produced by the frame that just ran.
    fn render(&mut self, frame: u64);

    /// Capture the current frame buffer; `rom_path` names the active ROM.
    fn take_screenshot(&mut self, rom_path: &Path);

    fn set_show_fps(&mut self, show: bool) {
        let _ = show;
    }
}

pub trait AudioSink: Send {
    fn submit(&mut self, samples: &[f32]);

    /// Drop queued audio (pause, state load, reset).
    fn clear(&mut self) {}
}

pub trait InputPoller: Send {
    /// Sample local devices for frame `frame`.
    fn poll(&mut self, frame: u64) -> PortMasks;
}

impl<F> InputPoller for F
where
    F: FnMut(u64) -> PortMasks + Send,
{
    fn poll(&mut self, frame: u64) -> PortMasks {
        self(frame)
    }
}

#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _frame: u64) {}

    fn take_screenshot(&mut self, _rom_path: &Path) {}
}

#[derive(Debug, Default)]
pub struct NullAudio;

impl AudioSink for NullAudio {
    fn submit(&mut self, _samples: &[f32]) {}
}

/// Input source that never presses anything.
#[derive(Debug, Default)]
pub struct IdleInput;

impl InputPoller for IdleInput {
    fn poll(&mut self, _frame: u64) -> PortMasks {
        [0; PORT_COUNT]
    }
}
