use emuplay_core::{
    AudioSink, IdleInput, InputPoller, Machine, NullAudio, NullRenderer, Renderer, RomInfo,
};

/// Everything the runner thread drives. Handed over by
/// [`Runtime::initialize`](crate::Runtime::initialize) and returned by
/// [`Runtime::release`](crate::Runtime::release).
pub struct EmulationContext {
    pub machine: Box<dyn Machine>,
    pub renderer: Box<dyn Renderer>,
    pub audio: Box<dyn AudioSink>,
    pub input: Box<dyn InputPoller>,
    pub rom: Option<RomInfo>,
}

impl EmulationContext {
    /// A context with no video, no audio and idle pads.
    pub fn new(machine: impl Machine + 'static) -> Self {
        Self {
            machine: Box::new(machine),
            renderer: Box::new(NullRenderer),
            audio: Box::new(NullAudio),
            input: Box::new(IdleInput),
            rom: None,
        }
    }

    pub fn with_renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn with_audio(mut self, audio: impl AudioSink + 'static) -> Self {
        self.audio = Box::new(audio);
        self
    }

    pub fn with_input(mut self, input: impl InputPoller + 'static) -> Self {
        self.input = Box::new(input);
        self
    }

    pub fn with_rom(mut self, rom: RomInfo) -> Self {
        self.rom = Some(rom);
        self
    }
}
