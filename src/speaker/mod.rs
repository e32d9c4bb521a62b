//! Speech output: Kokoro synthesis and audio playback behind narrow traits.
//!
//! - `tts`: text → sentence chunks → phonemes → ONNX inference → f32 audio
//! - `output`: rodio playback and output-device format checks

pub mod output;
pub mod tts;

use output::AudioOutput;
use tts::SpeechEngine;

/// Kokoro produces mono audio at this rate.
pub const SAMPLE_RATE: u32 = 24000;

/// A ready-to-use engine and output device, published once initialization succeeds.
pub struct Speaker {
    pub engine: Box<dyn SpeechEngine>,
    pub output: Box<dyn AudioOutput>,
}

impl Speaker {
    pub fn new(engine: Box<dyn SpeechEngine>, output: Box<dyn AudioOutput>) -> Self {
        Self { engine, output }
    }
}
