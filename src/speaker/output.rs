//! Audio output through rodio, with a cpal capability check.

use std::sync::{Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::mixer::Mixer;
use rodio::{OutputStreamBuilder, Sink};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("output device {device} cannot play {channels} channel(s) at {sample_rate} Hz")]
    UnsupportedFormat {
        device: String,
        channels: u16,
        sample_rate: u32,
    },
    #[error("failed to open audio output: {0}")]
    Stream(String),
    #[error("failed to query output device: {0}")]
    Query(String),
}

/// Audio playback capability.
pub trait AudioOutput: Send + Sync {
    /// Start playing `samples`; returns without waiting.
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), OutputError>;

    /// Block until the most recent `play` has finished.
    fn wait(&self);

    /// Fail unless the device can take f32 audio with this layout.
    fn validate_output_format(&self, channels: u16, sample_rate: u32) -> Result<(), OutputError>;
}

pub struct RodioOutput {
    mixer: Mixer,
    // Starting a new buffer replaces (and so stops) the previous one.
    sink: Mutex<Option<Sink>>,
}

impl RodioOutput {
    /// Open the default output stream.
    pub fn open() -> Result<Self, OutputError> {
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| OutputError::Stream(e.to_string()))?;
        let mixer = stream.mixer().clone();
        // Sinks only play while the stream is alive; keep it for the rest of the process.
        std::mem::forget(stream);
        info!("Audio output opened");

        Ok(Self {
            mixer,
            sink: Mutex::new(None),
        })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), OutputError> {
        let sink = Sink::connect_new(&self.mixer);
        sink.append(SamplesBuffer::new(1, sample_rate, samples));
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn wait(&self) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sink) = sink {
            sink.sleep_until_end();
        }
    }

    fn validate_output_format(&self, channels: u16, sample_rate: u32) -> Result<(), OutputError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(OutputError::NoDevice)?;
        let name = device.name().unwrap_or_else(|_| "unknown".into());

        let configs = device
            .supported_output_configs()
            .map_err(|e| OutputError::Query(e.to_string()))?;

        // The mixer converts sample format and channel count, so the device
        // only has to reach the rate with at least as many channels.
        let supported = configs.into_iter().any(|range| {
            range.channels() >= channels
                && range.min_sample_rate().0 <= sample_rate
                && sample_rate <= range.max_sample_rate().0
        });

        if supported {
            debug!("Output device {name} accepts {channels}ch f32 @ {sample_rate} Hz");
            Ok(())
        } else {
            Err(OutputError::UnsupportedFormat {
                device: name,
                channels,
                sample_rate,
            })
        }
    }
}
