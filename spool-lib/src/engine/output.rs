//! Play the engine's mixed output through the default audio device.

use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use rodio::source::SeekError;
use rodio::{OutputStream, OutputStreamBuilder, Source};

use super::process::ProcessHandle;
use crate::error::EngineError;

const OUTPUT_STREAM_OPEN_RETRIES: usize = 3;
const OUTPUT_STREAM_OPEN_RETRY_MS: u64 = 100;

/// Pulls one period at a time from the engine.
struct EngineSource {
    handle: ProcessHandle,
    buffer: Vec<f32>,
    position: usize,
    period: usize,
    channels: u16,
    sample_rate: u32,
}

impl Iterator for EngineSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.buffer.len() {
            self.handle
                .process_mixed(self.period, &mut self.buffer, usize::from(self.channels));
            self.position = 0;
        }
        let sample = self.buffer.get(self.position).copied();
        self.position += 1;
        sample
    }
}

impl Source for EngineSource {
    fn current_span_len(&self) -> Option<usize> {
        Some(self.buffer.len().saturating_sub(self.position))
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }

    fn try_seek(&mut self, _pos: Duration) -> Result<(), SeekError> {
        Err(SeekError::NotSupported {
            underlying_source: "EngineSource",
        })
    }
}

/// Keeps the device stream open while the engine plays through it.
pub struct RodioOutput {
    _stream: OutputStream,
}

impl RodioOutput {
    /// Open the default device and start pulling `period`-frame cycles.
    pub fn open(
        handle: ProcessHandle,
        channels: u16,
        sample_rate: u32,
        period: usize,
    ) -> Result<Self, EngineError> {
        let mut last_err = None;
        for attempt in 1..=OUTPUT_STREAM_OPEN_RETRIES {
            match OutputStreamBuilder::open_default_stream() {
                Ok(stream) => {
                    let channels = channels.max(1);
                    let period = period.max(1);
                    stream.mixer().add(EngineSource {
                        handle,
                        buffer: vec![0.0; period * usize::from(channels)],
                        position: usize::MAX,
                        period,
                        channels,
                        sample_rate,
                    });
                    info!("engine output on default device, {} channels", channels);
                    return Ok(Self { _stream: stream });
                }
                Err(err) => {
                    warn!(
                        "open_default_stream attempt {}/{} failed: {}",
                        attempt, OUTPUT_STREAM_OPEN_RETRIES, err
                    );
                    last_err = Some(err.to_string());
                    thread::sleep(Duration::from_millis(OUTPUT_STREAM_OPEN_RETRY_MS));
                }
            }
        }
        let reason = last_err.unwrap_or_default();
        error!("failed to open default output stream: {}", reason);
        Err(EngineError::Stream(reason))
    }
}
