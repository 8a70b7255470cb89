//! Capture files written by the record disk thread.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::EngineError;

/// An open-for-write 32-bit float WAV file.
pub struct CaptureFile {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
    channels: usize,
    frames_written: u64,
}

impl CaptureFile {
    /// Create `path`, replacing any existing file.
    pub fn create(
        path: impl AsRef<Path>,
        channels: usize,
        sample_rate: u32,
    ) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let capture_error = |reason: String| EngineError::Capture {
            path: path.to_path_buf(),
            reason,
        };
        let channels_u16 = u16::try_from(channels)
            .ok()
            .filter(|channels| *channels > 0)
            .ok_or_else(|| capture_error(format!("unsupported channel count {}", channels)))?;
        let spec = WavSpec {
            channels: channels_u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer =
            WavWriter::create(path, spec).map_err(|err| capture_error(err.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            channels,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Append interleaved frames.
    pub fn write(&mut self, interleaved: &[f32]) -> Result<(), EngineError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for sample in interleaved {
            writer.write_sample(*sample)?;
        }
        self.frames_written += (interleaved.len() / self.channels) as u64;
        Ok(())
    }

    /// Push buffered data to disk and update the header so the file is
    /// readable up to this point.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Write the final header and close the file.
    pub fn finalize(&mut self) -> Result<(), EngineError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl Drop for CaptureFile {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.finalize() {
                log::warn!("failed to close capture {}: {}", self.path.display(), err);
            }
        }
    }
}
