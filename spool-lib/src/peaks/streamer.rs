use std::path::{Path, PathBuf};

use log::debug;

use super::build::PeakAccumulator;
use super::cache::PeakCache;
use super::format::{peak_file_path, PeakWriter};
use super::{Peak, PeaksError};

/// Writes minimum-level peaks while their source is still being recorded.
///
/// Created through [`PeakCache::streamer`]. Readers can use the growing file
/// as a prefix; [`PeakCache::current`] keeps reporting it stale until
/// [`PeakStreamer::finish`], which also schedules the coarser levels.
pub struct PeakStreamer {
    cache: PeakCache,
    source: PathBuf,
    chunksize: u32,
    channels: usize,
    writer: Option<PeakWriter>,
    accumulator: PeakAccumulator,
    scratch: Vec<Peak>,
}

impl PeakStreamer {
    pub(crate) fn create(
        cache: PeakCache,
        source: &Path,
        channels: usize,
        chunksize: u32,
    ) -> Result<Self, PeaksError> {
        if channels == 0 {
            return Err(PeaksError::InvalidFormat(
                "cannot stream peaks for zero channels".to_string(),
            ));
        }
        let writer = PeakWriter::create_in_place(&peak_file_path(source, chunksize), chunksize)?;
        Ok(Self {
            cache,
            source: source.to_path_buf(),
            chunksize,
            channels,
            writer: Some(writer),
            accumulator: PeakAccumulator::new(channels, chunksize as usize),
            scratch: Vec::new(),
        })
    }

    pub fn chunksize(&self) -> u32 {
        self.chunksize
    }

    /// Fold newly captured interleaved frames into the peak file.
    pub fn write(&mut self, interleaved: &[f32]) -> Result<(), PeaksError> {
        self.accumulator.push_frames(interleaved, &mut self.scratch);
        if self.scratch.is_empty() {
            return Ok(());
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.push(&self.scratch)?;
            writer.flush()?;
        }
        self.scratch.clear();
        Ok(())
    }

    /// Write the trailing partial chunk, close the file and mark it current.
    pub fn finish(mut self) -> Result<(), PeaksError> {
        self.accumulator.flush_partial(&mut self.scratch);
        let result = match self.writer.take() {
            Some(mut writer) => writer.push(&self.scratch).and_then(|_| writer.commit()),
            None => Ok(()),
        };
        self.cache.end_streaming(&self.source, self.chunksize);
        if result.is_ok() {
            debug!("peak stream closed for {}", self.source.display());
            self.cache.build_levels_in_background(&self.source);
        }
        result
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl Drop for PeakStreamer {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.cache.end_streaming(&self.source, self.chunksize);
        }
    }
}
