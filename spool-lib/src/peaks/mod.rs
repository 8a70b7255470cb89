//! Waveform peak files and the cache that builds and serves them.
//!
//! A peak file summarizes a source at one resolution: for every `chunksize`
//! frames it stores a `{min, max}` record per channel. Several resolutions
//! of the same source live side by side (see [`peak_file_path`]).

mod build;
mod cache;
mod error;
mod format;
mod retry;
mod streamer;

pub use cache::PeakCache;
pub use error::PeaksError;
pub use format::peak_file_path;
pub use retry::RetryBackoff;
pub use streamer::PeakStreamer;

/// Sample extrema over one chunk of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Peak {
    pub min: f32,
    pub max: f32,
}

/// Where the records of a [`PeakRead`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakOrigin {
    /// A peak file at the given chunk size.
    Cache(u32),
    /// Computed from the source samples.
    Source,
}

/// Result of [`PeakCache::read`].
#[derive(Debug, Clone)]
pub struct PeakRead {
    /// Records, channels interleaved per chunk.
    pub peaks: Vec<Peak>,
    pub channels: usize,
    pub chunksize: u32,
    /// Records per channel that the request covers.
    pub requested: usize,
    pub origin: PeakOrigin,
}

impl PeakRead {
    /// Records per channel actually returned.
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.peaks.len() / self.channels
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Fewer records than requested: the caller should retry later.
    pub fn is_short(&self) -> bool {
        self.len() < self.requested
    }

    /// Record for chunk `index` of `channel`.
    pub fn get(&self, index: usize, channel: usize) -> Option<Peak> {
        if channel >= self.channels {
            return None;
        }
        self.peaks.get(index * self.channels + channel).copied()
    }
}
