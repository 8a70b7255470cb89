//! Engine configuration.
//!
//! Values are normally loaded once at startup from a JSON document. Every
//! field has a default, so a partial document (or `{}`) is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Resolution ladder for on-disk peak files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakCacheConfig {
    /// Smallest chunk size that gets a peak file. Finer requests are served
    /// straight from the source.
    pub cache_minimum: u32,
    /// Number of resolutions built by [`crate::peaks::PeakCache::ensure_all_levels`].
    pub cache_levels: u32,
    /// Powers of two between neighbouring levels.
    pub cache_step: u32,
}

impl Default for PeakCacheConfig {
    fn default() -> Self {
        Self {
            cache_minimum: 256,
            cache_levels: 8,
            cache_step: 1,
        }
    }
}

impl PeakCacheConfig {
    /// Chunk sizes of every cache level, finest first.
    pub fn levels(&self) -> Vec<u32> {
        (0..self.cache_levels)
            .map(|i| self.cache_minimum << (i * self.cache_step))
            .collect()
    }

    /// Configured levels no coarser than `chunksize`, coarsest first. This is
    /// the order in which a reader looks for an existing peak file.
    pub fn levels_at_or_below(&self, chunksize: u32) -> impl Iterator<Item = u32> {
        self.levels()
            .into_iter()
            .rev()
            .filter(move |level| *level <= chunksize)
    }

    /// The coarsest cache level that is not coarser than `chunksize`, or
    /// `None` when `chunksize` is below [`Self::cache_minimum`].
    pub fn nearest_cached_chunksize(&self, chunksize: u32) -> Option<u32> {
        self.levels_at_or_below(chunksize).next()
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.cache_minimum == 0 {
            return Err(EngineError::Config(
                "peaks.cache_minimum must be greater than zero".to_string(),
            ));
        }
        if self.cache_levels == 0 {
            return Err(EngineError::Config(
                "peaks.cache_levels must be greater than zero".to_string(),
            ));
        }
        if self.cache_step == 0 {
            return Err(EngineError::Config(
                "peaks.cache_step must be greater than zero".to_string(),
            ));
        }
        let top_shift = (self.cache_levels - 1) * self.cache_step;
        if top_shift >= 32 || (u64::from(self.cache_minimum) << top_shift) > i32::MAX as u64 {
            return Err(EngineError::Config(
                "peak cache levels overflow the 32-bit chunk size header".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds of audio each disk stream keeps buffered per channel.
    pub seconds_to_buffer: f32,
    /// Rough size of a single disk read/write burst.
    pub disk_io_kbytes: usize,
    /// Where new capture files are created.
    pub capture_dir: PathBuf,
    pub peaks: PeakCacheConfig,
    /// Playback fill (percent) below which a stream still counts as seeking.
    pub seek_ready_percent: u8,
    /// Bounded wait used by background threads between checks.
    pub stream_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seconds_to_buffer: 2.0,
            disk_io_kbytes: 256,
            capture_dir: PathBuf::from("sources"),
            peaks: PeakCacheConfig::default(),
            seek_ready_percent: 50,
            stream_poll_ms: 10,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|err| EngineError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.seconds_to_buffer.is_finite() && self.seconds_to_buffer > 0.0) {
            return Err(EngineError::Config(
                "seconds_to_buffer must be a positive number".to_string(),
            ));
        }
        if self.seek_ready_percent > 100 {
            return Err(EngineError::Config(
                "seek_ready_percent must be within 0..=100".to_string(),
            ));
        }
        self.peaks.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.peaks.cache_minimum, 256);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = EngineConfig::from_json_str(
            r#"{ "seconds_to_buffer": 0.5, "peaks": { "cache_levels": 3 } }"#,
        )
        .expect("config");
        assert_eq!(config.seconds_to_buffer, 0.5);
        assert_eq!(config.peaks.levels(), vec![256, 512, 1024]);
        assert_eq!(config.disk_io_kbytes, 256);
    }

    #[test]
    fn rejects_zero_buffering() {
        let err = EngineConfig::from_json_str(r#"{ "seconds_to_buffer": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn rejects_zero_minimum_chunk() {
        let err =
            EngineConfig::from_json_str(r#"{ "peaks": { "cache_minimum": 0 } }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn nearest_cached_chunksize_searches_downward() {
        let peaks = PeakCacheConfig::default();
        assert_eq!(peaks.nearest_cached_chunksize(256), Some(256));
        assert_eq!(peaks.nearest_cached_chunksize(300), Some(256));
        assert_eq!(peaks.nearest_cached_chunksize(512), Some(512));
        assert_eq!(peaks.nearest_cached_chunksize(1000), Some(512));
        assert_eq!(peaks.nearest_cached_chunksize(255), None);
        assert_eq!(peaks.nearest_cached_chunksize(64), None);
        // Beyond the top level the coarsest stored level is used.
        assert_eq!(peaks.nearest_cached_chunksize(1 << 20), Some(256 << 7));
    }

    #[test]
    fn levels_below_target_are_listed_coarsest_first() {
        let peaks = PeakCacheConfig::default();
        let levels: Vec<u32> = peaks.levels_at_or_below(1024).collect();
        assert_eq!(levels, vec![1024, 512, 256]);
        assert_eq!(peaks.levels_at_or_below(100).count(), 0);
    }
}
