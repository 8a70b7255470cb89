//! Multi-resolution peak cache keyed by source path and chunk size.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::config::PeakCacheConfig;
use crate::io::SourceFile;

use super::build::{build_from_level, build_from_source, merge_groups, summarize_source};
use super::format::{peak_file_path, PeakFile};
use super::retry::RetryBackoff;
use super::streamer::PeakStreamer;
use super::{Peak, PeakOrigin, PeakRead, PeaksError};

type CacheKey = (PathBuf, u32);

struct Inner {
    config: PeakCacheConfig,
    building: Mutex<HashSet<CacheKey>>,
    built: Condvar,
    streaming: Mutex<HashSet<CacheKey>>,
}

/// Builds and serves peak files next to their sources.
///
/// Cloning is cheap; all clones share the same build registry, so concurrent
/// requests for the same `(path, chunksize)` are coalesced into one build.
#[derive(Clone)]
pub struct PeakCache {
    inner: Arc<Inner>,
}

impl PeakCache {
    pub fn new(config: PeakCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                building: Mutex::new(HashSet::new()),
                built: Condvar::new(),
                streaming: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &PeakCacheConfig {
        &self.inner.config
    }

    /// Whether the peak file for `(path, chunksize)` exists and is at least as
    /// new as `path`. A file still being streamed is never current.
    pub fn current(&self, path: &Path, chunksize: u32) -> bool {
        if self.is_streaming(path, chunksize) {
            return false;
        }
        let Ok(peak_meta) = fs::metadata(peak_file_path(path, chunksize)) else {
            return false;
        };
        let Ok(source_meta) = fs::metadata(path) else {
            return false;
        };
        match (peak_meta.modified(), source_meta.modified()) {
            (Ok(peak), Ok(source)) => peak >= source,
            _ => false,
        }
    }

    /// Make sure the peak file for `(path, chunksize)` is current, building it
    /// if needed. Blocks until the build (or one already in flight for the
    /// same key) completes.
    pub fn ensure_built(&self, path: &Path, chunksize: u32) -> Result<(), PeaksError> {
        if chunksize == 0 {
            return Err(PeaksError::InvalidChunksize(chunksize));
        }
        let minimum = self.inner.config.cache_minimum;
        self.build_coalesced(path, chunksize, || {
            let peak_path = peak_file_path(path, chunksize);
            if chunksize != minimum
                && chunksize % minimum == 0
                && self.current(path, minimum)
            {
                let channels = source_channels(path)?;
                build_from_level(
                    &peak_file_path(path, minimum),
                    channels,
                    &peak_path,
                    chunksize,
                )?;
            } else {
                build_from_source(path, &peak_path, chunksize)?;
            }
            Ok(())
        })
    }

    /// Start [`Self::ensure_built`] on a worker thread. Returns `None` when the
    /// file is already current or a build for the key is in flight.
    pub fn ensure_built_async(
        &self,
        path: &Path,
        chunksize: u32,
    ) -> Option<JoinHandle<Result<(), PeaksError>>> {
        if self.current(path, chunksize) || self.is_building(path, chunksize) {
            return None;
        }
        let cache = self.clone();
        let path = path.to_path_buf();
        let spawned = thread::Builder::new()
            .name("peak-builder".to_string())
            .spawn(move || {
                let result = cache.ensure_built(&path, chunksize);
                if let Err(err) = &result {
                    warn!("peak build failed for {}: {}", path.display(), err);
                }
                result
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("failed to spawn peak builder: {}", err);
                None
            }
        }
    }

    /// Build every configured level, the minimum from the source and each
    /// coarser level from the one before it.
    pub fn ensure_all_levels(&self, path: &Path) -> Result<(), PeaksError> {
        let levels = self.inner.config.levels();
        let Some((&first, coarser)) = levels.split_first() else {
            return Ok(());
        };
        self.build_coalesced(path, first, || {
            build_from_source(path, &peak_file_path(path, first), first).map(|_| ())
        })?;

        let channels = source_channels(path)?;
        let mut previous = first;
        for &level in coarser {
            self.build_coalesced(path, level, || {
                build_from_level(
                    &peak_file_path(path, previous),
                    channels,
                    &peak_file_path(path, level),
                    level,
                )
                .map(|_| ())
            })?;
            previous = level;
        }
        Ok(())
    }

    /// Peaks for frames `[start_frame, end_frame)` at `target_chunksize`.
    ///
    /// Uses the coarsest readable level that is not coarser than the target,
    /// merging stored groups as needed. Without one, the source is summarized
    /// directly and a background build of the minimum level is started. The
    /// range is clipped to the length of the source, so a result with fewer
    /// records than requested means "try again later".
    pub fn read(
        &self,
        path: &Path,
        start_frame: u64,
        end_frame: u64,
        target_chunksize: u32,
    ) -> Result<PeakRead, PeaksError> {
        if target_chunksize == 0 {
            return Err(PeaksError::InvalidChunksize(target_chunksize));
        }
        let (channels, length) = source_info(path)?;
        let end_frame = length.map_or(end_frame, |frames| end_frame.min(frames));
        let requested = end_frame
            .saturating_sub(start_frame)
            .div_ceil(u64::from(target_chunksize)) as usize;

        for level in self.inner.config.levels_at_or_below(target_chunksize) {
            if !self.readable(path, level) {
                continue;
            }
            let read = self.read_level(
                path,
                level,
                channels,
                start_frame,
                end_frame,
                target_chunksize,
            );
            match read {
                Ok(peaks) => {
                    return Ok(PeakRead {
                        peaks,
                        channels,
                        chunksize: target_chunksize,
                        requested,
                        origin: PeakOrigin::Cache(level),
                    })
                }
                Err(err) => debug!("peak level {} unreadable: {}", level, err),
            }
        }

        let minimum = self.inner.config.cache_minimum;
        if target_chunksize >= minimum && !self.is_streaming(path, minimum) {
            // Detached: the build registers itself and later reads pick it up.
            drop(self.ensure_built_async(path, minimum));
        }

        let (peaks, channels) = summarize_source(path, start_frame, end_frame, target_chunksize)?;
        Ok(PeakRead {
            peaks,
            channels,
            chunksize: target_chunksize,
            requested,
            origin: PeakOrigin::Source,
        })
    }

    /// [`Self::read`] repeated with `backoff` delays until the result is
    /// complete or the attempts run out. The last result is returned either
    /// way.
    pub fn read_with_retry(
        &self,
        path: &Path,
        start_frame: u64,
        end_frame: u64,
        target_chunksize: u32,
        backoff: &RetryBackoff,
    ) -> Result<PeakRead, PeaksError> {
        let mut delays = backoff.delays();
        loop {
            let result = self.read(path, start_frame, end_frame, target_chunksize)?;
            if !result.is_short() {
                return Ok(result);
            }
            match delays.next() {
                Some(delay) => thread::sleep(delay),
                None => return Ok(result),
            }
        }
    }

    /// Begin streaming minimum-level peaks for a source that is being
    /// written. The file is readable as it grows but stays non-current until
    /// the streamer is finished.
    pub fn streamer(&self, path: &Path, channels: usize) -> Result<PeakStreamer, PeaksError> {
        let chunksize = self.inner.config.cache_minimum;
        self.lock_streaming()
            .insert((path.to_path_buf(), chunksize));
        match PeakStreamer::create(self.clone(), path, channels, chunksize) {
            Ok(streamer) => Ok(streamer),
            Err(err) => {
                self.end_streaming(path, chunksize);
                Err(err)
            }
        }
    }

    pub(crate) fn end_streaming(&self, path: &Path, chunksize: u32) {
        self.lock_streaming().remove(&(path.to_path_buf(), chunksize));
    }

    /// Build the remaining levels of `path` on a worker thread.
    pub(crate) fn build_levels_in_background(&self, path: &Path) {
        let cache = self.clone();
        let path = path.to_path_buf();
        let spawned = thread::Builder::new()
            .name("peak-levels".to_string())
            .spawn(move || {
                if let Err(err) = cache.ensure_all_levels(&path) {
                    warn!("peak levels failed for {}: {}", path.display(), err);
                }
            });
        if let Err(err) = spawned {
            warn!("failed to spawn peak level builder: {}", err);
        }
    }

    fn readable(&self, path: &Path, chunksize: u32) -> bool {
        self.is_streaming(path, chunksize) || self.current(path, chunksize)
    }

    fn read_level(
        &self,
        path: &Path,
        level: u32,
        channels: usize,
        start_frame: u64,
        end_frame: u64,
        target: u32,
    ) -> Result<Vec<Peak>, PeaksError> {
        let mut file = PeakFile::open(&peak_file_path(path, level))?;
        let stored = u64::from(file.chunksize());
        if end_frame <= start_frame {
            return Ok(Vec::new());
        }

        let first = start_frame / stored;
        let last = end_frame.div_ceil(stored);
        let records = file.read_groups(first, last - first, channels)?;
        let available = first + (records.len() / channels) as u64;
        let complete = !self.is_streaming(path, level);

        if stored == u64::from(target) && start_frame % stored == 0 {
            return Ok(records);
        }

        let target = u64::from(target);
        let mut peaks = Vec::new();
        let mut merged = vec![Peak::default(); channels];
        let mut span_start = start_frame;
        while span_start < end_frame {
            let span_end = (span_start + target).min(end_frame);
            let from = span_start / stored;
            let to = span_end.div_ceil(stored);
            if from >= available || (!complete && to > available) {
                break;
            }
            let to = to.min(available);
            let lo = ((from - first) as usize) * channels;
            let hi = ((to - first) as usize) * channels;
            merge_groups(&mut merged, &records[lo..hi], true);
            peaks.extend_from_slice(&merged);
            span_start = span_end;
        }
        Ok(peaks)
    }

    fn build_coalesced<F>(&self, path: &Path, chunksize: u32, build: F) -> Result<(), PeaksError>
    where
        F: FnOnce() -> Result<(), PeaksError>,
    {
        let key = (path.to_path_buf(), chunksize);
        {
            let mut building = self.lock_building();
            while building.contains(&key) {
                building = self
                    .inner
                    .built
                    .wait(building)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if self.current(path, chunksize) {
                return Ok(());
            }
            building.insert(key.clone());
        }

        let result = build();

        self.lock_building().remove(&key);
        self.inner.built.notify_all();
        result
    }

    fn is_building(&self, path: &Path, chunksize: u32) -> bool {
        self.lock_building()
            .contains(&(path.to_path_buf(), chunksize))
    }

    fn is_streaming(&self, path: &Path, chunksize: u32) -> bool {
        self.lock_streaming()
            .contains(&(path.to_path_buf(), chunksize))
    }

    fn lock_building(&self) -> std::sync::MutexGuard<'_, HashSet<CacheKey>> {
        self.inner
            .building
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_streaming(&self) -> std::sync::MutexGuard<'_, HashSet<CacheKey>> {
        self.inner
            .streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn source_channels(path: &Path) -> Result<usize, PeaksError> {
    Ok(SourceFile::open(path)?.channels())
}

/// Channel count and, when known, length in frames.
fn source_info(path: &Path) -> Result<(usize, Option<u64>), PeaksError> {
    let file = SourceFile::open(path)?;
    Ok((file.channels(), file.frames()))
}
