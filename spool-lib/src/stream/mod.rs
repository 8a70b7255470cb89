//! Disk streams: per-track rings fed or drained by a background thread.
//!
//! Each stream owns one ring per channel. The audio callback only touches the
//! ring half it owns plus a few atomics; the disk thread owns the other half
//! and hands it back when it is joined.

mod gate;
mod playback;
mod record;

pub use gate::IoThread;
pub use playback::{PlaybackIo, PlaybackStream};
pub use record::{CaptureSink, RecordIo, RecordStream};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;

/// Lifecycle of a disk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No thread, rings may hold stale data.
    Idle,
    /// Rings and resources are ready but no thread is running.
    Armed,
    /// The disk thread is running.
    Streaming,
}

/// Ring sizing for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Frames per audio period.
    pub period: usize,
    /// Periods the ring can hold.
    pub total_blocks: usize,
    /// Periods moved per disk read or write.
    pub disk_io_blocks: usize,
}

impl StreamGeometry {
    pub fn new(config: &EngineConfig, sample_rate: u32, period: usize, channels: usize) -> Self {
        let period = period.max(1);
        let total_blocks =
            ((f64::from(sample_rate) * f64::from(config.seconds_to_buffer)) / period as f64)
                .floor()
                .max(1.0) as usize;
        let capacity_bytes = total_blocks * period * std::mem::size_of::<f32>();
        let disk_io_blocks = if config.disk_io_kbytes == 0 {
            1
        } else {
            (capacity_bytes * channels.max(1) / (config.disk_io_kbytes * 1024))
                .clamp(1, total_blocks)
        };
        Self {
            period,
            total_blocks,
            disk_io_blocks,
        }
    }

    /// Ring capacity in frames per channel.
    pub fn capacity(&self) -> usize {
        self.total_blocks * self.period
    }

    /// Frames moved per disk read or write.
    pub fn io_frames(&self) -> usize {
        self.disk_io_blocks * self.period
    }
}

/// Fill level, xrun count and state of one stream.
///
/// The side that queues frames adds them after writing the rings and the
/// side that takes them subtracts after reading, so any thread can read the
/// level without the structural lock. The two updates may land in either
/// order; readers clamp to `0..=capacity`.
#[derive(Debug, Default)]
pub struct StreamMeter {
    capacity: AtomicUsize,
    filled: AtomicI64,
    xruns: AtomicU64,
    streaming: AtomicBool,
}

impl StreamMeter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: AtomicUsize::new(capacity),
            ..Self::default()
        })
    }

    /// Frames queued in the rings, per channel.
    pub fn filled(&self) -> usize {
        let capacity = self.capacity.load(Ordering::Relaxed);
        self.filled.load(Ordering::Relaxed).clamp(0, capacity as i64) as usize
    }

    /// Share of the rings that is filled, 0..=100.
    pub fn fill_percent(&self) -> u32 {
        let capacity = self.capacity.load(Ordering::Relaxed);
        (self.filled() * 100 / capacity.max(1)) as u32
    }

    /// Share of the rings that is free, 0..=100.
    pub fn free_percent(&self) -> u32 {
        100 - self.fill_percent()
    }

    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    pub fn streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn queued(&self, frames: usize) {
        self.filled.fetch_add(frames as i64, Ordering::Relaxed);
    }

    pub(crate) fn taken(&self, frames: usize) {
        self.filled.fetch_sub(frames as i64, Ordering::Relaxed);
    }

    pub(crate) fn count_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    /// Rings were emptied.
    pub(crate) fn clear(&self) {
        self.filled.store(0, Ordering::Relaxed);
    }

    /// Rings were emptied or rebuilt with `capacity` frames.
    pub(crate) fn reset(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        self.clear();
    }
}

/// What a track needs to size and run its streams.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub config: EngineConfig,
    pub sample_rate: u32,
    pub period: usize,
}

impl StreamSettings {
    pub fn geometry(&self, channels: usize) -> StreamGeometry {
        StreamGeometry::new(&self.config, self.sample_rate, self.period, channels)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.config.stream_poll_ms.max(1))
    }
}
