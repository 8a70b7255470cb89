//! The audio server the engine runs against.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::track::LatencyRange;

/// What the engine needs to know about the device driving its callback.
pub trait AudioServer: Send + Sync {
    fn sample_rate(&self) -> u32;
    /// Frames per callback.
    fn period_frames(&self) -> usize;
    fn playback_latency(&self) -> LatencyRange;
    fn capture_latency(&self) -> LatencyRange;
    /// Rendering faster than real time; the callback may block on disk.
    fn freewheeling(&self) -> bool;
}

/// A server driven by hand, for offline rendering and tests.
#[derive(Debug)]
pub struct OfflineServer {
    sample_rate: u32,
    period: AtomicUsize,
    latency: Mutex<(LatencyRange, LatencyRange)>,
    freewheeling: AtomicBool,
}

impl OfflineServer {
    pub fn new(sample_rate: u32, period: usize) -> Self {
        Self {
            sample_rate,
            period: AtomicUsize::new(period.max(1)),
            latency: Mutex::new((LatencyRange::default(), LatencyRange::default())),
            freewheeling: AtomicBool::new(false),
        }
    }

    pub fn with_latency(self, playback: LatencyRange, capture: LatencyRange) -> Self {
        self.set_latency(playback, capture);
        self
    }

    pub fn set_latency(&self, playback: LatencyRange, capture: LatencyRange) {
        if let Ok(mut latency) = self.latency.lock() {
            *latency = (playback, capture);
        }
    }

    /// Only changes what the server reports; call
    /// [`crate::engine::Engine::set_period`] to resize the streams.
    pub fn set_period(&self, period: usize) {
        self.period.store(period.max(1), Ordering::Release);
    }

    pub fn set_freewheeling(&self, freewheeling: bool) {
        self.freewheeling.store(freewheeling, Ordering::Release);
    }

    fn latency(&self) -> (LatencyRange, LatencyRange) {
        self.latency
            .lock()
            .map(|latency| *latency)
            .unwrap_or_default()
    }
}

impl AudioServer for OfflineServer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn period_frames(&self) -> usize {
        self.period.load(Ordering::Acquire)
    }

    fn playback_latency(&self) -> LatencyRange {
        self.latency().0
    }

    fn capture_latency(&self) -> LatencyRange {
        self.latency().1
    }

    fn freewheeling(&self) -> bool {
        self.freewheeling.load(Ordering::Acquire)
    }
}
