//! Transport state polled by the audio callback and driven by the control
//! thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NO_FRAME: u64 = u64::MAX;

/// Run/record state shared with the callback. Only atomics, so the callback
/// can read it without the structural lock.
#[derive(Debug)]
pub struct Transport {
    frame: AtomicU64,
    rolling: AtomicBool,
    roll_requested: AtomicBool,
    recording: AtomicBool,
    punch_out_at: AtomicU64,
    punch_out_due: AtomicBool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            frame: AtomicU64::new(0),
            rolling: AtomicBool::new(false),
            roll_requested: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            punch_out_at: AtomicU64::new(NO_FRAME),
            punch_out_due: AtomicBool::new(false),
        }
    }
}

impl Transport {
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub(crate) fn set_frame(&self, frame: u64) {
        self.frame.store(frame, Ordering::Release);
    }

    pub(crate) fn advance(&self, nframes: usize) {
        self.frame.fetch_add(nframes as u64, Ordering::AcqRel);
    }

    pub fn rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }

    pub(crate) fn set_rolling(&self, rolling: bool) {
        self.rolling.store(rolling, Ordering::Release);
    }

    /// Start was requested but streams are still pre-buffering.
    pub fn roll_requested(&self) -> bool {
        self.roll_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_roll(&self, requested: bool) {
        self.roll_requested.store(requested, Ordering::Release);
    }

    pub fn recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub fn punch_out_frame(&self) -> Option<u64> {
        match self.punch_out_at.load(Ordering::Acquire) {
            NO_FRAME => None,
            frame => Some(frame),
        }
    }

    pub(crate) fn schedule_punch_out(&self, frame: Option<u64>) {
        self.punch_out_due.store(false, Ordering::Release);
        self.punch_out_at
            .store(frame.unwrap_or(NO_FRAME), Ordering::Release);
    }

    /// Called by the callback after a cycle ending at `cycle_end`.
    pub(crate) fn check_punch_out(&self, cycle_end: u64) {
        if let Some(frame) = self.punch_out_frame() {
            if cycle_end >= frame {
                self.punch_out_due.store(true, Ordering::Release);
            }
        }
    }

    /// Clear and return the due punch-out flag.
    pub(crate) fn take_punch_out_due(&self) -> bool {
        self.punch_out_due.swap(false, Ordering::AcqRel)
    }
}

/// A recording range on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchRange {
    pub start: u64,
    pub end: u64,
}

/// Sorted, control-side list of punch ranges.
#[derive(Debug, Clone, Default)]
pub struct PunchRanges {
    ranges: Vec<PunchRange>,
}

impl PunchRanges {
    /// Insert a range; empty or inverted ranges are ignored.
    pub fn add(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let range = PunchRange { start, end };
        let index = self.ranges.partition_point(|r| r.start <= start);
        self.ranges.insert(index, range);
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn ranges(&self) -> &[PunchRange] {
        &self.ranges
    }

    /// First range starting at or after `frame`.
    pub fn next(&self, frame: u64) -> Option<PunchRange> {
        self.ranges.iter().copied().find(|r| r.start >= frame)
    }

    /// Last range starting before `frame`.
    pub fn prev(&self, frame: u64) -> Option<PunchRange> {
        self.ranges.iter().rev().copied().find(|r| r.start < frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_stay_sorted() {
        let mut ranges = PunchRanges::default();
        ranges.add(500, 600);
        ranges.add(100, 200);
        ranges.add(300, 300);
        assert_eq!(
            ranges.ranges(),
            &[
                PunchRange { start: 100, end: 200 },
                PunchRange { start: 500, end: 600 }
            ]
        );
        assert_eq!(ranges.next(150).map(|r| r.start), Some(500));
        assert_eq!(ranges.prev(550).map(|r| r.end), Some(600));
        assert_eq!(ranges.next(700), None);
    }

    #[test]
    fn punch_out_becomes_due_once() {
        let transport = Transport::default();
        transport.schedule_punch_out(Some(1000));
        transport.check_punch_out(512);
        assert!(!transport.take_punch_out_due());
        transport.check_punch_out(1024);
        assert!(transport.take_punch_out_due());
        assert!(!transport.take_punch_out_due());
    }
}
