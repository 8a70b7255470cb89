//! Buffer levels and xrun counts read by control-thread diagnostics.
//!
//! The board holds clones of every stream's [`StreamMeter`], so polling it
//! never touches the structural lock the audio callback tries each cycle.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::stream::StreamMeter;
use crate::track::{TrackId, TrackMeters};

#[derive(Default)]
pub(crate) struct MeterBoard {
    tracks: Mutex<BTreeMap<TrackId, TrackMeters>>,
}

impl MeterBoard {
    /// Replace the meters registered for `id`.
    pub(crate) fn publish(&self, id: TrackId, meters: TrackMeters) {
        self.lock().insert(id, meters);
    }

    pub(crate) fn remove(&self, id: TrackId) {
        self.lock().remove(&id);
    }

    /// Average fill of all playback rings. No playback streams counts as full.
    pub(crate) fn output_buffer_percent(&self) -> u32 {
        let tracks = self.lock();
        average(playback_meters(&tracks).map(StreamMeter::fill_percent))
    }

    /// Average free space of all capture rings. No record streams counts as
    /// fully drained.
    pub(crate) fn input_buffer_percent(&self) -> u32 {
        let tracks = self.lock();
        average(record_meters(&tracks).map(StreamMeter::free_percent))
    }

    pub(crate) fn seek_pending(&self, threshold: u32) -> bool {
        let tracks = self.lock();
        seek_pending(playback_meters(&tracks), threshold)
    }

    pub(crate) fn playback_xruns(&self) -> u64 {
        let tracks = self.lock();
        playback_meters(&tracks).map(StreamMeter::xruns).sum()
    }

    pub(crate) fn capture_xruns(&self) -> u64 {
        let tracks = self.lock();
        record_meters(&tracks).map(StreamMeter::xruns).sum()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TrackId, TrackMeters>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn playback_meters(
    tracks: &BTreeMap<TrackId, TrackMeters>,
) -> impl Iterator<Item = &StreamMeter> {
    tracks.values().filter_map(|meters| meters.playback.as_deref())
}

fn record_meters(tracks: &BTreeMap<TrackId, TrackMeters>) -> impl Iterator<Item = &StreamMeter> {
    tracks.values().filter_map(|meters| meters.record.as_deref())
}

/// Some streaming playback meter is still below `threshold` percent.
pub(crate) fn seek_pending<'a>(
    meters: impl Iterator<Item = &'a StreamMeter>,
    threshold: u32,
) -> bool {
    meters
        .filter(|meter| meter.streaming())
        .any(|meter| meter.fill_percent() < threshold)
}

fn average(values: impl Iterator<Item = u32>) -> u32 {
    let (sum, count) = values.fold((0_u64, 0_u64), |(sum, count), v| (sum + u64::from(v), count + 1));
    if count == 0 {
        100
    } else {
        (sum / count) as u32
    }
}
