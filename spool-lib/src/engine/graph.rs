//! The set of tracks guarded by the structural lock.

use std::collections::BTreeMap;

use super::meters;
use crate::track::{Track, TrackId};

/// Tracks keyed by id, iterated in creation order.
#[derive(Default)]
pub struct TrackGraph {
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

impl TrackGraph {
    /// Reserve the id for a track about to be built.
    pub(crate) fn allocate_id(&mut self) -> TrackId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn insert(&mut self, track: Track) {
        self.tracks.insert(track.id(), track);
    }

    pub(crate) fn remove(&mut self, id: TrackId) -> Option<Track> {
        self.tracks.remove(&id)
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    pub fn any_solo(&self) -> bool {
        self.tracks.values().any(Track::solo)
    }

    /// Some playback stream is still below `threshold` percent after a
    /// locate.
    pub fn seek_pending(&self, threshold: u32) -> bool {
        meters::seek_pending(
            self.iter()
                .filter_map(Track::playback)
                .map(|playback| playback.meter().as_ref()),
            threshold,
        )
    }

    /// Every port can hold a cycle of `nframes`.
    pub fn fits_period(&self, nframes: usize) -> bool {
        self.iter().all(|track| {
            track
                .inputs()
                .iter()
                .chain(track.outputs())
                .all(|port| port.max_frames() >= nframes)
        })
    }
}
