//! The audio callback side of the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::graph::TrackGraph;
use super::lock::RtLock;
use super::server::AudioServer;
use super::transport::Transport;
use crate::track::TrackId;

/// State shared between the control thread and the callback.
pub(crate) struct EngineShared {
    pub(crate) graph: RtLock<TrackGraph>,
    pub(crate) transport: Transport,
    pub(crate) server: Arc<dyn AudioServer>,
    pub(crate) seek_ready_percent: u32,
    pub(crate) cycles: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

/// Outcome of one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Tracks were processed.
    Processed { rolling: bool },
    /// The structural lock was busy (or a port was too small) and the cycle
    /// was skipped. Output is silent.
    Dropped,
}

/// Moves audio between the device and track ports during a cycle.
///
/// Every output is taken before any input is filled, so an implementation
/// may route this cycle's output of one track into the input of another.
/// Both hooks are called with the structural lock held and must be
/// real-time safe.
pub trait PortIo {
    /// Fill input `channel` of `track` after all outputs were taken.
    fn fill_input(&mut self, _track: TrackId, _channel: usize, _buf: &mut [f32]) {}

    /// Collect output `channel` of `track`, which has `channels` outputs.
    fn take_output(&mut self, _track: TrackId, _channel: usize, _channels: usize, _buf: &[f32]) {}
}

/// Leaves input ports as they are and ignores outputs.
pub struct NoPortIo;

impl PortIo for NoPortIo {}

/// Sums every track output into one interleaved buffer. Mono tracks feed all
/// channels.
struct Mixer<'a> {
    out: &'a mut [f32],
    channels: usize,
}

impl PortIo for Mixer<'_> {
    fn take_output(&mut self, _track: TrackId, channel: usize, channels: usize, buf: &[f32]) {
        let width = self.channels;
        for (frame, sample) in self.out.chunks_exact_mut(width).zip(buf) {
            if channels == 1 {
                for out in frame.iter_mut() {
                    *out += sample;
                }
            } else if channel < width {
                frame[channel] += sample;
            }
        }
    }
}

/// Cloneable handle given to the audio callback.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<EngineShared>,
}

impl ProcessHandle {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Run one cycle of `nframes` without device I/O.
    pub fn process(&self, nframes: usize) -> CycleOutcome {
        self.process_with(nframes, &mut NoPortIo)
    }

    /// Run one cycle of `nframes`. Real-time safe: the structural lock is
    /// only tried, never waited for.
    pub fn process_with(&self, nframes: usize, io: &mut dyn PortIo) -> CycleOutcome {
        let shared = &self.shared;
        let Some(mut graph) = shared.graph.try_rt() else {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            return CycleOutcome::Dropped;
        };
        if !graph.fits_period(nframes) {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            return CycleOutcome::Dropped;
        }

        let transport = &shared.transport;
        if transport.roll_requested() && !graph.seek_pending(shared.seek_ready_percent) {
            transport.request_roll(false);
            transport.set_rolling(true);
        }
        let rolling = transport.rolling();
        let frame = transport.frame();
        let freewheeling = shared.server.freewheeling();
        let any_solo = graph.any_solo();

        // Every track's output stage completes before any input stage starts.
        for track in graph.iter_mut() {
            if rolling {
                track.process_output(nframes, any_solo);
            } else {
                track.silence_outputs(nframes);
            }
        }
        for track in graph.iter() {
            let outputs = track.outputs();
            for (channel, port) in outputs.iter().enumerate() {
                io.take_output(track.id(), channel, outputs.len(), port.read(nframes));
            }
        }

        for track in graph.iter_mut() {
            let id = track.id();
            for (channel, port) in track.inputs_mut().iter_mut().enumerate() {
                io.fill_input(id, channel, port.buffer_mut(nframes));
            }
        }
        if rolling {
            for track in graph.iter_mut() {
                track.process_input(nframes, frame, freewheeling);
            }
        }
        drop(graph);

        if rolling {
            transport.advance(nframes);
            transport.check_punch_out(frame + nframes as u64);
        }
        shared.cycles.fetch_add(1, Ordering::Relaxed);
        CycleOutcome::Processed { rolling }
    }

    /// Run one cycle of `nframes` and mix all outputs into `out`, interleaved
    /// with `channels` channels. A dropped cycle leaves `out` silent.
    pub fn process_mixed(&self, nframes: usize, out: &mut [f32], channels: usize) -> CycleOutcome {
        out.fill(0.0);
        let channels = channels.max(1);
        let nframes = nframes.min(out.len() / channels);
        let mut mixer = Mixer {
            out: &mut out[..nframes * channels],
            channels,
        };
        self.process_with(nframes, &mut mixer)
    }

    pub fn transport(&self) -> &Transport {
        &self.shared.transport
    }

    /// Cycles skipped because the structural lock was busy.
    pub fn dropped_buffers(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }
}
