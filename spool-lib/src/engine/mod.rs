//! Transport, structural lock and the control side of the engine.
//!
//! An [`Engine`] is created when the audio server connects. The server's
//! callback drives it through a [`ProcessHandle`]; everything else (tracks,
//! transport, recording) goes through the engine on a control thread.

mod graph;
mod lock;
mod meters;
#[cfg(feature = "rodio-output")]
mod output;
mod process;
mod server;
mod transport;

pub use graph::TrackGraph;
pub use lock::RtLock;
#[cfg(feature = "rodio-output")]
pub use output::RodioOutput;
pub use process::{CycleOutcome, NoPortIo, PortIo, ProcessHandle};
pub use server::{AudioServer, OfflineServer};
pub use transport::{PunchRange, PunchRanges, Transport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::buffer::{RingReader, RingWriter};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::peaks::PeakCache;
use crate::stream::{PlaybackIo, RecordIo, StreamSettings};
use crate::track::{Track, TrackId, TrackSequence};

use meters::MeterBoard;
use process::EngineShared;

/// Combined input and output fill that counts as ready for export.
const READY_PERCENT: u32 = 200;
const BUFFER_POLL: Duration = Duration::from_millis(5);

/// Snapshot of engine health for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frame: u64,
    pub rolling: bool,
    pub recording: bool,
    pub cycles: u64,
    pub dropped_buffers: u64,
    pub playback_xruns: u64,
    pub capture_xruns: u64,
    pub input_buffer_percent: u32,
    pub output_buffer_percent: u32,
}

#[derive(Debug, Default)]
struct PunchState {
    ranges: PunchRanges,
    enabled: bool,
}

/// Engine context: owns the transport, the track graph and the peak cache.
pub struct Engine {
    shared: Arc<EngineShared>,
    config: EngineConfig,
    peaks: PeakCache,
    meters: MeterBoard,
    punch: Mutex<PunchState>,
}

impl Engine {
    pub fn new(config: EngineConfig, server: Arc<dyn AudioServer>) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            "engine at {} Hz, period {} frames",
            server.sample_rate(),
            server.period_frames()
        );
        let shared = Arc::new(EngineShared {
            graph: RtLock::new(TrackGraph::default()),
            transport: Transport::default(),
            server,
            seek_ready_percent: u32::from(config.seek_ready_percent),
            cycles: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        Ok(Self {
            shared,
            peaks: PeakCache::new(config.peaks),
            config,
            meters: MeterBoard::default(),
            punch: Mutex::new(PunchState::default()),
        })
    }

    /// Entry point for the audio server's callback.
    pub fn process_handle(&self) -> ProcessHandle {
        ProcessHandle::new(self.shared.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.shared.transport
    }

    pub fn peak_cache(&self) -> &PeakCache {
        &self.peaks
    }

    pub fn server(&self) -> &Arc<dyn AudioServer> {
        &self.shared.server
    }

    fn settings(&self) -> StreamSettings {
        StreamSettings {
            config: self.config.clone(),
            sample_rate: self.shared.server.sample_rate(),
            period: self.shared.server.period_frames(),
        }
    }

    // Tracks

    /// Create a track with `inputs` input and `outputs` output channels.
    /// Its playback stream starts at the current transport frame.
    pub fn add_track(
        &self,
        name: &str,
        sequence: Arc<dyn TrackSequence>,
        inputs: usize,
        outputs: usize,
    ) -> Result<TrackId, EngineError> {
        let settings = self.settings();
        let server = &self.shared.server;
        let id = self.shared.graph.lock().allocate_id();
        let mut track = Track::new(id, name, sequence)?;
        track.configure_inputs(inputs, &settings, server.capture_latency())?;
        track.configure_outputs(outputs, &settings, server.playback_latency())?;

        let meters = track.meters();
        let mut graph = self.shared.graph.lock();
        track.start_playback(self.transport().frame())?;
        graph.insert(track);
        drop(graph);
        self.meters.publish(id, meters);
        info!("added track {} ({}), {} in / {} out", id, name, inputs, outputs);
        Ok(id)
    }

    /// Remove a track. A capture in progress ends at the current frame.
    pub fn remove_track(&self, id: TrackId) -> Result<(), EngineError> {
        let (track, capture) = {
            let mut graph = self.shared.graph.lock();
            let mut track = graph.remove(id).ok_or(EngineError::UnknownTrack(id))?;
            let capture = track.stop_capture(self.transport().frame());
            (track, capture)
        };
        self.meters.remove(id);
        if let Some(capture) = capture {
            capture.join();
        }
        info!("removed track {} ({})", id, track.name());
        drop(track);
        Ok(())
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.shared.graph.lock().ids()
    }

    /// Inspect a track under the structural lock.
    pub fn with_track<R>(&self, id: TrackId, f: impl FnOnce(&Track) -> R) -> Result<R, EngineError> {
        let graph = self.shared.graph.lock();
        graph.get(id).map(f).ok_or(EngineError::UnknownTrack(id))
    }

    fn with_track_mut<R>(
        &self,
        id: TrackId,
        f: impl FnOnce(&mut Track) -> R,
    ) -> Result<R, EngineError> {
        let mut graph = self.shared.graph.lock();
        graph.get_mut(id).map(f).ok_or(EngineError::UnknownTrack(id))
    }

    pub fn configure_outputs(&self, id: TrackId, n: usize) -> Result<(), EngineError> {
        let settings = self.settings();
        let latency = self.shared.server.playback_latency();
        let (old, started) = {
            let mut graph = self.shared.graph.lock();
            let track = graph.get_mut(id).ok_or(EngineError::UnknownTrack(id))?;
            let old = track.configure_outputs(n, &settings, latency)?;
            let started = track.start_playback(self.transport().frame());
            self.meters.publish(id, track.meters());
            (old, started)
        };
        drop(old);
        started
    }

    pub fn configure_inputs(&self, id: TrackId, n: usize) -> Result<(), EngineError> {
        let settings = self.settings();
        let latency = self.shared.server.capture_latency();
        let old = {
            let mut graph = self.shared.graph.lock();
            let track = graph.get_mut(id).ok_or(EngineError::UnknownTrack(id))?;
            let old = track.configure_inputs(n, &settings, latency)?;
            self.meters.publish(id, track.meters());
            old
        };
        drop(old);
        Ok(())
    }

    pub fn set_armed(&self, id: TrackId, armed: bool) -> Result<(), EngineError> {
        self.with_track_mut(id, |track| track.set_armed(armed))
    }

    pub fn set_mute(&self, id: TrackId, mute: bool) -> Result<(), EngineError> {
        self.with_track_mut(id, |track| track.set_mute(mute))
    }

    pub fn set_solo(&self, id: TrackId, solo: bool) -> Result<(), EngineError> {
        self.with_track_mut(id, |track| track.set_solo(solo))
    }

    /// Resize every stream for a new server period. Called after the server
    /// changed its buffer size, while the callback is not running.
    pub fn set_period(&self, period: usize) -> Result<(), EngineError> {
        let mut settings = self.settings();
        settings.period = period.max(1);
        let mut graph = self.shared.graph.lock();
        for track in graph.iter_mut() {
            track.set_period(&settings)?;
        }
        debug!("streams resized for period {}", settings.period);
        Ok(())
    }

    // Transport

    /// Ask the transport to roll. The callback starts rolling once no
    /// playback stream is still pre-buffering.
    pub fn start(&self) {
        let transport = self.transport();
        if transport.rolling() {
            return;
        }
        transport.request_roll(true);
        info!("transport start requested at frame {}", transport.frame());
    }

    /// Stop rolling, ending any recording first.
    pub fn stop(&self) -> Result<(), EngineError> {
        let result = if self.transport().recording() {
            self.stop_recording()
        } else {
            Ok(())
        };
        let transport = self.transport();
        transport.request_roll(false);
        transport.set_rolling(false);
        info!("transport stopped at frame {}", transport.frame());
        result
    }

    /// Move the transport to `frame`, refilling every playback stream from
    /// there. Refused (returns `false`) while recording.
    pub fn locate(&self, frame: u64) -> Result<bool, EngineError> {
        let transport = self.transport();
        if transport.recording() {
            warn!("locate to frame {} refused while recording", frame);
            return Ok(false);
        }
        let resume = transport.rolling() || transport.roll_requested();

        let detached: Vec<(TrackId, PlaybackIo)> = {
            let mut graph = self.shared.graph.lock();
            transport.request_roll(false);
            transport.set_rolling(false);
            graph
                .iter_mut()
                .filter_map(|track| track.detach_playback().map(|io| (track.id(), io)))
                .collect()
        };
        let joined: Vec<(TrackId, Option<Vec<RingWriter>>)> = detached
            .into_iter()
            .map(|(id, io)| (id, io.join()))
            .collect();

        let mut first_err = None;
        {
            let mut graph = self.shared.graph.lock();
            for (id, writers) in joined {
                if let Some(track) = graph.get_mut(id) {
                    track.reattach_playback(writers);
                }
            }
            transport.set_frame(frame);
            for track in graph.iter_mut() {
                if let Err(err) = track.start_playback(frame) {
                    warn!("track {} failed to restart playback: {}", track.name(), err);
                    first_err.get_or_insert(err);
                }
            }
        }
        if resume {
            transport.request_roll(true);
        }
        info!("located to frame {}", frame);
        match first_err {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// A playback stream has not refilled enough since the last locate.
    pub fn seek_pending(&self) -> bool {
        self.meters.seek_pending(self.shared.seek_ready_percent)
    }

    pub fn total_input_buffer_percent(&self) -> u32 {
        self.meters.input_buffer_percent()
    }

    pub fn total_output_buffer_percent(&self) -> u32 {
        self.meters.output_buffer_percent()
    }

    /// Poll until the combined input and output fill reaches 200 percent.
    /// Returns `false` if `timeout` elapses first.
    pub fn wait_for_buffers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.meters.input_buffer_percent() + self.meters.output_buffer_percent();
            if ready >= READY_PERCENT {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(BUFFER_POLL);
        }
    }

    // Recording

    pub fn set_punch_enabled(&self, enabled: bool) {
        self.punch_state().enabled = enabled;
    }

    pub fn punch_enabled(&self) -> bool {
        self.punch_state().enabled
    }

    pub fn add_punch_range(&self, start: u64, end: u64) {
        self.punch_state().ranges.add(start, end);
    }

    pub fn clear_punch_ranges(&self) {
        self.punch_state().ranges.clear();
    }

    pub fn punch_ranges(&self) -> Vec<PunchRange> {
        self.punch_state().ranges.ranges().to_vec()
    }

    fn punch_state(&self) -> std::sync::MutexGuard<'_, PunchState> {
        self.punch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start recording every armed track. With punch enabled, recording
    /// begins at the next punch range and ends with it. Returns the punch-in
    /// frame.
    pub fn record(&self) -> Result<u64, EngineError> {
        let transport = self.transport();
        if transport.recording() {
            return Err(EngineError::Stream("already recording".to_string()));
        }
        let mut frame = transport.frame();
        let mut punch_out = None;
        {
            let punch = self.punch_state();
            if punch.enabled {
                if let Some(range) = punch.ranges.next(frame) {
                    frame = range.start;
                    punch_out = Some(range.end);
                }
            }
        }

        self.punch_in(frame)?;
        transport.schedule_punch_out(punch_out);
        transport.set_recording(true);
        info!("recording from frame {}", frame);
        Ok(frame)
    }

    /// Start the capture of every armed track at `frame`. If any track fails,
    /// the captures already started are stopped again and the error is
    /// returned.
    pub fn punch_in(&self, frame: u64) -> Result<(), EngineError> {
        let server = &self.shared.server;
        let freewheeling = server.freewheeling();
        let playback_latency = server.playback_latency();
        let sample_rate = server.sample_rate();

        let mut started = Vec::new();
        let mut failure = None;
        {
            let mut graph = self.shared.graph.lock();
            for track in graph.iter_mut() {
                if !track.armed() || track.inputs().is_empty() {
                    continue;
                }
                let offset = track.capture_offset(freewheeling, playback_latency);
                match track.begin_capture(
                    frame,
                    &self.config.capture_dir,
                    sample_rate,
                    &self.peaks,
                    offset,
                ) {
                    Ok(_) => started.push(track.id()),
                    Err(err) => {
                        warn!("track {} cannot record: {}", track.name(), err);
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        match failure {
            Some(err) => {
                self.stop_captures(Some(&started), frame);
                Err(err)
            }
            None => {
                debug!("punched in {} tracks at frame {}", started.len(), frame);
                Ok(())
            }
        }
    }

    /// End the capture of every recording track at `frame` and wait until
    /// the capture files are finalized.
    pub fn punch_out(&self, frame: u64) {
        let stopped = self.stop_captures(None, frame);
        self.transport().schedule_punch_out(None);
        debug!("punched out {} tracks at frame {}", stopped, frame);
    }

    /// Stop recording at the current frame, or at the end of the last punch
    /// range if it has already passed.
    pub fn stop_recording(&self) -> Result<(), EngineError> {
        let transport = self.transport();
        if !transport.recording() {
            return Ok(());
        }
        let mut frame = transport.frame();
        {
            let punch = self.punch_state();
            if punch.enabled {
                if let Some(range) = punch.ranges.prev(frame) {
                    if range.end < frame {
                        frame = range.end;
                    }
                }
            }
        }
        if let Some(scheduled) = transport.punch_out_frame() {
            frame = frame.min(scheduled);
        }
        self.punch_out(frame);
        transport.set_recording(false);
        info!("recording stopped at frame {}", frame);
        Ok(())
    }

    /// Periodic control-thread work: performs a punch-out the callback has
    /// flagged as due.
    pub fn idle(&self) -> Result<(), EngineError> {
        let transport = self.transport();
        if transport.take_punch_out_due() && transport.recording() {
            self.stop_recording()?;
        }
        Ok(())
    }

    /// Detach capture threads under the lock, join them outside it, then hand
    /// the rings back. Returns the number of captures stopped.
    fn stop_captures(&self, only: Option<&[TrackId]>, frame: u64) -> usize {
        let detached: Vec<(TrackId, RecordIo)> = {
            let mut graph = self.shared.graph.lock();
            graph
                .iter_mut()
                .filter(|track| only.map_or(true, |ids| ids.contains(&track.id())))
                .filter_map(|track| track.stop_capture(frame).map(|io| (track.id(), io)))
                .collect()
        };
        let count = detached.len();
        let joined: Vec<(TrackId, Option<Vec<RingReader>>)> = detached
            .into_iter()
            .map(|(id, io)| (id, io.join()))
            .collect();

        let mut graph = self.shared.graph.lock();
        for (id, readers) in joined {
            if let Some(track) = graph.get_mut(id) {
                track.reattach_record(readers);
            }
        }
        count
    }

    // Diagnostics

    /// Snapshot for diagnostics. Never takes the structural lock.
    pub fn stats(&self) -> EngineStats {
        let transport = self.transport();
        EngineStats {
            frame: transport.frame(),
            rolling: transport.rolling(),
            recording: transport.recording(),
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            dropped_buffers: self.shared.dropped.load(Ordering::Relaxed),
            playback_xruns: self.meters.playback_xruns(),
            capture_xruns: self.meters.capture_xruns(),
            input_buffer_percent: self.meters.input_buffer_percent(),
            output_buffer_percent: self.meters.output_buffer_percent(),
        }
    }

    /// Hold the structural lock while `f` runs, as a structural change
    /// would.
    pub fn with_graph_locked<R>(&self, f: impl FnOnce(&TrackGraph) -> R) -> R {
        let graph = self.shared.graph.lock();
        f(&graph)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.transport().recording() {
            let frame = self.transport().frame();
            self.punch_out(frame);
            self.transport().set_recording(false);
        }
    }
}
