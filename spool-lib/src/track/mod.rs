//! Tracks: ports, disk streams and the capture lifecycle of one lane.

mod capture;
mod port;
mod sequence;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::buffer::{RingReader, RingWriter};
use crate::error::EngineError;
use crate::io::CaptureFile;
use crate::peaks::PeakCache;
use crate::stream::{
    PlaybackIo, PlaybackStream, RecordIo, RecordStream, StreamMeter, StreamSettings, StreamState,
};

pub use capture::Capture;
pub use port::{LatencyRange, Port, PortDirection, MAX_PORT_NAME};
pub use sequence::{CaptureRegion, Region, Sequence, TrackSequence};

/// Stable handle of a track inside the engine.
pub type TrackId = u32;

/// Shared handles to the meters of a track's streams.
#[derive(Debug, Clone, Default)]
pub struct TrackMeters {
    pub playback: Option<Arc<StreamMeter>>,
    pub record: Option<Arc<StreamMeter>>,
}

/// One lane of the timeline with its inputs, outputs and disk streams.
pub struct Track {
    id: TrackId,
    name: String,
    sequence: Arc<dyn TrackSequence>,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    playback: Option<PlaybackStream>,
    record: Option<RecordStream>,
    armed: bool,
    mute: bool,
    solo: bool,
    takes: u32,
}

impl Track {
    pub fn new(
        id: TrackId,
        name: &str,
        sequence: Arc<dyn TrackSequence>,
    ) -> Result<Self, EngineError> {
        if name.is_empty() {
            return Err(EngineError::Port("track name cannot be empty".to_string()));
        }
        Ok(Self {
            id,
            name: name.to_string(),
            sequence,
            inputs: Vec::new(),
            outputs: Vec::new(),
            playback: None,
            record: None,
            armed: false,
            mute: false,
            solo: false,
            takes: 0,
        })
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> &Arc<dyn TrackSequence> {
        &self.sequence
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut [Port] {
        &mut self.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    pub fn playback(&self) -> Option<&PlaybackStream> {
        self.playback.as_ref()
    }

    pub fn record_stream(&self) -> Option<&RecordStream> {
        self.record.as_ref()
    }

    /// Meters of the current streams. Streams are replaced when ports are
    /// reconfigured, so take a fresh copy after every reconfiguration.
    pub fn meters(&self) -> TrackMeters {
        TrackMeters {
            playback: self.playback.as_ref().map(|p| p.meter().clone()),
            record: self.record.as_ref().map(|r| r.meter().clone()),
        }
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    pub fn mute(&self) -> bool {
        self.mute
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    pub fn solo(&self) -> bool {
        self.solo
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }

    pub fn is_capturing(&self) -> bool {
        self.record
            .as_ref()
            .is_some_and(|record| record.state() == StreamState::Streaming)
    }

    /// Set the number of output ports and recreate the playback stream.
    ///
    /// Returns the replaced stream, if any. Dropping it joins its disk
    /// thread, so callers holding the structural lock should drop it after
    /// releasing the lock.
    pub fn configure_outputs(
        &mut self,
        n: usize,
        settings: &StreamSettings,
        latency: LatencyRange,
    ) -> Result<Option<PlaybackStream>, EngineError> {
        if n == self.outputs.len() && (n == 0) == self.playback.is_none() {
            return Ok(None);
        }
        resize_ports(
            &mut self.outputs,
            &self.name,
            PortDirection::Output,
            n,
            settings.period,
            latency,
        )?;

        let delay = self.playback.as_ref().map_or(0, PlaybackStream::delay);
        let old = self.playback.take();
        if n > 0 {
            let mut stream = PlaybackStream::new(
                settings.geometry(n),
                n,
                self.sequence.clone(),
                settings.poll(),
            );
            stream.set_delay(delay);
            self.playback = Some(stream);
        }
        Ok(old)
    }

    /// Set the number of input ports and recreate the record stream.
    /// Refused while capturing.
    pub fn configure_inputs(
        &mut self,
        n: usize,
        settings: &StreamSettings,
        latency: LatencyRange,
    ) -> Result<Option<RecordStream>, EngineError> {
        if self.is_capturing() {
            return Err(EngineError::Stream(format!(
                "cannot reconfigure inputs of {} while recording",
                self.name
            )));
        }
        if n == self.inputs.len() && (n == 0) == self.record.is_none() {
            return Ok(None);
        }
        resize_ports(
            &mut self.inputs,
            &self.name,
            PortDirection::Input,
            n,
            settings.period,
            latency,
        )?;
        let old = self.record.take();
        if n > 0 {
            self.record = Some(RecordStream::new(settings.geometry(n), n, settings.poll()));
        }
        Ok(old)
    }

    /// Resize ports and streams for a new period. Control thread only; the
    /// playback thread is restarted in place.
    pub fn set_period(&mut self, settings: &StreamSettings) -> Result<(), EngineError> {
        for port in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if port.max_frames() < settings.period {
                port.resize(settings.period)?;
            }
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.resize(settings.geometry(playback.channels()))?;
        }
        if let Some(record) = self.record.as_mut() {
            record.resize(settings.geometry(record.channels()))?;
        }
        Ok(())
    }

    /// Output stage of a cycle. `any_solo` silences non-soloed tracks.
    pub fn process_output(&mut self, nframes: usize, any_solo: bool) {
        match self.playback.as_mut() {
            Some(playback) => {
                playback.process(&mut self.outputs, nframes);
            }
            None => {
                for port in &mut self.outputs {
                    port.silence(nframes);
                }
            }
        }
        if self.mute || (any_solo && !self.solo) {
            for port in &mut self.outputs {
                port.silence(nframes);
            }
        }
    }

    /// Output stage while the transport is stopped.
    pub fn silence_outputs(&mut self, nframes: usize) {
        for port in &mut self.outputs {
            port.silence(nframes);
        }
    }

    /// Input stage of a cycle. Returns frames queued for capture.
    pub fn process_input(&mut self, nframes: usize, transport_frame: u64, freewheeling: bool) -> usize {
        match self.record.as_mut() {
            Some(record) => record.process(&self.inputs, nframes, transport_frame, freewheeling),
            None => 0,
        }
    }

    pub fn start_playback(&mut self, frame: u64) -> Result<(), EngineError> {
        match self.playback.as_mut() {
            Some(playback) => playback.start(frame),
            None => Ok(()),
        }
    }

    pub fn detach_playback(&mut self) -> Option<PlaybackIo> {
        self.playback.as_mut().and_then(PlaybackStream::detach)
    }

    pub fn reattach_playback(&mut self, writers: Option<Vec<RingWriter>>) {
        if let Some(playback) = self.playback.as_mut() {
            playback.reattach(writers);
        }
    }

    /// Latency compensation for a new take: capture latency of the first
    /// input, plus the server's playback latency when overdubbing live.
    pub fn capture_offset(&self, freewheeling: bool, playback_latency: LatencyRange) -> u64 {
        let capture = self.inputs.first().map_or(0, |port| port.latency().min);
        let mut offset = u64::from(capture);
        if !freewheeling {
            offset += u64::from(playback_latency.min);
        }
        offset
    }

    /// Open a new take and start capturing at `frame`.
    pub fn begin_capture(
        &mut self,
        frame: u64,
        capture_dir: &Path,
        sample_rate: u32,
        peaks: &PeakCache,
        latency_offset: u64,
    ) -> Result<PathBuf, EngineError> {
        let channels = self.inputs.len();
        if channels == 0 || self.record.is_none() {
            return Err(EngineError::Stream(format!(
                "track {} has no inputs to record from",
                self.name
            )));
        }
        if self.is_capturing() {
            return Err(EngineError::Stream(format!(
                "track {} is already recording",
                self.name
            )));
        }

        std::fs::create_dir_all(capture_dir).map_err(|err| EngineError::Capture {
            path: capture_dir.to_path_buf(),
            reason: err.to_string(),
        })?;
        let path = self.next_take_path(capture_dir);
        let file = CaptureFile::create(&path, channels, sample_rate)?;
        let region = self.sequence.begin_capture(&path, frame, channels);
        let streamer = match peaks.streamer(&path, channels) {
            Ok(streamer) => Some(streamer),
            Err(err) => {
                warn!("no live peaks for {}: {}", path.display(), err);
                None
            }
        };
        let capture = Capture::new(file, region, streamer, latency_offset);

        let Some(record) = self.record.as_mut() else {
            return Err(EngineError::Stream("record stream vanished".to_string()));
        };
        record.start(frame, Box::new(capture))?;
        info!("track {} capturing into {}", self.name, path.display());
        Ok(path)
    }

    /// End the take at `frame`; join the returned thread off the real-time
    /// path and hand its rings back through [`Self::reattach_record`].
    pub fn stop_capture(&mut self, frame: u64) -> Option<RecordIo> {
        self.record.as_mut().and_then(|record| record.detach(frame))
    }

    pub fn reattach_record(&mut self, readers: Option<Vec<RingReader>>) {
        if let Some(record) = self.record.as_mut() {
            record.reattach(readers);
        }
    }

    fn next_take_path(&mut self, capture_dir: &Path) -> PathBuf {
        let stem: String = self
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        loop {
            self.takes += 1;
            let path = capture_dir.join(format!("{}-take{}.wav", stem, self.takes));
            if !path.exists() {
                return path;
            }
        }
    }
}

fn resize_ports(
    ports: &mut Vec<Port>,
    track_name: &str,
    direction: PortDirection,
    n: usize,
    period: usize,
    latency: LatencyRange,
) -> Result<(), EngineError> {
    let mut created = Vec::new();
    for index in ports.len()..n {
        let mut port = Port::new(track_name, direction, index, period)?;
        port.set_latency(latency);
        created.push(port);
    }
    ports.truncate(n);
    ports.extend(created);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn settings() -> StreamSettings {
        StreamSettings {
            config: EngineConfig {
                seconds_to_buffer: 0.1,
                ..EngineConfig::default()
            },
            sample_rate: 48_000,
            period: 64,
        }
    }

    fn track() -> Track {
        Track::new(1, "Bass", Arc::new(Sequence::new())).expect("track")
    }

    #[test]
    fn configure_outputs_names_ports_and_builds_stream() {
        let mut track = track();
        let old = track
            .configure_outputs(2, &settings(), LatencyRange::default())
            .expect("outputs");
        assert!(old.is_none());
        assert_eq!(track.outputs()[1].name(), "Bass/out-2");
        assert_eq!(track.playback().map(PlaybackStream::channels), Some(2));

        let old = track
            .configure_outputs(0, &settings(), LatencyRange::default())
            .expect("outputs");
        assert!(old.is_some());
        assert!(track.playback().is_none());
        assert!(track.outputs().is_empty());
    }

    #[test]
    fn mute_and_solo_silence_output() {
        let mut track = track();
        track
            .configure_outputs(1, &settings(), LatencyRange::default())
            .expect("outputs");
        track.outputs[0].write(&[1.0; 64]);
        track.set_mute(true);
        track.process_output(64, false);
        assert!(track.outputs()[0].read(64).iter().all(|s| *s == 0.0));

        track.set_mute(false);
        track.process_output(64, true);
        assert!(track.outputs()[0].read(64).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn capture_offset_adds_playback_latency_unless_freewheeling() {
        let mut track = track();
        track
            .configure_inputs(
                1,
                &settings(),
                LatencyRange { min: 128, max: 256 },
            )
            .expect("inputs");
        let playback = LatencyRange { min: 64, max: 64 };
        assert_eq!(track.capture_offset(false, playback), 192);
        assert_eq!(track.capture_offset(true, playback), 128);
    }

    #[test]
    fn capture_needs_inputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut track = track();
        let peaks = PeakCache::new(Default::default());
        let err = track
            .begin_capture(0, dir.path(), 48_000, &peaks, 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::Stream(_)));
    }

    #[test]
    fn take_paths_do_not_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("Bass-take1.wav"), b"").expect("existing");
        let mut track = track();
        assert_eq!(
            track.next_take_path(dir.path()),
            dir.path().join("Bass-take2.wav")
        );
    }
}
