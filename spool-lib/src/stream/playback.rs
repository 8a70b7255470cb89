//! Playback side: a disk thread reads the track's sequence ahead of the
//! transport and the audio callback drains the rings into output ports.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::buffer::{RingBuffer, RingReader, RingWriter};
use crate::error::EngineError;
use crate::track::{Port, TrackSequence};

use super::gate::{BlockGate, IoThread};
use super::{StreamGeometry, StreamMeter, StreamState};

/// A detached playback thread; join it off the real-time path and hand the
/// result back through [`PlaybackStream::reattach`].
pub type PlaybackIo = IoThread<Vec<RingWriter>>;

pub struct PlaybackStream {
    geometry: StreamGeometry,
    channels: usize,
    sequence: Arc<dyn TrackSequence>,
    readers: Vec<RingReader>,
    writers: Option<Vec<RingWriter>>,
    io: Option<PlaybackIo>,
    state: StreamState,
    frame: u64,
    delay: u64,
    meter: Arc<StreamMeter>,
    poll: Duration,
}

impl PlaybackStream {
    pub fn new(
        geometry: StreamGeometry,
        channels: usize,
        sequence: Arc<dyn TrackSequence>,
        poll: Duration,
    ) -> Self {
        let (writers, readers) = make_rings(channels, geometry.capacity());
        Self {
            geometry,
            channels,
            sequence,
            readers,
            writers: Some(writers),
            io: None,
            state: StreamState::Armed,
            frame: 0,
            delay: 0,
            meter: StreamMeter::new(geometry.capacity()),
            poll,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    /// Timeline frame the next callback cycle plays.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    /// Play the sequence `frames` late. Takes effect at the next start or seek.
    pub fn set_delay(&mut self, frames: u64) {
        self.delay = frames;
    }

    pub fn xruns(&self) -> u64 {
        self.meter.xruns()
    }

    /// Fill level readable without the structural lock.
    pub fn meter(&self) -> &Arc<StreamMeter> {
        &self.meter
    }

    /// Start reading at timeline `frame`.
    pub fn start(&mut self, frame: u64) -> Result<(), EngineError> {
        if self.state == StreamState::Streaming {
            debug!("playback stream already running");
            return Ok(());
        }
        let writers = match self.writers.take() {
            Some(writers) => writers,
            None => {
                let (writers, readers) = make_rings(self.channels, self.geometry.capacity());
                self.readers = readers;
                writers
            }
        };
        for reader in &mut self.readers {
            reader.discard();
        }
        self.meter.reset(self.geometry.capacity());

        let gate = BlockGate::new();
        let context = PlaybackContext {
            writers,
            sequence: self.sequence.clone(),
            meter: self.meter.clone(),
            gate: gate.clone(),
            channels: self.channels,
            io_frames: self.geometry.io_frames(),
            frame,
            delay: self.delay,
            poll: self.poll,
        };
        let io = IoThread::spawn("playback", gate, move || run_playback(context))?;
        self.io = Some(io);
        self.frame = frame;
        self.state = StreamState::Streaming;
        self.meter.set_streaming(true);
        Ok(())
    }

    /// Signal the disk thread to stop and hand it over for joining. The
    /// callback plays silence from here on.
    pub fn detach(&mut self) -> Option<PlaybackIo> {
        let io = self.io.take()?;
        io.terminate();
        self.state = StreamState::Idle;
        self.meter.set_streaming(false);
        Some(io)
    }

    /// Take back the rings of a joined thread. `None` (thread panicked)
    /// rebuilds them.
    pub fn reattach(&mut self, writers: Option<Vec<RingWriter>>) {
        match writers {
            Some(writers) => self.writers = Some(writers),
            None => {
                let (writers, readers) = make_rings(self.channels, self.geometry.capacity());
                self.readers = readers;
                self.writers = Some(writers);
                self.meter.reset(self.geometry.capacity());
            }
        }
        self.state = StreamState::Armed;
    }

    /// Stop and join the disk thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(io) = self.detach() {
            let writers = io.join();
            self.reattach(writers);
        }
    }

    /// Restart streaming from `frame`, discarding everything buffered.
    pub fn seek(&mut self, frame: u64) -> Result<(), EngineError> {
        debug!("playback seek to frame {}", frame);
        self.stop();
        self.start(frame)
    }

    /// Rebuild the rings for a new period, resuming where the callback was.
    pub fn resize(&mut self, geometry: StreamGeometry) -> Result<(), EngineError> {
        if geometry == self.geometry {
            return Ok(());
        }
        let was_running = self.state == StreamState::Streaming;
        self.stop();
        self.geometry = geometry;
        let (writers, readers) = make_rings(self.channels, geometry.capacity());
        self.readers = readers;
        self.writers = Some(writers);
        self.meter.reset(geometry.capacity());
        if was_running {
            self.start(self.frame)?;
        }
        Ok(())
    }

    /// Fill `outputs` with the next `nframes` frames. Real-time safe.
    ///
    /// A shortfall is padded with silence and counted as an xrun. Returns the
    /// frames taken from the rings.
    pub fn process(&mut self, outputs: &mut [Port], nframes: usize) -> usize {
        if self.state != StreamState::Streaming {
            for port in outputs.iter_mut() {
                port.silence(nframes);
            }
            return 0;
        }

        let available = self
            .readers
            .iter()
            .map(RingReader::available_to_read)
            .min()
            .unwrap_or(0);
        let n = available.min(nframes);
        for (reader, port) in self.readers.iter_mut().zip(outputs.iter_mut()) {
            let buf = port.buffer_mut(nframes);
            let n = n.min(buf.len());
            reader.read(&mut buf[..n]);
            buf[n..].fill(0.0);
        }
        self.meter.taken(n);
        if n < nframes {
            self.meter.count_xrun();
        }
        self.frame += nframes as u64;

        if let Some(io) = &self.io {
            io.gate().post();
            io.wake();
        }
        n
    }

    /// Share of the ring that is filled, 0..=100.
    pub fn buffer_percent(&self) -> u32 {
        self.meter.fill_percent()
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn make_rings(channels: usize, capacity: usize) -> (Vec<RingWriter>, Vec<RingReader>) {
    (0..channels).map(|_| RingBuffer::new(capacity)).unzip()
}

struct PlaybackContext {
    writers: Vec<RingWriter>,
    sequence: Arc<dyn TrackSequence>,
    meter: Arc<StreamMeter>,
    gate: Arc<BlockGate>,
    channels: usize,
    io_frames: usize,
    frame: u64,
    delay: u64,
    poll: Duration,
}

fn run_playback(mut ctx: PlaybackContext) -> Vec<RingWriter> {
    debug!("playback thread running at frame {}", ctx.frame);

    let nframes = ctx.io_frames;
    let mut buf = vec![0.0_f32; nframes * ctx.channels];
    let mut cbuf = vec![0.0_f32; nframes];
    let mut frame = ctx.frame;

    loop {
        if ctx.gate.terminated() {
            break;
        }
        let space = ctx
            .writers
            .iter()
            .map(RingWriter::available_to_write)
            .min()
            .unwrap_or(0);
        if space < nframes {
            if !ctx.gate.wait(ctx.poll) {
                break;
            }
            continue;
        }

        read_block(&ctx, &mut buf, frame, nframes);

        // May have been told to stop while reading.
        if ctx.gate.terminated() {
            break;
        }

        for (channel, writer) in ctx.writers.iter_mut().enumerate() {
            for (i, sample) in cbuf.iter_mut().enumerate() {
                *sample = buf[i * ctx.channels + channel];
            }
            writer.write(&cbuf);
        }
        ctx.meter.queued(nframes);
        frame += nframes as u64;
    }

    debug!("playback thread terminating at frame {}", frame);
    ctx.writers
}

/// Interleaved sequence data for `[frame, frame + nframes)`, shifted by the
/// stream delay.
fn read_block(ctx: &PlaybackContext, buf: &mut [f32], frame: u64, nframes: usize) {
    let channels = ctx.channels;
    let (lead, from) = if frame >= ctx.delay {
        (0, frame - ctx.delay)
    } else {
        (((ctx.delay - frame) as usize).min(nframes), 0)
    };
    buf[..lead * channels].fill(0.0);
    if lead < nframes {
        let played = ctx
            .sequence
            .play(&mut buf[lead * channels..], from, nframes - lead, channels);
        buf[(lead + played) * channels..nframes * channels].fill(0.0);
    }
}
