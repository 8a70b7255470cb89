//! Capture side: the audio callback copies input ports into the rings and a
//! disk thread drains them into a [`CaptureSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::buffer::{RingBuffer, RingReader, RingWriter};
use crate::error::EngineError;
use crate::track::Port;

use super::gate::{BlockGate, IoThread};
use super::{StreamGeometry, StreamMeter, StreamState};

const FREEWHEEL_WAIT: Duration = Duration::from_millis(1);
const FREEWHEEL_ATTEMPTS: u32 = 5000;

/// Destination of captured audio, written from the capture thread.
pub trait CaptureSink: Send {
    /// Append `frames` interleaved frames.
    fn write(&mut self, interleaved: &[f32], frames: usize) -> Result<(), EngineError>;
    /// Close the take, which ended at timeline `stop_frame`.
    fn finalize(self: Box<Self>, stop_frame: u64) -> Result<(), EngineError>;
}

/// A detached capture thread. Joining it waits for the capture to be
/// finalized.
pub type RecordIo = IoThread<Vec<RingReader>>;

pub struct RecordStream {
    geometry: StreamGeometry,
    channels: usize,
    writers: Vec<RingWriter>,
    readers: Option<Vec<RingReader>>,
    io: Option<RecordIo>,
    state: StreamState,
    start_frame: u64,
    stop_frame: Arc<AtomicU64>,
    captured: Arc<AtomicU64>,
    meter: Arc<StreamMeter>,
    poll: Duration,
}

impl RecordStream {
    pub fn new(geometry: StreamGeometry, channels: usize, poll: Duration) -> Self {
        let (writers, readers) = make_rings(channels, geometry.capacity());
        Self {
            geometry,
            channels,
            writers,
            readers: Some(readers),
            io: None,
            state: StreamState::Armed,
            start_frame: 0,
            stop_frame: Arc::new(AtomicU64::new(u64::MAX)),
            captured: Arc::new(AtomicU64::new(0)),
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

    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    pub fn xruns(&self) -> u64 {
        self.meter.xruns()
    }

    /// Fill level readable without the structural lock.
    pub fn meter(&self) -> &Arc<StreamMeter> {
        &self.meter
    }

    /// Frames the capture thread has handed to the sink.
    pub fn captured_frames(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Begin capturing into `sink` from timeline `frame`.
    pub fn start(&mut self, frame: u64, sink: Box<dyn CaptureSink>) -> Result<(), EngineError> {
        if self.state == StreamState::Streaming {
            return Err(EngineError::Stream(
                "capture already in progress".to_string(),
            ));
        }
        let mut readers = match self.readers.take() {
            Some(readers) => readers,
            None => {
                let (writers, readers) = make_rings(self.channels, self.geometry.capacity());
                self.writers = writers;
                readers
            }
        };
        for reader in &mut readers {
            reader.discard();
        }
        self.meter.reset(self.geometry.capacity());

        self.stop_frame = Arc::new(AtomicU64::new(u64::MAX));
        self.captured = Arc::new(AtomicU64::new(0));
        let gate = BlockGate::new();
        let context = RecordContext {
            readers,
            sink,
            meter: self.meter.clone(),
            gate: gate.clone(),
            channels: self.channels,
            io_frames: self.geometry.io_frames(),
            start_frame: frame,
            stop_frame: self.stop_frame.clone(),
            captured: self.captured.clone(),
            poll: self.poll,
        };
        let io = IoThread::spawn("capture", gate, move || run_capture(context))?;
        debug!("capture started at frame {}", frame);
        self.io = Some(io);
        self.start_frame = frame;
        self.state = StreamState::Streaming;
        self.meter.set_streaming(true);
        Ok(())
    }

    /// End the take at timeline `frame` and hand the capture thread over for
    /// joining. The callback stops feeding the rings immediately.
    pub fn detach(&mut self, frame: u64) -> Option<RecordIo> {
        let io = self.io.take()?;
        self.stop_frame.store(frame.max(self.start_frame), Ordering::Release);
        io.terminate();
        self.state = StreamState::Idle;
        self.meter.set_streaming(false);
        Some(io)
    }

    /// Take back the rings of a joined capture thread.
    pub fn reattach(&mut self, readers: Option<Vec<RingReader>>) {
        match readers {
            Some(readers) => self.readers = Some(readers),
            None => {
                let (writers, readers) = make_rings(self.channels, self.geometry.capacity());
                self.writers = writers;
                self.readers = Some(readers);
                self.meter.reset(self.geometry.capacity());
            }
        }
        self.state = StreamState::Armed;
    }

    /// Finish the take at `frame` and wait until it is finalized. Idempotent.
    pub fn stop(&mut self, frame: u64) {
        if let Some(io) = self.detach(frame) {
            let readers = io.join();
            self.reattach(readers);
        }
    }

    /// Rebuild the rings for a new period. Only valid while not capturing.
    pub fn resize(&mut self, geometry: StreamGeometry) -> Result<(), EngineError> {
        if self.state == StreamState::Streaming {
            return Err(EngineError::Stream(
                "cannot resize while capturing".to_string(),
            ));
        }
        let (writers, readers) = make_rings(self.channels, geometry.capacity());
        self.geometry = geometry;
        self.writers = writers;
        self.readers = Some(readers);
        self.meter.reset(geometry.capacity());
        Ok(())
    }

    /// Copy this cycle's input into the rings.
    ///
    /// `transport_frame` is the timeline frame at the start of the cycle; a
    /// start frame inside the cycle drops the leading part. When freewheeling
    /// the call waits for ring space, otherwise a full ring drops the cycle
    /// and counts an xrun. Returns frames queued.
    pub fn process(
        &mut self,
        inputs: &[Port],
        nframes: usize,
        transport_frame: u64,
        freewheeling: bool,
    ) -> usize {
        if self.state != StreamState::Streaming {
            return 0;
        }
        let cycle_end = transport_frame + nframes as u64;
        if cycle_end <= self.start_frame {
            return 0;
        }
        let offset = self.start_frame.saturating_sub(transport_frame) as usize;
        let len = nframes - offset;

        if self.free_space() < len {
            if freewheeling {
                let mut attempts = 0;
                while self.free_space() < len && attempts < FREEWHEEL_ATTEMPTS {
                    if let Some(io) = &self.io {
                        io.wake();
                    }
                    thread::sleep(FREEWHEEL_WAIT);
                    attempts += 1;
                }
            }
            if self.free_space() < len {
                self.meter.count_xrun();
                self.post();
                return 0;
            }
        }

        for (writer, port) in self.writers.iter_mut().zip(inputs) {
            let buf = port.read(nframes);
            if offset < buf.len() {
                writer.write(&buf[offset..]);
            }
        }
        self.meter.queued(len);
        self.post();
        len
    }

    /// Share of the ring that is free, 0..=100.
    pub fn buffer_percent(&self) -> u32 {
        self.meter.free_percent()
    }

    fn free_space(&self) -> usize {
        self.writers
            .iter()
            .map(RingWriter::available_to_write)
            .min()
            .unwrap_or(0)
    }

    fn post(&self) {
        if let Some(io) = &self.io {
            io.gate().post();
            io.wake();
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        let frame = self.start_frame + self.captured_frames();
        self.stop(frame);
    }
}

fn make_rings(channels: usize, capacity: usize) -> (Vec<RingWriter>, Vec<RingReader>) {
    (0..channels).map(|_| RingBuffer::new(capacity)).unzip()
}

struct RecordContext {
    readers: Vec<RingReader>,
    sink: Box<dyn CaptureSink>,
    meter: Arc<StreamMeter>,
    gate: Arc<BlockGate>,
    channels: usize,
    io_frames: usize,
    start_frame: u64,
    stop_frame: Arc<AtomicU64>,
    captured: Arc<AtomicU64>,
    poll: Duration,
}

impl RecordContext {
    fn available(&self) -> usize {
        self.readers
            .iter()
            .map(RingReader::available_to_read)
            .min()
            .unwrap_or(0)
    }

    /// Frames still allowed before the stop frame.
    fn remaining(&self, written: u64) -> u64 {
        let stop = self.stop_frame.load(Ordering::Acquire);
        stop.saturating_sub(self.start_frame).saturating_sub(written)
    }

    /// Pull `n` frames from every ring into `buf`, interleaved.
    fn pull(&mut self, buf: &mut [f32], cbuf: &mut [f32], n: usize) {
        let channels = self.channels;
        for (channel, reader) in self.readers.iter_mut().enumerate() {
            let got = reader.read(&mut cbuf[..n]);
            cbuf[got..n].fill(0.0);
            for (i, sample) in cbuf[..n].iter().enumerate() {
                buf[i * channels + channel] = *sample;
            }
        }
        self.meter.taken(n);
    }

    fn write_block(&mut self, buf: &[f32], n: usize, written: &mut u64) {
        if n == 0 {
            return;
        }
        if let Err(err) = self.sink.write(&buf[..n * self.channels], n) {
            warn!("capture write failed: {}", err);
        }
        *written += n as u64;
        self.captured.store(*written, Ordering::Relaxed);
    }
}

fn run_capture(mut ctx: RecordContext) -> Vec<RingReader> {
    debug!("capture thread running");

    let nframes = ctx.io_frames;
    let mut buf = vec![0.0_f32; nframes * ctx.channels];
    let mut cbuf = vec![0.0_f32; nframes];
    let mut written = 0u64;

    loop {
        if ctx.gate.terminated() {
            break;
        }
        if ctx.available() < nframes {
            if !ctx.gate.wait(ctx.poll) {
                break;
            }
            continue;
        }
        ctx.pull(&mut buf, &mut cbuf, nframes);
        let n = (nframes as u64).min(ctx.remaining(written)) as usize;
        ctx.write_block(&buf, n, &mut written);
    }

    debug!("capture thread terminating");

    // Flush what the callback queued before the stop, up to the stop frame.
    loop {
        let remaining = ctx.remaining(written);
        let available = ctx.available();
        if remaining == 0 || available == 0 {
            break;
        }
        let n = available.min(nframes);
        ctx.pull(&mut buf, &mut cbuf, n);
        let n = (n as u64).min(remaining) as usize;
        ctx.write_block(&buf, n, &mut written);
    }
    for reader in &mut ctx.readers {
        reader.discard();
    }
    ctx.meter.clear();

    debug!("finalizing capture after {} frames", written);
    let stop_frame = ctx.stop_frame.load(Ordering::Acquire);
    let RecordContext { readers, sink, .. } = ctx;
    if let Err(err) = sink.finalize(stop_frame) {
        warn!("capture finalize failed: {}", err);
    }
    readers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::PortDirection;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collected {
        samples: Vec<f32>,
        stop_frame: Option<u64>,
    }

    struct MemorySink(Arc<Mutex<Collected>>);

    impl CaptureSink for MemorySink {
        fn write(&mut self, interleaved: &[f32], _frames: usize) -> Result<(), EngineError> {
            self.0.lock().expect("sink").samples.extend_from_slice(interleaved);
            Ok(())
        }

        fn finalize(self: Box<Self>, stop_frame: u64) -> Result<(), EngineError> {
            self.0.lock().expect("sink").stop_frame = Some(stop_frame);
            Ok(())
        }
    }

    fn geometry() -> StreamGeometry {
        StreamGeometry {
            period: 16,
            total_blocks: 8,
            disk_io_blocks: 2,
        }
    }

    fn inputs(channels: usize) -> Vec<Port> {
        (0..channels)
            .map(|i| Port::new("t", PortDirection::Input, i, 16).expect("port"))
            .collect()
    }

    #[test]
    fn captures_until_stop_frame() {
        let collected = Arc::new(Mutex::new(Collected::default()));
        let mut stream = RecordStream::new(geometry(), 2, Duration::from_millis(2));
        stream
            .start(0, Box::new(MemorySink(collected.clone())))
            .expect("start");

        let mut ports = inputs(2);
        let mut frame = 0u64;
        for cycle in 0..5 {
            ports[0].write(&[cycle as f32; 16]);
            ports[1].write(&[-(cycle as f32); 16]);
            assert_eq!(stream.process(&ports, 16, frame, false), 16);
            frame += 16;
            std::thread::sleep(Duration::from_millis(2));
        }
        stream.stop(72);

        let collected = collected.lock().expect("sink");
        assert_eq!(collected.stop_frame, Some(72));
        assert_eq!(collected.samples.len(), 72 * 2);
        assert_eq!(collected.samples[0], 0.0);
        assert_eq!(collected.samples[2 * 16], 1.0);
        assert_eq!(collected.samples[2 * 16 + 1], -1.0);
        assert_eq!(collected.samples[2 * 71], 4.0);
        assert_eq!(stream.state(), StreamState::Armed);
    }

    #[test]
    fn start_inside_cycle_drops_leading_frames() {
        let collected = Arc::new(Mutex::new(Collected::default()));
        let mut stream = RecordStream::new(geometry(), 1, Duration::from_millis(2));
        stream
            .start(100, Box::new(MemorySink(collected.clone())))
            .expect("start");

        let mut ports = inputs(1);
        let ramp: Vec<f32> = (0..16).map(|i| i as f32).collect();
        ports[0].write(&ramp);
        assert_eq!(stream.process(&ports, 16, 80, false), 0);
        assert_eq!(stream.process(&ports, 16, 96, false), 12);
        stream.stop(112);

        let collected = collected.lock().expect("sink");
        assert_eq!(collected.samples, (4..16).map(|i| i as f32).collect::<Vec<_>>());
    }

    struct StalledSink(Arc<Mutex<()>>);

    impl CaptureSink for StalledSink {
        fn write(&mut self, _: &[f32], _: usize) -> Result<(), EngineError> {
            let _held = self.0.lock().expect("stall");
            Ok(())
        }

        fn finalize(self: Box<Self>, _: u64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn full_ring_counts_an_xrun() {
        let geometry = StreamGeometry {
            period: 16,
            total_blocks: 1,
            disk_io_blocks: 1,
        };
        let stall = Arc::new(Mutex::new(()));
        let held = stall.lock().expect("stall");
        let mut stream = RecordStream::new(geometry, 1, Duration::from_millis(2));
        stream
            .start(0, Box::new(StalledSink(stall.clone())))
            .expect("start");

        // The disk thread can take at most one block before the sink stalls
        // it, so three cycles cannot all fit.
        let ports = inputs(1);
        let accepted: usize = (0..3)
            .map(|cycle| stream.process(&ports, 16, cycle * 16, false))
            .sum();
        assert!(accepted <= 32);
        assert!(stream.xruns() >= 1);

        drop(held);
        stream.stop(48);
    }

    #[test]
    fn zero_length_take_is_finalized() {
        let collected = Arc::new(Mutex::new(Collected::default()));
        let mut stream = RecordStream::new(geometry(), 1, Duration::from_millis(2));
        stream
            .start(64, Box::new(MemorySink(collected.clone())))
            .expect("start");
        stream.stop(64);
        let collected = collected.lock().expect("sink");
        assert_eq!(collected.stop_frame, Some(64));
        assert!(collected.samples.is_empty());
    }

    #[test]
    fn second_start_is_refused() {
        let mut stream = RecordStream::new(geometry(), 1, Duration::from_millis(2));
        let collected = Arc::new(Mutex::new(Collected::default()));
        stream
            .start(0, Box::new(MemorySink(collected.clone())))
            .expect("start");
        assert!(stream.start(0, Box::new(MemorySink(collected))).is_err());
        stream.stop(0);
    }
}
