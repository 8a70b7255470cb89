//! Decoded, seekable access to source audio files.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::warn;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::EngineError;

/// A decoder positioned somewhere in an audio file, yielding interleaved
/// `f32` frames.
pub struct SourceFile {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    frames: Option<u64>,
    decoded: Vec<f32>,
    decoded_pos: usize,
    position: u64,
    finished: bool,
}

impl SourceFile {
    /// Open `path` and position it at frame 0.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let src = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(src), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|err| EngineError::Decode(format!("{}: {}", path.display(), err)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                EngineError::Decode(format!("{}: no supported audio tracks", path.display()))
            })?;

        let sample_rate = track.codec_params.sample_rate.ok_or_else(|| {
            EngineError::Decode(format!("{}: missing sample rate", path.display()))
        })?;
        let channels = track
            .codec_params
            .channels
            .map(|channels| channels.count())
            .unwrap_or(1)
            .max(1);
        let frames = track.codec_params.n_frames;
        let track_id = track.id;

        let dec_opts: DecoderOptions = Default::default();
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &dec_opts)
            .map_err(|err| EngineError::Decode(format!("{}: {}", path.display(), err)))?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            frames,
            decoded: Vec::new(),
            decoded_pos: 0,
            position: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total length in frames, when the container reports it.
    pub fn frames(&self) -> Option<u64> {
        self.frames
    }

    /// Frame that the next [`Self::read`] starts at.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move to `frame`. Seeking past the end leaves the file at end of data.
    pub fn seek(&mut self, frame: u64) -> Result<(), EngineError> {
        if frame == self.position {
            return Ok(());
        }
        self.decoded.clear();
        self.decoded_pos = 0;
        self.finished = false;

        if let Some(total) = self.frames {
            if frame >= total {
                self.position = frame;
                self.finished = true;
                return Ok(());
            }
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|err| EngineError::Decode(format!("{}: {}", self.path.display(), err)))?;
        self.decoder.reset();
        self.position = seeked.actual_ts;

        // Decode forward to the exact frame.
        let mut skip = frame.saturating_sub(seeked.actual_ts) as usize;
        while skip > 0 {
            if !self.fill_decoded()? {
                break;
            }
            let available = (self.decoded.len() - self.decoded_pos) / self.channels;
            let n = available.min(skip);
            self.decoded_pos += n * self.channels;
            self.position += n as u64;
            skip -= n;
        }
        Ok(())
    }

    /// Read up to `nframes` interleaved frames into `buf` and return how many
    /// were read. Zero means end of data.
    pub fn read(&mut self, buf: &mut [f32], nframes: usize) -> Result<usize, EngineError> {
        let nframes = nframes.min(buf.len() / self.channels);
        let mut done = 0usize;
        while done < nframes {
            if !self.fill_decoded()? {
                break;
            }
            let available = (self.decoded.len() - self.decoded_pos) / self.channels;
            let n = available.min(nframes - done);
            let samples = n * self.channels;
            buf[done * self.channels..done * self.channels + samples]
                .copy_from_slice(&self.decoded[self.decoded_pos..self.decoded_pos + samples]);
            self.decoded_pos += samples;
            done += n;
        }
        self.position += done as u64;
        Ok(done)
    }

    /// Make sure decoded samples are pending. Returns `false` at end of data.
    fn fill_decoded(&mut self) -> Result<bool, EngineError> {
        while self.decoded_pos >= self.decoded.len() {
            if self.finished {
                return Ok(false);
            }
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    return Ok(false);
                }
                Err(Error::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(err) => {
                    return Err(EngineError::Decode(format!(
                        "{}: {}",
                        self.path.display(),
                        err
                    )))
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    samples.copy_interleaved_ref(decoded);
                    self.decoded.clear();
                    self.decoded.extend_from_slice(samples.samples());
                    self.decoded_pos = 0;
                }
                Err(Error::DecodeError(err)) => {
                    warn!("decode error in {}: {}", self.path.display(), err);
                }
                Err(err) => {
                    return Err(EngineError::Decode(format!(
                        "{}: {}",
                        self.path.display(),
                        err
                    )))
                }
            }
        }
        Ok(true)
    }
}

/// A source file shared by every region that plays it.
///
/// The decoder is opened on first use and kept; reads are positional, so
/// regions at different offsets may share one clip.
pub struct AudioClip {
    path: PathBuf,
    channels: usize,
    sample_rate: u32,
    frames: u64,
    source: Mutex<Option<SourceFile>>,
}

impl AudioClip {
    /// Probe `path` for its layout. The decoder stays open for later reads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let source = SourceFile::open(path.as_ref())?;
        let frames = match source.frames() {
            Some(frames) => frames,
            None => count_frames(path.as_ref())?,
        };
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            channels: source.channels(),
            sample_rate: source.sample_rate(),
            frames,
            source: Mutex::new(Some(source)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Read up to `nframes` interleaved frames starting at `frame`.
    pub fn read_at(
        &self,
        buf: &mut [f32],
        frame: u64,
        nframes: usize,
    ) -> Result<usize, EngineError> {
        let mut guard = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(SourceFile::open(&self.path)?);
        }
        let Some(source) = guard.as_mut() else {
            return Ok(0);
        };
        if source.position() != frame {
            if let Err(err) = source.seek(frame) {
                // A failed seek leaves the decoder in an unknown place.
                *guard = None;
                return Err(err);
            }
        }
        source.read(buf, nframes)
    }
}

fn count_frames(path: &Path) -> Result<u64, EngineError> {
    let mut source = SourceFile::open(path)?;
    let mut buf = vec![0.0f32; 4096 * source.channels()];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf, 4096)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ramp(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("wav writer");
        for frame in 0..frames {
            for channel in 0..channels {
                let value = frame as f32 / frames as f32 * if channel == 0 { 1.0 } else { -1.0 };
                writer.write_sample(value).expect("sample");
            }
        }
        writer.finalize().expect("finalize");
    }

    #[test]
    fn reads_layout_and_all_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ramp.wav");
        write_ramp(&path, 2, 3000);

        let mut source = SourceFile::open(&path).expect("open");
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 48_000);
        assert_eq!(source.frames(), Some(3000));

        let mut buf = vec![0.0; 2 * 1024];
        let mut total = 0;
        loop {
            let n = source.read(&mut buf, 1024).expect("read");
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 3000);
    }

    #[test]
    fn seek_lands_on_exact_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ramp.wav");
        write_ramp(&path, 1, 10_000);

        let mut source = SourceFile::open(&path).expect("open");
        source.seek(4321).expect("seek");
        let mut buf = [0.0; 4];
        assert_eq!(source.read(&mut buf, 4).expect("read"), 4);
        assert_eq!(buf[0], 4321.0 / 10_000.0);
        assert_eq!(buf[3], 4324.0 / 10_000.0);
        assert_eq!(source.position(), 4325);
    }

    #[test]
    fn seek_past_end_reads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ramp.wav");
        write_ramp(&path, 1, 100);

        let mut source = SourceFile::open(&path).expect("open");
        source.seek(500).expect("seek");
        let mut buf = [0.0; 8];
        assert_eq!(source.read(&mut buf, 8).expect("read"), 0);
    }

    #[test]
    fn clip_reads_are_positional() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ramp.wav");
        write_ramp(&path, 1, 1000);

        let clip = AudioClip::open(&path).expect("clip");
        assert_eq!(clip.frames(), 1000);
        let mut buf = [0.0; 2];
        clip.read_at(&mut buf, 900, 2).expect("read");
        assert_eq!(buf[0], 0.9);
        clip.read_at(&mut buf, 10, 2).expect("read");
        assert_eq!(buf[0], 0.01);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = SourceFile::open("/definitely/not/here.wav").err();
        assert!(matches!(err, Some(EngineError::Io(_))));
    }
}
