//! Region graph queried by the playback disk thread and grown by captures.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};

use crate::io::AudioClip;

/// Source of a track's material on the timeline.
pub trait TrackSequence: Send + Sync {
    /// Mix `nframes` frames starting at timeline `frame` into `buf`
    /// (`channels` interleaved). Frames without material are silent. Returns
    /// the number of frames produced.
    fn play(&self, buf: &mut [f32], frame: u64, nframes: usize, channels: usize) -> usize;

    /// Start a take recorded into `path` at timeline `frame`.
    fn begin_capture(&self, path: &Path, frame: u64, channels: usize) -> Box<dyn CaptureRegion>;
}

/// The growing region of a take in progress.
pub trait CaptureRegion: Send {
    /// `frames_appended` more frames have reached the capture file.
    fn write(&mut self, frames_appended: u64);
    /// The take ended at timeline `frame`; the capture file is closed.
    fn finalize(&mut self, frame: u64);
    /// Move the visible start `frames` earlier to undo capture latency.
    fn offset(&mut self, frames: u64);
    /// Frames recorded so far.
    fn length(&self) -> u64;
}

/// A clip placed on the timeline.
#[derive(Clone)]
pub struct Region {
    pub clip: Arc<AudioClip>,
    /// Timeline frame of the first audible frame.
    pub start: u64,
    /// Frame within the clip that plays at `start`.
    pub offset: u64,
    pub length: u64,
    pub gain: f32,
}

impl Region {
    /// Place the whole of `clip` at `start`.
    pub fn new(clip: Arc<AudioClip>, start: u64) -> Self {
        let length = clip.frames();
        Self {
            clip,
            start,
            offset: 0,
            length,
            gain: 1.0,
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// In-memory [`TrackSequence`] holding regions; later regions play on top of
/// (are mixed with) earlier ones.
#[derive(Clone, Default)]
pub struct Sequence {
    regions: Arc<RwLock<Vec<Region>>>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&self, region: Region) {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(region);
    }

    pub fn regions(&self) -> Vec<Region> {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TrackSequence for Sequence {
    fn play(&self, buf: &mut [f32], frame: u64, nframes: usize, channels: usize) -> usize {
        let nframes = nframes.min(buf.len() / channels.max(1));
        let out = &mut buf[..nframes * channels];
        out.fill(0.0);

        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let window_end = frame + nframes as u64;
        let mut scratch = Vec::new();

        for region in regions.iter() {
            if region.end() <= frame || region.start >= window_end {
                continue;
            }
            let from = region.start.max(frame);
            let to = region.end().min(window_end);
            let count = (to - from) as usize;
            let clip_channels = region.clip.channels();
            scratch.resize(count * clip_channels, 0.0);

            let clip_frame = region.offset + (from - region.start);
            let read = match region.clip.read_at(&mut scratch, clip_frame, count) {
                Ok(read) => read,
                Err(err) => {
                    warn!("region read failed for {}: {}", region.clip.path().display(), err);
                    continue;
                }
            };

            let base = (from - frame) as usize;
            for i in 0..read {
                let dst = &mut out[(base + i) * channels..(base + i + 1) * channels];
                let src = &scratch[i * clip_channels..(i + 1) * clip_channels];
                if clip_channels == 1 {
                    for sample in dst.iter_mut() {
                        *sample += src[0] * region.gain;
                    }
                } else {
                    for (sample, value) in dst.iter_mut().zip(src) {
                        *sample += value * region.gain;
                    }
                }
            }
        }
        nframes
    }

    fn begin_capture(&self, path: &Path, frame: u64, _channels: usize) -> Box<dyn CaptureRegion> {
        Box::new(SequenceCapture {
            sequence: self.clone(),
            path: path.to_path_buf(),
            start: frame,
            length: 0,
            clip: None,
        })
    }
}

/// A take that becomes a [`Region`] of its sequence once finalized.
struct SequenceCapture {
    sequence: Sequence,
    path: PathBuf,
    start: u64,
    length: u64,
    clip: Option<Arc<AudioClip>>,
}

impl CaptureRegion for SequenceCapture {
    fn write(&mut self, frames_appended: u64) {
        self.length += frames_appended;
    }

    fn finalize(&mut self, frame: u64) {
        let expected = frame.saturating_sub(self.start);
        if self.length != expected {
            debug!(
                "capture {} holds {} frames, transport covered {}",
                self.path.display(),
                self.length,
                expected
            );
        }
        if self.length == 0 {
            return;
        }
        let clip = match AudioClip::open(&self.path) {
            Ok(clip) => Arc::new(clip),
            Err(err) => {
                warn!("could not open capture {}: {}", self.path.display(), err);
                return;
            }
        };
        let region = Region {
            length: clip.frames().min(self.length),
            ..Region::new(clip.clone(), self.start)
        };
        self.sequence.add_region(region);
        self.clip = Some(clip);
    }

    fn offset(&mut self, frames: u64) {
        let Some(clip) = &self.clip else {
            return;
        };
        let mut regions = self
            .sequence
            .regions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(index) = regions
            .iter()
            .position(|region| Arc::ptr_eq(&region.clip, clip))
        else {
            return;
        };
        // Latency reaching past the timeline origin is trimmed from the take.
        let region = &mut regions[index];
        let trimmed = frames.saturating_sub(region.start);
        if trimmed >= region.length {
            regions.remove(index);
            return;
        }
        region.start = region.start.saturating_sub(frames);
        region.offset += trimmed;
        region.length -= trimmed;
    }

    fn length(&self) -> u64 {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_clip(path: &Path, channels: u16, samples: &[f32]) -> Arc<AudioClip> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("wav");
        for sample in samples {
            writer.write_sample(*sample).expect("sample");
        }
        writer.finalize().expect("finalize");
        Arc::new(AudioClip::open(path).expect("clip"))
    }

    #[test]
    fn silence_outside_regions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip = write_clip(&dir.path().join("a.wav"), 1, &[0.5; 4]);
        let sequence = Sequence::new();
        sequence.add_region(Region::new(clip, 2));

        let mut buf = [9.0; 8];
        assert_eq!(sequence.play(&mut buf, 0, 8, 1), 8);
        assert_eq!(buf, [0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn mono_clip_feeds_every_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip = write_clip(&dir.path().join("m.wav"), 1, &[0.25, 0.75]);
        let sequence = Sequence::new();
        sequence.add_region(Region::new(clip, 0));

        let mut buf = [0.0; 4];
        sequence.play(&mut buf, 0, 2, 2);
        assert_eq!(buf, [0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn overlapping_regions_mix_with_gain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_clip(&dir.path().join("a.wav"), 1, &[0.5; 4]);
        let b = write_clip(&dir.path().join("b.wav"), 1, &[0.25; 4]);
        let sequence = Sequence::new();
        sequence.add_region(Region::new(a, 0));
        sequence.add_region(Region {
            gain: 2.0,
            offset: 1,
            length: 3,
            ..Region::new(b, 1)
        });

        let mut buf = [0.0; 4];
        sequence.play(&mut buf, 0, 4, 1);
        assert_eq!(buf, [0.5, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn finalized_capture_becomes_region_shifted_by_latency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("take.wav");
        write_clip(&path, 1, &[0.1; 100]);

        let sequence = Sequence::new();
        let mut capture = sequence.begin_capture(&path, 1000, 1);
        capture.write(60);
        capture.write(40);
        assert_eq!(capture.length(), 100);
        capture.finalize(1100);
        capture.offset(32);

        let regions = sequence.regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, 968);
        assert_eq!(regions[0].offset, 0);
        assert_eq!(regions[0].length, 100);
    }

    #[test]
    fn empty_capture_adds_no_region() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.wav");
        write_clip(&path, 1, &[]);
        let sequence = Sequence::new();
        let mut capture = sequence.begin_capture(&path, 0, 1);
        capture.finalize(0);
        capture.offset(0);
        assert!(sequence.regions().is_empty());
    }

    #[test]
    fn latency_past_origin_trims_the_take() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("early.wav");
        write_clip(&path, 1, &[0.1; 50]);
        let sequence = Sequence::new();
        let mut capture = sequence.begin_capture(&path, 10, 1);
        capture.write(50);
        capture.finalize(60);
        capture.offset(25);

        let regions = sequence.regions();
        assert_eq!(regions[0].start, 0);
        assert_eq!(regions[0].offset, 15);
        assert_eq!(regions[0].length, 35);
    }
}
