use std::path::Path;

use log::debug;

use crate::io::SourceFile;

use super::format::{PeakFile, PeakWriter};
use super::{Peak, PeaksError};

const READ_FRAMES: usize = 4096;

/// Folds interleaved frames into one peak group per `chunksize` frames.
pub(crate) struct PeakAccumulator {
    channels: usize,
    chunksize: usize,
    count: usize,
    current: Vec<Peak>,
}

impl PeakAccumulator {
    pub(crate) fn new(channels: usize, chunksize: usize) -> Self {
        Self {
            channels,
            chunksize,
            count: 0,
            current: vec![Peak::default(); channels],
        }
    }

    /// Consume `interleaved` and append every completed group to `out`.
    pub(crate) fn push_frames(&mut self, interleaved: &[f32], out: &mut Vec<Peak>) {
        for frame in interleaved.chunks_exact(self.channels) {
            if self.count == 0 {
                for (peak, sample) in self.current.iter_mut().zip(frame) {
                    *peak = Peak {
                        min: *sample,
                        max: *sample,
                    };
                }
            } else {
                for (peak, sample) in self.current.iter_mut().zip(frame) {
                    peak.min = peak.min.min(*sample);
                    peak.max = peak.max.max(*sample);
                }
            }
            self.count += 1;
            if self.count == self.chunksize {
                out.extend_from_slice(&self.current);
                self.count = 0;
            }
        }
    }

    /// Emit the trailing group if it holds any frames.
    pub(crate) fn flush_partial(&mut self, out: &mut Vec<Peak>) {
        if self.count > 0 {
            out.extend_from_slice(&self.current);
            self.count = 0;
        }
    }
}

/// Merge `peaks` (one record per channel per group) into the per-channel
/// accumulators in `into`.
pub(crate) fn merge_groups(into: &mut [Peak], peaks: &[Peak], first: bool) {
    let width = into.len();
    for (index, peak) in peaks.iter().enumerate() {
        let slot = &mut into[index % width];
        if first && index < width {
            *slot = *peak;
        } else {
            slot.min = slot.min.min(peak.min);
            slot.max = slot.max.max(peak.max);
        }
    }
}

/// Sweep `source` once and write its peaks at `chunksize` to `peak_path`.
pub(crate) fn build_from_source(
    source: &Path,
    peak_path: &Path,
    chunksize: u32,
) -> Result<u64, PeaksError> {
    let mut file = SourceFile::open(source)?;
    let channels = file.channels();
    let mut writer = PeakWriter::create_atomic(peak_path, chunksize)?;
    let mut accumulator = PeakAccumulator::new(channels, chunksize as usize);
    let mut buf = vec![0.0_f32; READ_FRAMES * channels];
    let mut out = Vec::new();
    let mut groups = 0u64;

    loop {
        let n = file.read(&mut buf, READ_FRAMES)?;
        if n == 0 {
            break;
        }
        accumulator.push_frames(&buf[..n * channels], &mut out);
        groups += (out.len() / channels) as u64;
        writer.push(&out)?;
        out.clear();
    }
    accumulator.flush_partial(&mut out);
    groups += (out.len() / channels) as u64;
    writer.push(&out)?;
    writer.commit()?;

    debug!(
        "built {} peak groups at {} for {}",
        groups,
        chunksize,
        source.display()
    );
    Ok(groups)
}

/// Write the `chunksize` level of a source by merging groups of an existing
/// finer level. `chunksize` must be a multiple of the finer level.
pub(crate) fn build_from_level(
    finer_path: &Path,
    channels: usize,
    peak_path: &Path,
    chunksize: u32,
) -> Result<u64, PeaksError> {
    let mut finer = PeakFile::open(finer_path)?;
    let finer_chunksize = finer.chunksize();
    if finer_chunksize == 0 || chunksize % finer_chunksize != 0 {
        return Err(PeaksError::InvalidChunksize(chunksize));
    }
    let ratio = u64::from(chunksize / finer_chunksize);
    let total = finer.groups(channels);

    let mut writer = PeakWriter::create_atomic(peak_path, chunksize)?;
    let mut merged = vec![Peak::default(); channels];
    let batch = ratio * (READ_FRAMES as u64 / 16).max(1);
    let mut first = 0u64;
    let mut groups = 0u64;

    while first < total {
        let peaks = finer.read_groups(first, batch, channels)?;
        if peaks.is_empty() {
            break;
        }
        let group_len = ratio as usize * channels;
        for chunk in peaks.chunks(group_len) {
            merge_groups(&mut merged, chunk, true);
            writer.push(&merged)?;
            groups += 1;
        }
        first += (peaks.len() / channels) as u64;
    }
    writer.commit()?;
    Ok(groups)
}

/// Peaks for `[start, end)` computed directly from the source samples.
pub(crate) fn summarize_source(
    source: &Path,
    start: u64,
    end: u64,
    chunksize: u32,
) -> Result<(Vec<Peak>, usize), PeaksError> {
    let mut file = SourceFile::open(source)?;
    let channels = file.channels();
    let mut out = Vec::new();
    if end <= start {
        return Ok((out, channels));
    }
    file.seek(start)?;

    let mut accumulator = PeakAccumulator::new(channels, chunksize as usize);
    let mut buf = vec![0.0_f32; READ_FRAMES * channels];
    let mut remaining = end - start;
    while remaining > 0 {
        let want = remaining.min(READ_FRAMES as u64) as usize;
        let n = file.read(&mut buf, want)?;
        if n == 0 {
            break;
        }
        accumulator.push_frames(&buf[..n * channels], &mut out);
        remaining -= n as u64;
    }
    accumulator.flush_partial(&mut out);
    Ok((out, channels))
}
