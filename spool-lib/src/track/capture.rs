use log::{debug, warn};

use crate::error::EngineError;
use crate::io::CaptureFile;
use crate::peaks::PeakStreamer;
use crate::stream::CaptureSink;

use super::sequence::CaptureRegion;

/// A take in progress: the file being written, its region on the timeline
/// and the peaks streamed alongside.
pub struct Capture {
    file: CaptureFile,
    region: Box<dyn CaptureRegion>,
    peaks: Option<PeakStreamer>,
    latency_offset: u64,
}

impl Capture {
    pub fn new(
        file: CaptureFile,
        region: Box<dyn CaptureRegion>,
        peaks: Option<PeakStreamer>,
        latency_offset: u64,
    ) -> Self {
        Self {
            file,
            region,
            peaks,
            latency_offset,
        }
    }
}

impl CaptureSink for Capture {
    fn write(&mut self, interleaved: &[f32], frames: usize) -> Result<(), EngineError> {
        self.file.write(interleaved)?;
        self.file.flush()?;
        self.region.write(frames as u64);
        if let Some(peaks) = self.peaks.as_mut() {
            if let Err(err) = peaks.write(interleaved) {
                warn!(
                    "peak streaming stopped for {}: {}",
                    self.file.path().display(),
                    err
                );
                self.peaks = None;
            }
        }
        Ok(())
    }

    fn finalize(self: Box<Self>, stop_frame: u64) -> Result<(), EngineError> {
        let Capture {
            mut file,
            mut region,
            peaks,
            latency_offset,
        } = *self;

        file.finalize()?;
        region.finalize(stop_frame);
        debug!(
            "adjusting capture {} by {} frames",
            file.path().display(),
            latency_offset
        );
        region.offset(latency_offset);

        if let Some(peaks) = peaks {
            peaks.finish()?;
        }
        Ok(())
    }
}
