//! Audio ports owned by a track.

use crate::error::EngineError;

/// Longest accepted port name in bytes.
pub const MAX_PORT_NAME: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Latency reported by the audio server for a port, in frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyRange {
    pub min: u32,
    pub max: u32,
}

/// A named mono port with a buffer sized for the largest period.
///
/// All buffer accessors clamp to that size, so the real-time path never
/// allocates.
#[derive(Debug)]
pub struct Port {
    name: String,
    direction: PortDirection,
    buffer: Vec<f32>,
    latency: LatencyRange,
}

impl Port {
    /// Create port `index` of `track_name`, named `"<track>/in-<n>"` or
    /// `"<track>/out-<n>"` (1-based).
    pub fn new(
        track_name: &str,
        direction: PortDirection,
        index: usize,
        max_frames: usize,
    ) -> Result<Self, EngineError> {
        if track_name.is_empty() {
            return Err(EngineError::Port("track name cannot be empty".to_string()));
        }
        if max_frames == 0 {
            return Err(EngineError::Port(
                "port buffer must hold at least one frame".to_string(),
            ));
        }
        let kind = match direction {
            PortDirection::Input => "in",
            PortDirection::Output => "out",
        };
        let name = format!("{}/{}-{}", track_name, kind, index + 1);
        if name.len() > MAX_PORT_NAME {
            return Err(EngineError::Port(format!(
                "port name longer than {} bytes: {}",
                MAX_PORT_NAME, name
            )));
        }
        Ok(Self {
            name,
            direction,
            buffer: vec![0.0; max_frames],
            latency: LatencyRange::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn max_frames(&self) -> usize {
        self.buffer.len()
    }

    /// Reallocate for a new maximum period. Control thread only.
    pub fn resize(&mut self, max_frames: usize) -> Result<(), EngineError> {
        if max_frames == 0 {
            return Err(EngineError::Port(
                "port buffer must hold at least one frame".to_string(),
            ));
        }
        self.buffer = vec![0.0; max_frames];
        Ok(())
    }

    /// Fail if a period of `nframes` does not fit the port buffer.
    pub fn check_period(&self, nframes: usize) -> Result<(), EngineError> {
        if nframes > self.buffer.len() {
            return Err(EngineError::Port(format!(
                "period of {} frames exceeds {} buffer of {}",
                nframes,
                self.name,
                self.buffer.len()
            )));
        }
        Ok(())
    }

    pub fn buffer(&self, nframes: usize) -> &[f32] {
        &self.buffer[..nframes.min(self.buffer.len())]
    }

    pub fn buffer_mut(&mut self, nframes: usize) -> &mut [f32] {
        let n = nframes.min(self.buffer.len());
        &mut self.buffer[..n]
    }

    /// Contents of the current period.
    pub fn read(&self, nframes: usize) -> &[f32] {
        self.buffer(nframes)
    }

    /// Replace the start of the buffer with `data`; returns frames written.
    pub fn write(&mut self, data: &[f32]) -> usize {
        let n = data.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&data[..n]);
        n
    }

    pub fn silence(&mut self, nframes: usize) {
        self.buffer_mut(nframes).fill(0.0);
    }

    pub fn latency(&self) -> LatencyRange {
        self.latency
    }

    pub fn set_latency(&mut self, latency: LatencyRange) {
        self.latency = latency;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_track_and_index() {
        let port = Port::new("Drums", PortDirection::Output, 1, 64).expect("port");
        assert_eq!(port.name(), "Drums/out-2");
        let port = Port::new("Drums", PortDirection::Input, 0, 64).expect("port");
        assert_eq!(port.name(), "Drums/in-1");
    }

    #[test]
    fn rejects_bad_names() {
        assert!(Port::new("", PortDirection::Input, 0, 64).is_err());
        let long = "x".repeat(MAX_PORT_NAME);
        assert!(matches!(
            Port::new(&long, PortDirection::Input, 0, 64),
            Err(EngineError::Port(_))
        ));
    }

    #[test]
    fn accessors_clamp_to_buffer() {
        let mut port = Port::new("t", PortDirection::Output, 0, 4).expect("port");
        assert_eq!(port.write(&[1.0; 8]), 4);
        assert_eq!(port.read(16).len(), 4);
        port.silence(2);
        assert_eq!(port.read(4), &[0.0, 0.0, 1.0, 1.0]);
        assert!(port.check_period(5).is_err());
        assert!(port.check_period(4).is_ok());
    }
}
