//! Error type for setup-time engine failures.
//!
//! Only operations performed on the control thread return these. Anything that
//! goes wrong on the real-time path is counted instead (see
//! [`crate::engine::EngineStats`]).

use std::path::PathBuf;

use thiserror::Error;

use crate::peaks::PeaksError;

/// Failure of a control-thread operation (file/port/stream setup).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("port error: {0}")]
    Port(String),
    #[error("could not create capture file {path}: {reason}")]
    Capture { path: PathBuf, reason: String },
    #[error("disk stream error: {0}")]
    Stream(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no track with id {0}")]
    UnknownTrack(u32),
    #[error(transparent)]
    Peaks(#[from] PeaksError),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}
