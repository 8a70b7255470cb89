//! # Spool Audio Library
//!
//! Disk streaming core of a multitrack recorder. Each track owns a playback
//! and a record disk stream that move audio between files and the real-time
//! callback through lock-free rings, and a peak cache keeps multi-resolution
//! waveform summaries of every source on disk.
//!
//! The audio server drives the engine through [`engine::ProcessHandle`]; all
//! structural changes go through [`engine::Engine`] on a control thread.

pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod io;
pub mod peaks;
pub mod stream;
pub mod track;

pub use config::{EngineConfig, PeakCacheConfig};
pub use engine::{Engine, EngineStats, ProcessHandle};
pub use error::EngineError;
pub use peaks::{Peak, PeakCache, PeakRead, PeaksError};
