//! Audio file access for the disk threads and the peak builder.

mod capture;
mod source;

pub use capture::CaptureFile;
pub use source::{AudioClip, SourceFile};
