//! Diagnostics surfaced to the UI.

pub mod reporter;

pub use reporter::Reporter;
