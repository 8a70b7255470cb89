//! Lock-free sample staging between disk threads and the audio callback.

mod ring;

pub use ring::{RingBuffer, RingReader, RingWriter};
