//! Single-producer/single-consumer sample ring.
//!
//! The ring is split into a [`RingWriter`] and a [`RingReader`] at
//! construction, so each side can be moved to its own thread. Neither half
//! allocates, locks or blocks after construction; short counts are returned
//! instead.

use rtrb::{Consumer, Producer};

/// Constructor for a fixed-capacity `f32` ring.
pub struct RingBuffer;

impl RingBuffer {
    /// Create a ring holding `capacity` samples and return its two halves.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (RingWriter, RingReader) {
        let (producer, consumer) = rtrb::RingBuffer::<f32>::new(capacity);
        (
            RingWriter { producer, capacity },
            RingReader { consumer, capacity },
        )
    }
}

/// Writing half of a ring.
pub struct RingWriter {
    producer: Producer<f32>,
    capacity: usize,
}

impl RingWriter {
    /// Copy as much of `data` as fits and return how many samples were written.
    pub fn write(&mut self, data: &[f32]) -> usize {
        let n = data.len().min(self.producer.slots());
        if n == 0 {
            return 0;
        }
        match self.producer.write_chunk(n) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&data[..split]);
                second.copy_from_slice(&data[split..n]);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// Write `n` zero samples, or as many as fit.
    pub fn write_silence(&mut self, n: usize) -> usize {
        let n = n.min(self.producer.slots());
        if n == 0 {
            return 0;
        }
        match self.producer.write_chunk(n) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                first.fill(0.0);
                second.fill(0.0);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    pub fn available_to_write(&self) -> usize {
        self.producer.slots()
    }

    pub fn available_to_read(&self) -> usize {
        self.capacity - self.producer.slots()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Reading half of a ring.
pub struct RingReader {
    consumer: Consumer<f32>,
    capacity: usize,
}

impl RingReader {
    /// Fill `out` from the ring and return how many samples were copied.
    /// The tail of `out` past the returned count is left untouched.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.consumer.slots());
        if n == 0 {
            return 0;
        }
        match self.consumer.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..n].copy_from_slice(second);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// Drop every readable sample.
    pub fn discard(&mut self) -> usize {
        let n = self.consumer.slots();
        if let Ok(chunk) = self.consumer.read_chunk(n) {
            chunk.commit_all();
        }
        n
    }

    pub fn available_to_read(&self) -> usize {
        self.consumer.slots()
    }

    pub fn available_to_write(&self) -> usize {
        self.capacity - self.consumer.slots()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
