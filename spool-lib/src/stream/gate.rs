//! Wake-up signalling between the audio callback and a disk thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::EngineError;

/// Counts blocks the audio callback has processed since the disk thread last
/// looked, and carries the terminate request.
///
/// The callback side only touches atomics and unparks the thread; the disk
/// thread waits with a bounded park, so a lost wake-up costs at most one poll
/// interval.
#[derive(Debug, Default)]
pub(crate) struct BlockGate {
    blocks: AtomicU64,
    terminate: AtomicBool,
}

impl BlockGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one processed block. Real-time safe.
    pub(crate) fn post(&self) {
        self.blocks.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait until a block is posted, termination is requested or `poll`
    /// elapses. Returns `false` once terminated.
    pub(crate) fn wait(&self, poll: Duration) -> bool {
        if self.terminated() {
            return false;
        }
        if self.blocks.swap(0, Ordering::AcqRel) == 0 {
            thread::park_timeout(poll);
            self.blocks.swap(0, Ordering::AcqRel);
        }
        !self.terminated()
    }

    pub(crate) fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub(crate) fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
}

/// A running disk thread that hands its resources (`T`) back when joined.
pub struct IoThread<T> {
    handle: JoinHandle<T>,
    gate: Arc<BlockGate>,
}

impl<T: Send + 'static> IoThread<T> {
    pub(crate) fn spawn<F>(name: &str, gate: Arc<BlockGate>, body: F) -> Result<Self, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|err| EngineError::Stream(format!("could not spawn {name} thread: {err}")))?;
        Ok(Self { handle, gate })
    }
}

impl<T> IoThread<T> {
    pub(crate) fn gate(&self) -> &BlockGate {
        &self.gate
    }

    /// Nudge the thread after posting a block. Real-time safe.
    pub(crate) fn wake(&self) {
        self.handle.thread().unpark();
    }

    /// Ask the thread to finish and release any wait it is blocked in.
    pub(crate) fn terminate(&self) {
        self.gate.terminate();
        self.wake();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit. `None` if it panicked.
    pub fn join(self) -> Option<T> {
        self.gate.terminate();
        self.handle.thread().unpark();
        match self.handle.join() {
            Ok(value) => Some(value),
            Err(_) => {
                log::error!("disk thread panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn terminate_releases_a_waiting_thread() {
        let gate = BlockGate::new();
        let thread_gate = gate.clone();
        let io = IoThread::spawn("gate-test", gate, move || {
            let mut wakeups = 0u32;
            while thread_gate.wait(Duration::from_secs(5)) {
                wakeups += 1;
            }
            wakeups
        })
        .expect("spawn");

        let started = Instant::now();
        io.terminate();
        assert!(io.join().is_some());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn pending_posts_skip_the_wait() {
        let gate = BlockGate::new();
        gate.post();
        gate.post();
        let started = Instant::now();
        assert!(gate.wait(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(4));
        gate.terminate();
        assert!(!gate.wait(Duration::from_millis(1)));
    }
}
