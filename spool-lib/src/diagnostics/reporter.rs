//! Periodic engine health reporter for UI updates.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::engine::{Engine, EngineStats};

/// Background reporter that polls [`Engine::stats`] at fixed intervals and
/// hands changed snapshots to a callback.
#[derive(Clone)]
pub struct Reporter {
    engine: Arc<Engine>,
    report: Arc<Mutex<dyn FnMut(EngineStats) + Send>>,
    interval: Duration,
    finish: Arc<AtomicBool>,
    thread_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Reporter {
    pub fn new(
        engine: Arc<Engine>,
        report: Arc<Mutex<dyn FnMut(EngineStats) + Send>>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            report,
            interval,
            finish: Arc::new(AtomicBool::new(false)),
            thread_handle: Arc::new(Mutex::new(None)),
        }
    }

    fn run(&self) {
        let mut last_report: Option<EngineStats> = None;

        loop {
            let report = self.engine.stats();
            if last_report.as_ref() != Some(&report) {
                let mut callback = self.report.lock().unwrap_or_else(PoisonError::into_inner);
                (*callback)(report.clone());
                last_report = Some(report);
            }

            if self.finish.load(Ordering::Relaxed) {
                break;
            }

            std::thread::sleep(self.interval);
        }
    }

    /// Start the background reporting thread.
    pub fn start(&self) {
        self.stop();
        self.finish.store(false, Ordering::Relaxed);
        let this = self.clone();
        let handle = std::thread::spawn(move || this.run());
        *self
            .thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the background reporting thread. One last snapshot is reported
    /// if anything changed since the previous one.
    pub fn stop(&self) {
        self.finish.store(true, Ordering::Relaxed);
        let handle = self
            .thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                log::warn!("reporter stop called from reporter thread; skipping join");
            } else if handle.join().is_err() {
                log::warn!("reporter thread panicked during join");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::OfflineServer;

    #[test]
    fn reports_initial_snapshot_and_changes() {
        let server = Arc::new(OfflineServer::new(48_000, 64));
        let engine = Arc::new(Engine::new(EngineConfig::default(), server).expect("engine"));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let reporter = Reporter::new(
            engine.clone(),
            Arc::new(Mutex::new(move |stats: EngineStats| {
                let _ = tx.lock().map(|tx| tx.send(stats));
            })),
            Duration::from_millis(5),
        );
        reporter.start();

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("first report");
        assert_eq!(first.cycles, 0);

        engine.process_handle().process(64);
        let next = rx.recv_timeout(Duration::from_secs(5)).expect("changed report");
        assert_eq!(next.cycles, 1);
        reporter.stop();
    }
}
