//! Lifecycle owner for the two detection workers.

use crate::logger::SharedLogger;
use crate::monitor::config::{PAUSE_SLICE, SHUTDOWN_GRACE, SUPERVISOR_POLL};
use crate::monitor::types::ShutdownFlag;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The shutdown flag was raised from outside (operator interrupt).
    Cancelled,
    /// Every worker returned on its own.
    WorkersStopped,
}

/// A worker thread under supervision.
pub struct Worker {
    pub name:   &'static str,
    pub handle: JoinHandle<()>,
}

impl Worker {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    /// Blocks until the thread returns. A panic is logged, never propagated.
    pub fn join(self, logger: &SharedLogger) {
        if self.handle.join().is_err() {
            logger.error(&format!("{} terminated with a panic", self.name));
        }
    }
}

/// Polls worker liveness and performs the bounded shutdown.
pub struct WorkerSupervisor {
    shutdown: ShutdownFlag,
    logger:   SharedLogger,
    poll:     Duration,
    grace:    Duration,
}

impl WorkerSupervisor {
    pub fn new(shutdown: ShutdownFlag, logger: SharedLogger) -> Self {
        Self {
            shutdown,
            logger,
            poll:  SUPERVISOR_POLL,
            grace: SHUTDOWN_GRACE,
        }
    }

    /// Overrides the poll interval and shutdown grace period.
    pub fn with_timing(mut self, poll: Duration, grace: Duration) -> Self {
        self.poll = poll;
        self.grace = grace;
        self
    }

    /// Blocks until either every worker has finished or the shutdown flag
    /// is raised, then raises the flag and joins the workers.
    ///
    /// Never blocks longer than one poll interval plus the grace period
    /// after cancellation: a worker that has not returned by then is
    /// detached and reported.
    pub fn supervise(&self, workers: Vec<Worker>) -> SupervisorOutcome {
        let outcome = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.logger.info("Shutdown requested, stopping workers...");
                break SupervisorOutcome::Cancelled;
            }
            if workers.iter().all(|w| w.handle.is_finished()) {
                self.logger.warn("All detection workers have stopped. Shutting down...");
                break SupervisorOutcome::WorkersStopped;
            }
            self.wait(self.poll);
        };

        self.shutdown.store(true, Ordering::SeqCst);
        self.join_all(workers);
        outcome
    }

    /// Interruptible sleep used between liveness polls.
    fn wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn join_all(&self, workers: Vec<Worker>) {
        let deadline = Instant::now() + self.grace;

        for worker in workers {
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(PAUSE_SLICE);
            }

            if !worker.handle.is_finished() {
                self.logger.error(&format!(
                    "{} did not stop within {}s, detaching",
                    worker.name,
                    self.grace.as_secs()
                ));
                continue;
            }

            worker.join(&self.logger);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, Logger};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn flag() -> ShutdownFlag {
        Arc::new(AtomicBool::new(false))
    }

    fn fast(shutdown: &ShutdownFlag) -> WorkerSupervisor {
        WorkerSupervisor::new(Arc::clone(shutdown), Logger::silent())
            .with_timing(Duration::from_millis(20), Duration::from_secs(2))
    }

    /// A worker that loops until the flag is raised.
    fn looping(shutdown: &ShutdownFlag) -> JoinHandle<()> {
        let shutdown = Arc::clone(shutdown);
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        })
    }

    #[test]
    fn both_workers_finishing_ends_supervision() {
        let shutdown = flag();
        let workers = vec![
            Worker::new("a", thread::spawn(|| {})),
            Worker::new("b", thread::spawn(|| thread::sleep(Duration::from_millis(50)))),
        ];
        assert_eq!(fast(&shutdown).supervise(workers), SupervisorOutcome::WorkersStopped);
        assert!(shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn one_finished_worker_keeps_supervision_running() {
        let shutdown = flag();
        let workers = vec![
            Worker::new("quick", thread::spawn(|| {})),
            Worker::new("long", looping(&shutdown)),
        ];

        let trigger = Arc::clone(&shutdown);
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        assert_eq!(fast(&shutdown).supervise(workers), SupervisorOutcome::Cancelled);
        assert!(started.elapsed() >= Duration::from_millis(200));
        canceller.join().unwrap();
    }

    #[test]
    fn cancellation_stops_looping_workers_promptly() {
        let shutdown = flag();
        let workers = vec![
            Worker::new("icmp", looping(&shutdown)),
            Worker::new("tcp", looping(&shutdown)),
        ];
        shutdown.store(true, Ordering::SeqCst);

        let started = Instant::now();
        assert_eq!(fast(&shutdown).supervise(workers), SupervisorOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stuck_worker_is_detached_after_grace() {
        let shutdown = flag();
        let workers = vec![Worker::new(
            "stuck",
            thread::spawn(|| thread::sleep(Duration::from_secs(3))),
        )];
        shutdown.store(true, Ordering::SeqCst);

        let supervisor = WorkerSupervisor::new(Arc::clone(&shutdown), Logger::silent())
            .with_timing(Duration::from_millis(20), Duration::from_millis(100));
        let started = Instant::now();
        assert_eq!(supervisor.supervise(workers), SupervisorOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn joining_a_panicked_worker_logs_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.log");
        let logger: SharedLogger =
            Arc::new(Logger::new(false, path.to_str(), Level::Error).unwrap());

        Worker::new("icmp-worker", thread::spawn(|| panic!("worker failure"))).join(&logger);
        Worker::new("tcp-worker", thread::spawn(|| {})).join(&logger);
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("icmp-worker terminated with a panic"));
    }

    #[test]
    fn panicking_worker_is_reported_not_propagated() {
        let shutdown = flag();
        let workers = vec![
            Worker::new("boom", thread::spawn(|| panic!("worker failure"))),
            Worker::new("ok", thread::spawn(|| {})),
        ];
        assert_eq!(fast(&shutdown).supervise(workers), SupervisorOutcome::WorkersStopped);
    }
}
