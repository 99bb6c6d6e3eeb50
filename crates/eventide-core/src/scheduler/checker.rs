//! Blocked-thread checker
//!
//! A monitor thread wakes up every check interval and looks at the task
//! each executor is currently running. Anything over its budget is
//! reported; nothing is interrupted.

use crate::executor::{ExecutorId, ThreadActivity};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// An executor whose current task exceeded its execute time budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedThreadReport {
    /// The stalled executor
    pub executor: ExecutorId,
    /// Its thread name
    pub thread_name: String,
    /// How long the current task has been running
    pub elapsed: Duration,
    /// Budget that was exceeded
    pub threshold: Duration,
}

impl BlockedThreadReport {
    /// Elapsed time in whole milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

impl fmt::Display for BlockedThreadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thread {} ({}) has been blocked for {} ms, limit is {} ms",
            self.thread_name,
            self.executor,
            self.elapsed.as_millis(),
            self.threshold.as_millis()
        )
    }
}

/// Receives every blocked-thread report
pub type BlockedThreadListener = Arc<dyn Fn(&BlockedThreadReport) + Send + Sync + 'static>;

/// Budgets per executor kind
#[derive(Debug, Clone, Copy)]
pub(crate) struct Thresholds {
    pub event_loop: Duration,
    pub worker: Duration,
}

impl Thresholds {
    fn for_executor(&self, executor: ExecutorId) -> Duration {
        if executor.is_event_loop() {
            self.event_loop
        } else {
            self.worker
        }
    }
}

/// One pass over the executors: reports for every task over budget at `now`
pub(crate) fn check(
    activities: &[Arc<ThreadActivity>],
    thresholds: Thresholds,
    now: Instant,
) -> Vec<BlockedThreadReport> {
    activities
        .iter()
        .filter_map(|activity| {
            let elapsed = activity.elapsed(now)?;
            let threshold = thresholds.for_executor(activity.executor());
            (elapsed > threshold).then(|| BlockedThreadReport {
                executor: activity.executor(),
                thread_name: activity.thread_name().to_string(),
                elapsed,
                threshold,
            })
        })
        .collect()
}

/// Monitor thread handle
pub(crate) struct BlockedThreadChecker {
    /// Dropping the sender wakes and stops the monitor
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BlockedThreadChecker {
    /// Start the monitor thread
    pub fn start(
        prefix: &str,
        activities: Vec<Arc<ThreadActivity>>,
        thresholds: Thresholds,
        interval: Duration,
        listener: Option<BlockedThreadListener>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(format!("{}-blocked-thread-checker", prefix))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        for report in check(&activities, thresholds, Instant::now()) {
                            tracing::warn!(
                                executor = %report.executor,
                                thread = %report.thread_name,
                                elapsed_ms = report.elapsed_ms(),
                                threshold_ms = report.threshold.as_millis() as u64,
                                "executor blocked"
                            );
                            if let Some(listener) = &listener {
                                listener(&report);
                            }
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Check if the monitor is running
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the monitor thread
    pub fn stop(&mut self, timeout: Duration) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            crate::executor::join_with_timeout(handle, timeout);
        }
    }
}

impl Drop for BlockedThreadChecker {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn thresholds() -> Thresholds {
        Thresholds {
            event_loop: Duration::from_millis(10),
            worker: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_check_idle_executors() {
        let activities = vec![
            Arc::new(ThreadActivity::new(ExecutorId::EventLoop(0), "el-0".into())),
            Arc::new(ThreadActivity::new(ExecutorId::Worker(0), "w-0".into())),
        ];
        assert!(check(&activities, thresholds(), Instant::now()).is_empty());
    }

    #[test]
    fn test_check_uses_threshold_per_kind() {
        let event_loop = Arc::new(ThreadActivity::new(ExecutorId::EventLoop(0), "el-0".into()));
        let worker = Arc::new(ThreadActivity::new(ExecutorId::Worker(1), "w-1".into()));
        event_loop.begin();
        worker.begin();

        // 50ms in: over the event loop budget, under the worker budget
        let now = Instant::now() + Duration::from_millis(50);
        let reports = check(&[event_loop.clone(), worker.clone()], thresholds(), now);

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].executor, ExecutorId::EventLoop(0));
        assert_eq!(reports[0].thread_name, "el-0");
        assert_eq!(reports[0].threshold, Duration::from_millis(10));
        assert!(reports[0].elapsed >= Duration::from_millis(50));

        event_loop.end();
        let reports = check(&[event_loop, worker], thresholds(), now + Duration::from_millis(100));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].executor, ExecutorId::Worker(1));
    }

    #[test]
    fn test_report_display() {
        let report = BlockedThreadReport {
            executor: ExecutorId::EventLoop(2),
            thread_name: "eventide-eventloop-2".into(),
            elapsed: Duration::from_millis(2500),
            threshold: Duration::from_millis(2000),
        };
        assert_eq!(
            report.to_string(),
            "Thread eventide-eventloop-2 (event-loop-2) has been blocked for 2500 ms, limit is 2000 ms"
        );
    }

    #[test]
    fn test_monitor_reports_to_listener() {
        let activity = Arc::new(ThreadActivity::new(ExecutorId::EventLoop(0), "el-0".into()));
        activity.begin();

        let seen: Arc<Mutex<Vec<BlockedThreadReport>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: BlockedThreadListener =
            Arc::new(move |report: &BlockedThreadReport| sink.lock().push(report.clone()));

        let mut checker = BlockedThreadChecker::start(
            "test",
            vec![activity],
            Thresholds {
                event_loop: Duration::from_millis(1),
                worker: Duration::from_secs(60),
            },
            Duration::from_millis(5),
            Some(listener),
        )
        .unwrap();
        assert!(checker.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        checker.stop(Duration::from_secs(1));
        assert!(!checker.is_running());
        assert_eq!(seen.lock()[0].executor, ExecutorId::EventLoop(0));
    }
}
