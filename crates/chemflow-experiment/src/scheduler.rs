//! Background operations and the join barrier.
//!
//! Long device operations (pump runs, infusions) are spawned as tokio tasks so
//! the command stream keeps advancing. Each task logs its own outcome; a
//! failure never reaches the control loop. [`Scheduler::wait_all`] is the
//! barrier: it joins every outstanding task and leaves the set empty.

use chemflow_core::LabResult;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::run_log::RunLogger;

/// Log context for a background operation.
#[derive(Debug, Clone)]
pub struct OperationLabel {
    /// Component tag
    pub component: String,
    /// Action verb
    pub action: String,
    /// Parameters as written
    pub parameters: String,
    /// Device instance name
    pub device: String,
}

/// An in-flight background operation.
#[derive(Debug)]
pub struct PendingOperation {
    /// What is running, and on which device
    pub label: OperationLabel,
    /// Launch time
    pub started_at: Instant,
    /// Nominal duration
    pub estimated: Duration,
    handle: JoinHandle<bool>,
}

impl PendingOperation {
    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Tally of one barrier wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierReport {
    /// Operations that succeeded
    pub completed: usize,
    /// Operations that failed or panicked
    pub failed: usize,
}

impl BarrierReport {
    /// Operations joined.
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Owns the outstanding background operations of one run.
pub struct Scheduler {
    logger: RunLogger,
    pending: Vec<PendingOperation>,
}

impl Scheduler {
    /// Empty scheduler writing outcomes to `logger`.
    pub fn new(logger: RunLogger) -> Self {
        Self {
            logger,
            pending: Vec::new(),
        }
    }

    /// Spawn `operation`. On success the task logs the returned outcome text;
    /// on failure it logs the error.
    pub fn launch<F>(&mut self, label: OperationLabel, estimated: Duration, operation: F)
    where
        F: Future<Output = LabResult<String>> + Send + 'static,
    {
        let logger = self.logger.clone();
        let task_label = label.clone();
        let started_at = Instant::now();
        let handle = tokio::spawn(async move {
            let result = operation.await;
            let took = format!("took {:.1} s", started_at.elapsed().as_secs_f64());
            match result {
                Ok(outcome) => {
                    logger.log(
                        &task_label.component,
                        &task_label.action,
                        &task_label.parameters,
                        outcome,
                        took,
                    );
                    true
                }
                Err(e) => {
                    tracing::warn!(device = %task_label.device, error = %e, kind = e.kind(), "background operation failed");
                    logger.log(
                        &task_label.component,
                        &task_label.action,
                        &task_label.parameters,
                        format!("Error on {}: {e}", task_label.device),
                        took,
                    );
                    false
                }
            }
        });
        tracing::debug!(device = %label.device, action = %label.action, ?estimated, "background operation launched");
        self.pending.push(PendingOperation {
            label,
            started_at,
            estimated,
            handle,
        });
    }

    /// Outstanding operations, oldest first.
    pub fn pending(&self) -> &[PendingOperation] {
        &self.pending
    }

    /// Number of outstanding operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Join every outstanding operation and drain the set.
    pub async fn wait_all(&mut self) -> BarrierReport {
        let pending = std::mem::take(&mut self.pending);
        let labels: Vec<OperationLabel> = pending.iter().map(|op| op.label.clone()).collect();
        let results = futures::future::join_all(pending.into_iter().map(|op| op.handle)).await;

        let mut report = BarrierReport::default();
        for (label, result) in labels.into_iter().zip(results) {
            match result {
                Ok(true) => report.completed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(device = %label.device, error = %e, "background task did not finish");
                    self.logger.log(
                        &label.component,
                        &label.action,
                        &label.parameters,
                        format!("Error on {}: task aborted ({e})", label.device),
                        "",
                    );
                }
            }
        }
        report
    }

    /// Forget every outstanding operation without waiting. The tasks keep
    /// running and still log their outcomes.
    pub fn detach_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_log::MemoryRunLog;
    use chemflow_core::LabError;
    use std::sync::Arc;

    fn label(device: &str) -> OperationLabel {
        OperationLabel {
            component: "Pump".into(),
            action: "dispense".into(),
            parameters: String::new(),
            device: device.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn barrier_waits_for_slowest_and_drains() {
        let log = Arc::new(MemoryRunLog::new());
        let mut scheduler = Scheduler::new(RunLogger::new(log.clone()));
        for (device, secs) in [("Pump_1", 30), ("Pump_2", 5)] {
            scheduler.launch(label(device), Duration::from_secs(secs), async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(format!("done {secs}"))
            });
        }
        assert_eq!(scheduler.len(), 2);

        let started = Instant::now();
        let report = scheduler.wait_all().await;
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(report, BarrierReport { completed: 2, failed: 0 });
        assert!(scheduler.is_empty());

        let outcomes: Vec<_> = log.entries().into_iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec!["done 5", "done 30"]);
    }

    #[tokio::test]
    async fn failures_are_counted_and_logged() {
        let log = Arc::new(MemoryRunLog::new());
        let mut scheduler = Scheduler::new(RunLogger::new(log.clone()));
        scheduler.launch(label("Pump_3"), Duration::ZERO, async {
            Err(LabError::hardware("Pump_3", "stalled"))
        });
        scheduler.launch(label("Pump_1"), Duration::ZERO, async { Ok("ok".to_string()) });

        let report = scheduler.wait_all().await;
        assert_eq!(report, BarrierReport { completed: 1, failed: 1 });
        assert!(log
            .entries()
            .iter()
            .any(|e| e.outcome.starts_with("Error on Pump_3")));
    }

    #[tokio::test]
    async fn panicking_task_counts_as_failure() {
        let log = Arc::new(MemoryRunLog::new());
        let mut scheduler = Scheduler::new(RunLogger::new(log.clone()));
        scheduler.launch(label("Pump_9"), Duration::ZERO, async {
            if true {
                panic!("driver bug");
            }
            Ok(String::new())
        });
        let report = scheduler.wait_all().await;
        assert_eq!(report.failed, 1);
        assert!(log.entries()[0].outcome.contains("task aborted"));
    }

    #[tokio::test]
    async fn empty_barrier_returns_immediately() {
        let mut scheduler = Scheduler::new(RunLogger::new(Arc::new(MemoryRunLog::new())));
        assert_eq!(scheduler.wait_all().await.total(), 0);
    }
}
