//! In-process supervisor that runs a whole sweep on the local machine.
//!
//! Plays the role the cluster scheduler has in production: admits ordinals in
//! a caller-chosen order, caps concurrency at `parallelism_cap` and applies
//! the retry policy through an `OrdinalTracker` per ordinal.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::adapters::executable::TrainingExecutable;
use crate::config::WorkerConfig;
use crate::handlers::worker::{prepare_task, run_attempt};
use crate::runtime::contract::{spec_fingerprint, SweepSpec, WorkerIdentity};
use crate::runtime::error::SweepError;
use crate::runtime::supervision::{
    Decision, OrdinalTracker, SweepLedger, SweepSummary, TransitionError, Verdict,
};

#[derive(Debug)]
pub struct SweepReport {
    pub sweep_id: String,
    pub spec_fingerprint: String,
    pub ledger: SweepLedger,
}

impl SweepReport {
    pub fn summary(&self) -> SweepSummary {
        self.ledger.summary()
    }

    pub fn is_success(&self) -> bool {
        let summary = self.summary();
        self.ledger.is_terminal() && summary.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

pub struct LocalQueue {
    config: WorkerConfig,
    executable: Arc<dyn TrainingExecutable>,
    show_progress: bool,
}

impl LocalQueue {
    pub fn new(config: WorkerConfig, executable: Arc<dyn TrainingExecutable>) -> Self {
        Self {
            config,
            executable,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let spec = self.config.spec()?;
        self.run_in_order((0..spec.completions).collect()).await
    }

    /// Runs every ordinal, admitting them in `admission_order`.
    ///
    /// The order must be a permutation of `0..completions`. Results never
    /// depend on it; only the start sequence does.
    pub async fn run_in_order(&self, admission_order: Vec<usize>) -> Result<SweepReport, SweepError> {
        self.config.validate()?;
        let spec = self.config.spec()?;
        validate_admission_order(&admission_order, spec.completions)?;
        let fingerprint = spec_fingerprint(&spec);

        info!(
            component = "local_queue",
            sweep_id = %spec.sweep_id,
            completions = spec.completions,
            parallelism_cap = spec.parallelism_cap,
            spec_fingerprint = %fingerprint,
            "sweep_started"
        );

        let progress = self.progress_bar(spec.completions);
        let semaphore = Arc::new(Semaphore::new(spec.parallelism_cap));
        let shared = Arc::new(SharedSweep {
            spec,
            config: self.config.clone(),
            fingerprint,
            executable: Arc::clone(&self.executable),
            progress: progress.clone(),
        });

        let mut running = JoinSet::new();
        for ordinal in admission_order {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|error| SweepError::WorkerAborted(error.to_string()))?;
            running.spawn(supervise_ordinal(ordinal, Arc::clone(&shared), permit));
        }

        let mut ledger = SweepLedger::new(shared.spec.completions);
        while let Some(joined) = running.join_next().await {
            let tracker =
                joined.map_err(|join_error| SweepError::WorkerAborted(join_error.to_string()))??;
            ledger.insert(tracker);
        }

        if let Some(bar) = &progress {
            bar.finish_with_message("Completed");
        }

        let report = SweepReport {
            sweep_id: shared.spec.sweep_id.clone(),
            spec_fingerprint: shared.fingerprint.clone(),
            ledger,
        };
        let summary = report.summary();
        info!(
            component = "local_queue",
            sweep_id = %report.sweep_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            in_flight = summary.in_flight,
            "sweep_completed"
        );
        Ok(report)
    }

    fn progress_bar(&self, total: usize) -> Option<ProgressBar> {
        if !self.show_progress || total == 0 {
            return None;
        }
        let bar = ProgressBar::new(total as u64);
        match ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(error) => warn!(component = "local_queue", %error, "progress_style_invalid"),
        }
        Some(bar)
    }
}

struct SharedSweep {
    spec: SweepSpec,
    config: WorkerConfig,
    fingerprint: String,
    executable: Arc<dyn TrainingExecutable>,
    progress: Option<ProgressBar>,
}

async fn supervise_ordinal(
    ordinal: usize,
    shared: Arc<SharedSweep>,
    _permit: OwnedSemaphorePermit,
) -> Result<OrdinalTracker, SweepError> {
    let policy = shared.config.supervision;
    let mut tracker = OrdinalTracker::new(ordinal);

    loop {
        match prepare_task(WorkerIdentity::new(ordinal), &shared.spec, &shared.config) {
            Ok(task) => {
                let attempt = tracker
                    .start(&task.fingerprint())
                    .map_err(supervision_error)?;
                let attempted = run_attempt(
                    &task,
                    attempt,
                    &shared.fingerprint,
                    &shared.config,
                    Arc::clone(&shared.executable),
                )
                .await;
                let recorded = match attempted {
                    Ok(outcome) => tracker.record(outcome),
                    Err(failure) => tracker.record_error(&failure),
                };
                recorded.map_err(supervision_error)?;
            }
            Err(failure) => {
                error!(
                    component = "local_queue",
                    ordinal,
                    code = failure.code(),
                    error = %failure,
                    "ordinal_unresolvable"
                );
                tracker.record_error(&failure).map_err(supervision_error)?;
            }
        }

        match tracker.settle(&policy).map_err(supervision_error)? {
            Decision::Retry { next_attempt } => {
                warn!(
                    component = "local_queue",
                    ordinal,
                    next_attempt,
                    "ordinal_retrying"
                );
            }
            Decision::Done(verdict) => {
                if let Some(bar) = &shared.progress {
                    bar.inc(1);
                }
                let attempts = tracker.outcomes().len();
                match verdict {
                    Verdict::Succeeded => {
                        info!(component = "local_queue", ordinal, attempts, "ordinal_succeeded")
                    }
                    Verdict::Failed => {
                        error!(component = "local_queue", ordinal, attempts, "ordinal_failed")
                    }
                }
                return Ok(tracker);
            }
        }
    }
}

fn supervision_error(error: TransitionError) -> SweepError {
    SweepError::WorkerAborted(error.to_string())
}

fn validate_admission_order(order: &[usize], completions: usize) -> Result<(), SweepError> {
    let mut seen = vec![false; completions];
    for &ordinal in order {
        match seen.get_mut(ordinal) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => {
                return Err(SweepError::InvalidRequest(format!(
                    "admission order lists ordinal {ordinal} more than once"
                )))
            }
            None => {
                return Err(SweepError::IndexOutOfRange {
                    ordinal,
                    len: completions,
                })
            }
        }
    }
    if order.len() != completions {
        return Err(SweepError::InvalidRequest(format!(
            "admission order covers {} of {completions} ordinals",
            order.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::adapters::executable::{Invocation, ProcessExit};
    use crate::runtime::supervision::OrdinalState;

    #[derive(Default)]
    struct CountingExecutable {
        scripted_codes: Mutex<BTreeMap<String, VecDeque<i32>>>,
        invocations: Mutex<Vec<Invocation>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingExecutable {
        fn failing(ordinal: usize, codes: Vec<i32>) -> Self {
            let executable = Self::default();
            executable
                .scripted_codes
                .lock()
                .expect("codes lock")
                .insert(ordinal.to_string(), codes.into());
            executable
        }

        fn invocations_for(&self, ordinal: usize) -> Vec<Invocation> {
            self.invocations
                .lock()
                .expect("invocations lock")
                .iter()
                .filter(|invocation| invocation.env["SWEEP_ORDINAL"] == ordinal.to_string())
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl TrainingExecutable for CountingExecutable {
        async fn run(&self, invocation: Invocation) -> Result<ProcessExit, SweepError> {
            let ordinal = invocation.env["SWEEP_ORDINAL"].clone();
            self.invocations
                .lock()
                .expect("invocations lock")
                .push(invocation);

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let code = self
                .scripted_codes
                .lock()
                .expect("codes lock")
                .get_mut(&ordinal)
                .and_then(VecDeque::pop_front)
                .unwrap_or(0);
            Ok(ProcessExit { code: Some(code) })
        }
    }

    fn config(root: &Path, values: Vec<&str>, cap: usize, retry_limit: serde_json::Value) -> WorkerConfig {
        serde_json::from_value(json!({
            "sweep": {
                "sweep_id": "lr",
                "parameter": "lr",
                "values": values,
                "parallelism_cap": cap
            },
            "workspace_root": root,
            "launch": {"program": "trainer"},
            "supervision": {"retry_limit": retry_limit, "deadline_secs": 30}
        }))
        .expect("config should parse")
    }

    #[tokio::test]
    async fn runs_every_ordinal_within_parallelism_cap() {
        let root = tempfile::tempdir().expect("tempdir");
        let executable = Arc::new(CountingExecutable::default());
        let queue = LocalQueue::new(
            config(
                root.path(),
                vec!["0.1", "0.2", "0.3", "0.4", "0.5", "0.6"],
                2,
                json!({"kind": "bounded", "max_retries": 0}),
            ),
            executable.clone(),
        );

        let report = queue
            .run_in_order(vec![5, 4, 3, 2, 1, 0])
            .await
            .expect("sweep should run");

        assert!(report.is_success());
        assert_eq!(report.summary().succeeded, 6);
        assert!(executable.peak.load(Ordering::SeqCst) <= 2);
        for ordinal in 0..6 {
            let invocations = executable.invocations_for(ordinal);
            assert_eq!(invocations.len(), 1);
            assert_eq!(
                invocations[0].env["SWEEP_WORKSPACE"],
                root.path()
                    .join(format!("sweep_id=lr/ordinal={ordinal:05}"))
                    .display()
                    .to_string()
            );
        }
    }

    #[tokio::test]
    async fn failed_ordinal_is_retried_with_identical_task() {
        let root = tempfile::tempdir().expect("tempdir");
        let executable = Arc::new(CountingExecutable::failing(1, vec![9]));
        let queue = LocalQueue::new(
            config(
                root.path(),
                vec!["0.1", "0.2"],
                2,
                json!({"kind": "bounded", "max_retries": 1}),
            ),
            executable.clone(),
        );

        let report = queue.run().await.expect("sweep should run");

        assert!(report.is_success());
        let tracker = report.ledger.tracker(1).expect("tracker");
        assert_eq!(tracker.outcomes().len(), 2);
        assert_eq!(
            tracker.state(),
            &OrdinalState::Terminal {
                verdict: Verdict::Succeeded,
                attempts: 2
            }
        );
        let invocations = executable.invocations_for(1);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0], invocations[1]);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_ordinal_failed() {
        let root = tempfile::tempdir().expect("tempdir");
        let executable = Arc::new(CountingExecutable::failing(0, vec![1, 1, 1]));
        let queue = LocalQueue::new(
            config(
                root.path(),
                vec!["0.1"],
                1,
                json!({"kind": "bounded", "max_retries": 2}),
            ),
            executable.clone(),
        );

        let report = queue.run().await.expect("sweep should run");

        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.summary().failed, 1);
        assert_eq!(executable.invocations_for(0).len(), 3);
    }

    #[tokio::test]
    async fn rejects_admission_order_that_is_not_a_permutation() {
        let root = tempfile::tempdir().expect("tempdir");
        let queue = LocalQueue::new(
            config(
                root.path(),
                vec!["0.1", "0.2"],
                1,
                json!({"kind": "unbounded"}),
            ),
            Arc::new(CountingExecutable::default()),
        );

        assert!(queue.run_in_order(vec![0, 0]).await.is_err());
        assert!(queue.run_in_order(vec![0]).await.is_err());
        assert!(matches!(
            queue.run_in_order(vec![0, 2]).await,
            Err(SweepError::IndexOutOfRange { ordinal: 2, len: 2 })
        ));
    }
}
