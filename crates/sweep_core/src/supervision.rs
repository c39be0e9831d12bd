//! Supervision state machine for sweep ordinals.
//!
//! Each ordinal moves through
//! `Pending -> Running -> {Succeeded, Failed} -> (Retrying -> Running)* -> Terminal`.
//! The policy decides whether a failed attempt is retried; retries always
//! re-run the identical resolved task, which the tracker verifies through the
//! task fingerprint.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contract::RunOutcome;
use crate::error::SweepError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// How many times a failed ordinal may be retried after its first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "max_retries", rename_all = "snake_case")]
pub enum RetryLimit {
    Bounded(u32),
    /// Retry until the ordinal succeeds; an explicit choice for long sweeps.
    Unbounded,
}

impl RetryLimit {
    pub fn allows_retry(self, retries_used: u32) -> bool {
        match self {
            Self::Bounded(max_retries) => retries_used < max_retries,
            Self::Unbounded => true,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::Bounded(DEFAULT_MAX_RETRIES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionPolicy {
    #[serde(default)]
    pub retry_limit: RetryLimit,
    /// Hard wall-clock budget per attempt. Every retry gets the full budget.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl SupervisionPolicy {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if self.deadline_secs == 0 {
            return Err(SweepError::Config(
                "supervision.deadline_secs must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            retry_limit: RetryLimit::default(),
            deadline_secs: DEFAULT_DEADLINE_SECS,
        }
    }
}

fn default_deadline_secs() -> u64 {
    DEFAULT_DEADLINE_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrdinalState {
    Pending,
    Running { attempt: u32 },
    Succeeded { attempt: u32 },
    Failed { attempt: u32, retryable: bool },
    Retrying { next_attempt: u32 },
    Terminal { verdict: Verdict, attempts: u32 },
}

impl OrdinalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { next_attempt: u32 },
    Done(Verdict),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Ordinal {ordinal} cannot {action} while in state {state:?}")]
    InvalidTransition {
        ordinal: usize,
        action: &'static str,
        state: OrdinalState,
    },

    #[error("Ordinal {ordinal} resolved to a different task on attempt {attempt}")]
    TaskDrift { ordinal: usize, attempt: u32 },

    #[error("Outcome for ordinal {found} recorded against ordinal {ordinal}")]
    ForeignOutcome { ordinal: usize, found: usize },

    #[error("Ordinal {ordinal} is not part of this sweep")]
    UnknownOrdinal { ordinal: usize },
}

#[derive(Debug, Clone)]
pub struct OrdinalTracker {
    ordinal: usize,
    state: OrdinalState,
    task_fingerprint: Option<String>,
    outcomes: Vec<RunOutcome>,
    fatal_error: Option<String>,
}

impl OrdinalTracker {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            state: OrdinalState::Pending,
            task_fingerprint: None,
            outcomes: Vec::new(),
            fatal_error: None,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn state(&self) -> &OrdinalState {
        &self.state
    }

    pub fn outcomes(&self) -> &[RunOutcome] {
        &self.outcomes
    }

    pub fn task_fingerprint(&self) -> Option<&str> {
        self.task_fingerprint.as_deref()
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Moves `Pending` or `Retrying` into `Running` and returns the attempt
    /// number. Fails if the resolved task differs from earlier attempts.
    pub fn start(&mut self, task_fingerprint: &str) -> Result<u32, TransitionError> {
        let attempt = match self.state {
            OrdinalState::Pending => 1,
            OrdinalState::Retrying { next_attempt } => next_attempt,
            _ => return Err(self.invalid("start")),
        };

        if let Some(previous) = &self.task_fingerprint {
            if previous != task_fingerprint {
                return Err(TransitionError::TaskDrift {
                    ordinal: self.ordinal,
                    attempt,
                });
            }
        } else {
            self.task_fingerprint = Some(task_fingerprint.to_string());
        }

        self.state = OrdinalState::Running { attempt };
        Ok(attempt)
    }

    pub fn record(&mut self, outcome: RunOutcome) -> Result<(), TransitionError> {
        let OrdinalState::Running { attempt } = self.state else {
            return Err(self.invalid("record an outcome"));
        };
        if outcome.ordinal != self.ordinal {
            return Err(TransitionError::ForeignOutcome {
                ordinal: self.ordinal,
                found: outcome.ordinal,
            });
        }

        self.state = match outcome.exit_state.as_error() {
            None => OrdinalState::Succeeded { attempt },
            Some(error) => OrdinalState::Failed {
                attempt,
                retryable: error.is_retryable(),
            },
        };
        self.outcomes.push(outcome);
        Ok(())
    }

    /// Records an error that prevented the attempt from producing an outcome
    /// (resolution, allocation or spawn failures).
    pub fn record_error(&mut self, error: &SweepError) -> Result<(), TransitionError> {
        let attempt = match self.state {
            OrdinalState::Running { attempt } => attempt,
            OrdinalState::Pending => 1,
            OrdinalState::Retrying { next_attempt } => next_attempt,
            _ => return Err(self.invalid("record an error")),
        };
        let retryable = error.is_retryable();
        if !retryable {
            self.fatal_error = Some(error.to_string());
        }
        self.state = OrdinalState::Failed { attempt, retryable };
        Ok(())
    }

    /// Applies the policy to a finished attempt.
    pub fn settle(&mut self, policy: &SupervisionPolicy) -> Result<Decision, TransitionError> {
        let decision = match self.state {
            OrdinalState::Succeeded { attempt } => {
                self.state = OrdinalState::Terminal {
                    verdict: Verdict::Succeeded,
                    attempts: attempt,
                };
                Decision::Done(Verdict::Succeeded)
            }
            OrdinalState::Failed { attempt, retryable }
                if retryable && policy.retry_limit.allows_retry(attempt - 1) =>
            {
                let next_attempt = attempt + 1;
                self.state = OrdinalState::Retrying { next_attempt };
                Decision::Retry { next_attempt }
            }
            OrdinalState::Failed { attempt, .. } => {
                self.state = OrdinalState::Terminal {
                    verdict: Verdict::Failed,
                    attempts: attempt,
                };
                Decision::Done(Verdict::Failed)
            }
            _ => return Err(self.invalid("settle")),
        };
        Ok(decision)
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::InvalidTransition {
            ordinal: self.ordinal,
            action,
            state: self.state.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub in_flight: usize,
}

/// Per-ordinal trackers for a whole sweep.
#[derive(Debug, Clone)]
pub struct SweepLedger {
    trackers: BTreeMap<usize, OrdinalTracker>,
}

impl SweepLedger {
    pub fn new(completions: usize) -> Self {
        Self {
            trackers: (0..completions)
                .map(|ordinal| (ordinal, OrdinalTracker::new(ordinal)))
                .collect(),
        }
    }

    pub fn tracker(&self, ordinal: usize) -> Option<&OrdinalTracker> {
        self.trackers.get(&ordinal)
    }

    pub fn tracker_mut(&mut self, ordinal: usize) -> Result<&mut OrdinalTracker, TransitionError> {
        self.trackers
            .get_mut(&ordinal)
            .ok_or(TransitionError::UnknownOrdinal { ordinal })
    }

    pub fn insert(&mut self, tracker: OrdinalTracker) {
        self.trackers.insert(tracker.ordinal(), tracker);
    }

    pub fn trackers(&self) -> impl Iterator<Item = &OrdinalTracker> {
        self.trackers.values()
    }

    /// The sweep is terminal once every ordinal has a final verdict.
    pub fn is_terminal(&self) -> bool {
        self.trackers.values().all(|tracker| tracker.state().is_terminal())
    }

    pub fn summary(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        for tracker in self.trackers.values() {
            match tracker.state() {
                OrdinalState::Terminal {
                    verdict: Verdict::Succeeded,
                    ..
                } => summary.succeeded += 1,
                OrdinalState::Terminal {
                    verdict: Verdict::Failed,
                    ..
                } => summary.failed += 1,
                _ => summary.in_flight += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use crate::contract::ExitState;

    use super::*;

    fn outcome(ordinal: usize, attempt: u32, exit_state: ExitState) -> RunOutcome {
        RunOutcome {
            ordinal,
            attempt,
            exit_state,
            duration: Duration::from_millis(10),
        }
    }

    fn policy(retry_limit: RetryLimit) -> SupervisionPolicy {
        SupervisionPolicy {
            retry_limit,
            deadline_secs: 60,
        }
    }

    #[test]
    fn success_settles_to_terminal() {
        let mut tracker = OrdinalTracker::new(0);
        let attempt = tracker.start("task-a").expect("start");
        tracker
            .record(outcome(0, attempt, ExitState::Succeeded))
            .expect("record");

        let decision = tracker
            .settle(&policy(RetryLimit::Bounded(0)))
            .expect("settle");

        assert_eq!(decision, Decision::Done(Verdict::Succeeded));
        assert_eq!(
            tracker.state(),
            &OrdinalState::Terminal {
                verdict: Verdict::Succeeded,
                attempts: 1
            }
        );
    }

    #[test]
    fn executable_failure_is_retried_until_limit() {
        let mut tracker = OrdinalTracker::new(2);
        let policy = policy(RetryLimit::Bounded(2));

        for expected_attempt in 1..=3 {
            let attempt = tracker.start("task-c").expect("start");
            assert_eq!(attempt, expected_attempt);
            tracker
                .record(outcome(
                    2,
                    attempt,
                    ExitState::ExecutableFailure { code: Some(1) },
                ))
                .expect("record");
            let decision = tracker.settle(&policy).expect("settle");
            if expected_attempt < 3 {
                assert_eq!(
                    decision,
                    Decision::Retry {
                        next_attempt: expected_attempt + 1
                    }
                );
            } else {
                assert_eq!(decision, Decision::Done(Verdict::Failed));
            }
        }

        assert_eq!(tracker.outcomes().len(), 3);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn unbounded_limit_keeps_retrying() {
        let limit = RetryLimit::Unbounded;
        assert!(limit.allows_retry(0));
        assert!(limit.allows_retry(u32::MAX - 1));
    }

    #[test]
    fn deadline_failures_are_retryable() {
        let mut tracker = OrdinalTracker::new(0);
        let attempt = tracker.start("task").expect("start");
        tracker
            .record(outcome(
                0,
                attempt,
                ExitState::DeadlineExceeded {
                    deadline: Duration::from_secs(1),
                },
            ))
            .expect("record");

        assert_eq!(
            tracker.state(),
            &OrdinalState::Failed {
                attempt: 1,
                retryable: true
            }
        );
        assert_eq!(
            tracker
                .settle(&policy(RetryLimit::Bounded(1)))
                .expect("settle"),
            Decision::Retry { next_attempt: 2 }
        );
    }

    #[test]
    fn fatal_errors_skip_retrying() {
        let mut tracker = OrdinalTracker::new(9);
        tracker
            .record_error(&SweepError::IndexOutOfRange { ordinal: 9, len: 8 })
            .expect("record error");

        let decision = tracker
            .settle(&policy(RetryLimit::Unbounded))
            .expect("settle");

        assert_eq!(decision, Decision::Done(Verdict::Failed));
        assert!(tracker
            .fatal_error()
            .expect("fatal error recorded")
            .contains("out of range"));
    }

    #[test]
    fn retry_with_a_different_task_is_rejected() {
        let mut tracker = OrdinalTracker::new(1);
        let attempt = tracker.start("task-original").expect("start");
        tracker
            .record(outcome(
                1,
                attempt,
                ExitState::ExecutableFailure { code: Some(2) },
            ))
            .expect("record");
        tracker
            .settle(&policy(RetryLimit::Bounded(1)))
            .expect("settle");

        let error = tracker.start("task-shifted").expect_err("drift should fail");
        assert_eq!(
            error,
            TransitionError::TaskDrift {
                ordinal: 1,
                attempt: 2
            }
        );
    }

    #[test]
    fn outcome_for_another_ordinal_is_rejected() {
        let mut tracker = OrdinalTracker::new(1);
        tracker.start("task").expect("start");

        let error = tracker
            .record(outcome(2, 1, ExitState::Succeeded))
            .expect_err("foreign outcome should fail");
        assert!(matches!(error, TransitionError::ForeignOutcome { .. }));
    }

    #[test]
    fn ledger_is_terminal_only_when_every_ordinal_is() {
        let mut ledger = SweepLedger::new(2);
        let policy = policy(RetryLimit::Bounded(0));

        for ordinal in 0..2 {
            assert!(!ledger.is_terminal());
            let tracker = ledger.tracker_mut(ordinal).expect("tracker");
            let attempt = tracker.start("task").expect("start");
            tracker
                .record(outcome(ordinal, attempt, ExitState::Succeeded))
                .expect("record");
            tracker.settle(&policy).expect("settle");
        }

        assert!(ledger.is_terminal());
        assert_eq!(
            ledger.summary(),
            SweepSummary {
                succeeded: 2,
                failed: 0,
                in_flight: 0
            }
        );
    }

    #[test]
    fn retry_limit_deserializes_both_forms() {
        let bounded: RetryLimit =
            serde_json::from_str(r#"{"kind":"bounded","max_retries":5}"#).expect("bounded");
        let unbounded: RetryLimit =
            serde_json::from_str(r#"{"kind":"unbounded"}"#).expect("unbounded");

        assert_eq!(bounded, RetryLimit::Bounded(5));
        assert_eq!(unbounded, RetryLimit::Unbounded);
    }

    #[test]
    fn zero_deadline_is_rejected() {
        let policy = SupervisionPolicy {
            retry_limit: RetryLimit::Unbounded,
            deadline_secs: 0,
        };
        assert!(policy.validate().is_err());
    }
}
