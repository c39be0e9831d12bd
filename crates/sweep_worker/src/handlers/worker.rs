use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::adapters::executable::{build_invocation, TrainingExecutable};
use crate::config::WorkerConfig;
use crate::handlers::bootstrap::run_fan_out;
use crate::runtime::contract::{
    spec_fingerprint, ExitState, ResolvedTask, RunOutcome, ScalarValue, SweepSpec,
    WorkerIdentity, OUTCOME_RECORD_SCHEMA_VERSION,
};
use crate::runtime::error::SweepError;
use crate::runtime::sharding::resolve_task;
use crate::runtime::workspace::{ensure_workspace, outcomes_path};

/// One line of `<workspace>/_sweep/outcomes.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub record_schema: String,
    pub sweep_id: String,
    pub ordinal: usize,
    pub attempt: u32,
    pub parameter: String,
    pub parameter_value: ScalarValue,
    pub exit_state: ExitState,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub task_fingerprint: String,
    pub spec_fingerprint: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub task: ResolvedTask,
    pub outcome: RunOutcome,
}

/// Resolves the task for `identity` and makes sure its workspace exists.
///
/// Safe to call again for a retried ordinal: the task is re-derived from the
/// same inputs and the existing workspace is reused untouched.
pub fn prepare_task(
    identity: WorkerIdentity,
    spec: &SweepSpec,
    config: &WorkerConfig,
) -> Result<ResolvedTask, SweepError> {
    let task = resolve_task(identity, spec, &config.workspace_root)?;
    ensure_workspace(&task.workspace_path)?;

    if let Some(cache) = &config.shared_cache {
        if !cache.is_dir() {
            return Err(SweepError::Config(format!(
                "shared_cache '{}' is not a readable directory",
                cache.display()
            )));
        }
    }

    Ok(task)
}

/// Runs one attempt of `task` under the policy deadline.
///
/// Never fails: spawn errors surface as `ExecutableFailure` without a code,
/// and an expired deadline drops the run (killing its processes) and reports
/// `DeadlineExceeded`.
pub async fn launch(
    task: &ResolvedTask,
    attempt: u32,
    config: &WorkerConfig,
    executable: Arc<dyn TrainingExecutable>,
) -> RunOutcome {
    let invocation = build_invocation(task, &config.launch, config.shared_cache.as_deref());
    let deadline = config.supervision.deadline();
    let started_at = Instant::now();

    let run = async {
        if config.distributed.is_fan_out() {
            run_fan_out(&invocation, &config.distributed, executable).await
        } else {
            let exit = executable.run(invocation.clone()).await?;
            Ok(if exit.success() {
                ExitState::Succeeded
            } else {
                ExitState::ExecutableFailure { code: exit.code }
            })
        }
    };

    let exit_state = match timeout(deadline, run).await {
        Ok(Ok(state)) => state,
        Ok(Err(launch_error)) => {
            warn!(
                component = "worker",
                ordinal = task.ordinal,
                attempt,
                error = %launch_error,
                code = launch_error.code(),
                "worker_launch_failed"
            );
            ExitState::ExecutableFailure { code: None }
        }
        Err(_) => ExitState::DeadlineExceeded { deadline },
    };

    RunOutcome {
        ordinal: task.ordinal,
        attempt,
        exit_state,
        duration: started_at.elapsed(),
    }
}

/// Launches one attempt, appends its outcome record and logs the result.
pub async fn run_attempt(
    task: &ResolvedTask,
    attempt: u32,
    spec_fingerprint: &str,
    config: &WorkerConfig,
    executable: Arc<dyn TrainingExecutable>,
) -> Result<RunOutcome, SweepError> {
    info!(
        component = "worker",
        sweep_id = %task.sweep_id,
        ordinal = task.ordinal,
        attempt,
        parameter = %task.parameter,
        value = %task.parameter_value,
        workspace = %task.workspace_path.display(),
        processes = config.distributed.processes_per_worker,
        "worker_started"
    );

    let outcome = launch(task, attempt, config, executable).await;
    record_outcome(task, &outcome, spec_fingerprint)?;

    let duration_ms = outcome.duration.as_millis();
    match outcome.exit_state.as_error() {
        None => info!(
            component = "worker",
            sweep_id = %task.sweep_id,
            ordinal = task.ordinal,
            attempt,
            duration_ms,
            "worker_completed"
        ),
        Some(failure) => error!(
            component = "worker",
            sweep_id = %task.sweep_id,
            ordinal = task.ordinal,
            attempt,
            duration_ms,
            code = failure.code(),
            retryable = failure.is_retryable(),
            error = %failure,
            "worker_failed"
        ),
    }

    Ok(outcome)
}

/// Full worker context for one scheduler-assigned ordinal.
///
/// When `attempt` is not supplied it is derived from the outcome history
/// already in the workspace, so a rescheduled worker continues the count.
pub async fn run_worker_context(
    identity: WorkerIdentity,
    config: &WorkerConfig,
    executable: Arc<dyn TrainingExecutable>,
    attempt: Option<u32>,
) -> Result<WorkerReport, SweepError> {
    let spec = config.spec()?;
    let fingerprint = spec_fingerprint(&spec);

    let task = prepare_task(identity, &spec, config).inspect_err(|failure| {
        error!(
            component = "worker",
            sweep_id = %spec.sweep_id,
            ordinal = identity.ordinal,
            code = failure.code(),
            error = %failure,
            "worker_failed"
        );
    })?;

    let attempt = match attempt {
        Some(attempt) => attempt,
        None => recorded_attempts(&task.workspace_path)? + 1,
    };

    let outcome = run_attempt(&task, attempt, &fingerprint, config, executable).await?;
    Ok(WorkerReport { task, outcome })
}

pub fn record_outcome(
    task: &ResolvedTask,
    outcome: &RunOutcome,
    spec_fingerprint: &str,
) -> Result<(), SweepError> {
    let path = outcomes_path(&task.workspace_path);
    let record = OutcomeRecord {
        record_schema: OUTCOME_RECORD_SCHEMA_VERSION.to_string(),
        sweep_id: task.sweep_id.clone(),
        ordinal: task.ordinal,
        attempt: outcome.attempt,
        parameter: task.parameter.clone(),
        parameter_value: task.parameter_value.clone(),
        exit_state: outcome.exit_state.clone(),
        exit_code: outcome.exit_state.exit_code(),
        duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        task_fingerprint: task.fingerprint(),
        spec_fingerprint: spec_fingerprint.to_string(),
        recorded_at: chrono::Utc::now().to_rfc3339(),
    };

    let line = serde_json::to_string(&record).map_err(|error| {
        SweepError::Config(format!("Failed to serialize outcome record: {error}"))
    })?;
    let workspace_error = |source| SweepError::Workspace {
        path: path.clone(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(workspace_error)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(workspace_error)?;
    writeln!(file, "{line}").map_err(workspace_error)?;
    Ok(())
}

pub fn read_outcome_records(workspace: &Path) -> Result<Vec<OutcomeRecord>, SweepError> {
    let path = outcomes_path(workspace);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(SweepError::Workspace { path, source }),
    };

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|error| {
                SweepError::Config(format!(
                    "Malformed outcome record in '{}': {error}",
                    path.display()
                ))
            })
        })
        .collect()
}

pub fn recorded_attempts(workspace: &Path) -> Result<u32, SweepError> {
    let records = read_outcome_records(workspace)?;
    Ok(records
        .iter()
        .map(|record| record.attempt)
        .max()
        .unwrap_or(0))
}
