use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SweepError;

pub const CONTRACT_SCHEMA_VERSION: &str = "v1";
pub const OUTCOME_RECORD_SCHEMA_VERSION: &str = "v1";
pub const MAX_SWEEP_VALUES: usize = 10_000;
pub const MAX_SWEEP_ID_LEN: usize = 63;

/// Exit code reserved for failures that happen before any attempt could run.
/// Schedulers treat it as non-retryable, so no attempt outcome may report it.
pub const FATAL_EXIT_CODE: i32 = 2;

/// One swept hyperparameter value.
///
/// Wraps a JSON string, number or boolean. Numbers are rendered the way
/// serde_json prints them: `1.0` stays `1.0`, but exponent forms are
/// normalized (`1e-4` becomes `0.0001`). Submit values as strings to pass an
/// exact spelling through to the executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ScalarValue(Value);

impl ScalarValue {
    pub fn as_json(&self) -> &Value {
        &self.0
    }
}

impl TryFrom<Value> for ScalarValue {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(Self(value)),
            Value::Null => Err("sweep values cannot be null".to_string()),
            Value::Array(_) | Value::Object(_) => {
                Err("sweep values must be scalars (string, number or boolean)".to_string())
            }
        }
    }
}

impl From<ScalarValue> for Value {
    fn from(value: ScalarValue) -> Self {
        value.0
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self(Value::from(value))
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(text) => f.write_str(text),
            other => write!(f, "{other}"),
        }
    }
}

/// Sweep as submitted, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepRequest {
    pub sweep_id: String,
    pub parameter: String,
    pub values: Vec<Value>,
    pub parallelism_cap: usize,
    #[serde(default)]
    pub completions: Option<usize>,
}

/// Validated, immutable sweep definition shared read-only by every worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepSpec {
    pub sweep_id: String,
    pub parameter: String,
    pub values: Vec<ScalarValue>,
    pub parallelism_cap: usize,
    pub completions: usize,
}

impl SweepSpec {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerIdentity {
    pub ordinal: usize,
}

impl WorkerIdentity {
    pub fn new(ordinal: usize) -> Self {
        Self { ordinal }
    }
}

/// Everything one worker context needs, derived purely from its identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedTask {
    pub sweep_id: String,
    pub ordinal: usize,
    pub parameter: String,
    pub parameter_value: ScalarValue,
    pub workspace_path: PathBuf,
}

impl ResolvedTask {
    pub fn fingerprint(&self) -> String {
        contract_fingerprint(self)
    }
}

/// Terminal state of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitState {
    Succeeded,
    ExecutableFailure { code: Option<i32> },
    RendezvousTimeout { arrived: usize, expected: usize },
    DeadlineExceeded { deadline: Duration },
}

impl ExitState {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Process exit code a worker context should report for this state.
    ///
    /// Never [`FATAL_EXIT_CODE`]: every attempt outcome stays retryable from
    /// the scheduler's point of view, so a child exiting with that code is
    /// reported as a plain failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::ExecutableFailure { code: Some(code) }
                if *code != 0 && *code != FATAL_EXIT_CODE =>
            {
                *code
            }
            _ => 1,
        }
    }

    pub fn as_error(&self) -> Option<SweepError> {
        match self {
            Self::Succeeded => None,
            Self::ExecutableFailure { code } => Some(SweepError::ExecutableFailure { code: *code }),
            Self::RendezvousTimeout { arrived, expected } => Some(SweepError::RendezvousTimeout {
                arrived: *arrived,
                expected: *expected,
            }),
            Self::DeadlineExceeded { deadline } => Some(SweepError::DeadlineExceeded {
                deadline: *deadline,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub ordinal: usize,
    pub attempt: u32,
    pub exit_state: ExitState,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_state.is_success()
    }
}

pub fn normalize_request(payload: SweepRequest) -> Result<SweepSpec, SweepError> {
    let sweep_id = payload.sweep_id.trim().to_string();
    validate_sweep_id(&sweep_id)?;

    let parameter = payload.parameter.trim().to_string();
    if parameter.is_empty() {
        return Err(SweepError::InvalidRequest(
            "parameter cannot be empty".to_string(),
        ));
    }
    if parameter.starts_with('-') || parameter.contains(char::is_whitespace) {
        return Err(SweepError::InvalidRequest(format!(
            "parameter '{parameter}' must be a bare flag name"
        )));
    }

    if payload.values.is_empty() {
        return Err(SweepError::InvalidRequest(
            "values must be a non-empty list".to_string(),
        ));
    }
    if payload.values.len() > MAX_SWEEP_VALUES {
        return Err(SweepError::InvalidRequest(format!(
            "values exceeds MAX_SWEEP_VALUES={MAX_SWEEP_VALUES}"
        )));
    }

    let mut values = Vec::with_capacity(payload.values.len());
    for (index, raw) in payload.values.into_iter().enumerate() {
        let value = ScalarValue::try_from(raw)
            .map_err(|message| SweepError::InvalidRequest(format!("values[{index}]: {message}")))?;
        values.push(value);
    }

    if payload.parallelism_cap == 0 {
        return Err(SweepError::InvalidRequest(
            "parallelism_cap must be a positive integer".to_string(),
        ));
    }

    let completions = payload.completions.unwrap_or(values.len());
    if completions == 0 {
        return Err(SweepError::InvalidRequest(
            "completions must be a positive integer".to_string(),
        ));
    }
    if completions != values.len() {
        return Err(SweepError::SweepSizeMismatch {
            completions,
            values: values.len(),
        });
    }

    Ok(SweepSpec {
        sweep_id,
        parameter,
        values,
        parallelism_cap: payload.parallelism_cap,
        completions,
    })
}

fn validate_sweep_id(sweep_id: &str) -> Result<(), SweepError> {
    if sweep_id.is_empty() {
        return Err(SweepError::InvalidRequest(
            "sweep_id cannot be empty".to_string(),
        ));
    }
    if sweep_id.len() > MAX_SWEEP_ID_LEN {
        return Err(SweepError::InvalidRequest(format!(
            "sweep_id exceeds {MAX_SWEEP_ID_LEN} characters"
        )));
    }
    if sweep_id == "." || sweep_id == ".." {
        return Err(SweepError::InvalidRequest(
            "sweep_id cannot be a relative path component".to_string(),
        ));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !sweep_id.chars().all(allowed) {
        return Err(SweepError::InvalidRequest(format!(
            "sweep_id '{sweep_id}' may only contain ASCII letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

pub fn spec_fingerprint(spec: &SweepSpec) -> String {
    contract_fingerprint(spec)
}

pub fn contract_fingerprint(value: impl Serialize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stable_contract_json(value));
    format!("{:x}", hasher.finalize())
}

/// Compact JSON used for fingerprinting.
///
/// Contract types are plain structs with string map keys, so serialization
/// cannot fail for them. A value that does fail still hashes to a stable
/// marker carrying the error instead of panicking.
pub fn stable_contract_json(value: impl Serialize) -> String {
    serde_json::to_string(&value)
        .unwrap_or_else(|error| format!("{{\"unserializable\":\"{error}\"}}"))
}
