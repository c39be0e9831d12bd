use std::path::PathBuf;
use std::time::Duration;

/// Failure taxonomy shared by submission, worker contexts and supervision.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Invalid sweep request: {0}")]
    InvalidRequest(String),

    #[error("Sweep declares {completions} completions for {values} values; they must match")]
    SweepSizeMismatch { completions: usize, values: usize },

    #[error("Ordinal {ordinal} is out of range for {len} sweep values")]
    IndexOutOfRange { ordinal: usize, len: usize },

    #[error("Workspace '{}' could not be allocated: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Rendezvous timed out: {arrived} of {expected} processes checked in")]
    RendezvousTimeout { arrived: usize, expected: usize },

    #[error("Training executable failed{}", exit_code_suffix(*code))]
    ExecutableFailure { code: Option<i32> },

    #[error("Deadline of {}s exceeded", deadline.as_secs())]
    DeadlineExceeded { deadline: Duration },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task aborted: {0}")]
    WorkerAborted(String),
}

impl SweepError {
    /// Whether a supervisor may retry the ordinal after this error.
    ///
    /// Resolution, allocation and configuration errors describe a sweep that
    /// retrying cannot fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RendezvousTimeout { .. }
                | Self::ExecutableFailure { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Launch { .. }
        )
    }

    /// Stable machine-readable code used in outcome records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::SweepSizeMismatch { .. } => "sweep_size_mismatch",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::Workspace { .. } => "workspace_error",
            Self::Launch { .. } => "launch_error",
            Self::RendezvousTimeout { .. } => "rendezvous_timeout",
            Self::ExecutableFailure { .. } => "executable_failure",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Config(_) => "config_error",
            Self::WorkerAborted(_) => "worker_aborted",
        }
    }
}

fn exit_code_suffix(code: Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => " without an exit code".to_string(),
    }
}
