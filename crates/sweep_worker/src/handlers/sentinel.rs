//! Completion sentinel: reports the terminal state of a worker context and
//! optionally keeps the container alive afterwards for inspection.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::handlers::worker::WorkerReport;
use crate::runtime::error::SweepError;

pub use crate::runtime::contract::FATAL_EXIT_CODE;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HoldMode {
    #[default]
    Exit,
    /// Keep the process alive after reporting until a teardown signal.
    HoldForInspection,
}

#[derive(Debug)]
pub enum TerminalReport {
    Outcome(WorkerReport),
    Fatal(SweepError),
}

impl TerminalReport {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Outcome(report) => report.outcome.exit_state.exit_code(),
            Self::Fatal(_) => FATAL_EXIT_CODE,
        }
    }
}

/// Reports `report`, then waits for `teardown` when holding.
///
/// The terminal state is always logged before the hold starts, so a held
/// container never looks like one that is still training. Returns the exit
/// code the process should end with.
pub async fn complete<F>(report: &TerminalReport, hold: HoldMode, teardown: F) -> i32
where
    F: Future<Output = ()>,
{
    let exit_code = report.exit_code();
    match report {
        TerminalReport::Outcome(WorkerReport { task, outcome }) => {
            if outcome.is_success() {
                info!(
                    component = "sentinel",
                    sweep_id = %task.sweep_id,
                    ordinal = task.ordinal,
                    attempt = outcome.attempt,
                    exit_code,
                    "terminal_state_reported"
                );
            } else {
                error!(
                    component = "sentinel",
                    sweep_id = %task.sweep_id,
                    ordinal = task.ordinal,
                    attempt = outcome.attempt,
                    exit_code,
                    exit_state = ?outcome.exit_state,
                    "terminal_state_reported"
                );
            }
        }
        TerminalReport::Fatal(failure) => error!(
            component = "sentinel",
            exit_code,
            code = failure.code(),
            error = %failure,
            "terminal_state_reported"
        ),
    }

    if hold == HoldMode::HoldForInspection {
        warn!(
            component = "sentinel",
            exit_code,
            "holding for inspection; this is a debugging aid and not a liveness signal, \
             the terminal state above is final"
        );
        teardown.await;
        info!(component = "sentinel", exit_code, "hold_released");
    }

    exit_code
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(component = "sentinel", %error, "ctrl_c_handler_unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(component = "sentinel", %error, "sigterm_handler_unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
