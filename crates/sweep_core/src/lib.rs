//! Deterministic sweep primitives shared by every worker context.
//!
//! This crate owns the sweep contract, index resolution, workspace path
//! derivation and the supervision state machine. It intentionally excludes
//! process spawning, async runtimes and scheduler integration; those live in
//! `sweep_worker`.

pub mod contract;
pub mod error;
pub mod sharding;
pub mod supervision;
pub mod workspace;

pub use contract::{
    normalize_request, spec_fingerprint, ExitState, ResolvedTask, RunOutcome, ScalarValue,
    SweepRequest, SweepSpec, WorkerIdentity,
};
pub use error::SweepError;
pub use sharding::{compute_task_plan, resolve, resolve_task};
pub use supervision::{OrdinalState, OrdinalTracker, RetryLimit, SupervisionPolicy, SweepLedger};
pub use workspace::{allocate, workspace_path};
