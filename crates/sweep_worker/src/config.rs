//! Explicit worker configuration.
//!
//! Every knob a worker context needs arrives through [`WorkerConfig`], loaded
//! from one JSON file and validated up front. Library code never reads
//! process-wide environment variables; the binary maps the scheduler's
//! completion index onto `--ordinal` and nothing else.

use std::collections::BTreeMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sweep_core::contract::{normalize_request, ScalarValue, SweepRequest, SweepSpec};
use sweep_core::error::SweepError;
use sweep_core::supervision::SupervisionPolicy;

use crate::handlers::sentinel::HoldMode;

pub const DEFAULT_OUTPUT_FLAG: &str = "saving_path";
pub const DEFAULT_MASTER_PORT: u16 = 29500;
pub const DEFAULT_BARRIER_PORT: u16 = 29400;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_IMAGE: &str = "sweep-runtime:latest";
pub const DEFAULT_CONFIG_MOUNT_PATH: &str = "/etc/sweep";
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub sweep: SweepRequest,
    pub workspace_root: PathBuf,
    /// Read-only mount of shared pretrained artifacts.
    #[serde(default)]
    pub shared_cache: Option<PathBuf>,
    pub launch: LaunchConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub supervision: SupervisionPolicy,
    #[serde(default)]
    pub hold: HoldMode,
    #[serde(default)]
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchConfig {
    pub program: String,
    /// Arguments placed before any `--name value` pair, e.g. `["main.py", "train"]`.
    #[serde(default)]
    pub leading_args: Vec<String>,
    /// Sweep-independent parameters passed to every ordinal.
    #[serde(default)]
    pub fixed_parameters: BTreeMap<String, ScalarValue>,
    #[serde(default = "default_output_flag")]
    pub output_flag: String,
    #[serde(default)]
    pub log_capture: LogCapture,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogCapture {
    /// Child output goes to the worker's own stdout/stderr.
    #[default]
    Inherit,
    /// Child output is appended under `<workspace>/_sweep/logs/`.
    Workspace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedConfig {
    #[serde(default = "default_processes_per_worker")]
    pub processes_per_worker: usize,
    /// Pinned port handed to the executable's collective backend.
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    /// Loopback port of the startup barrier; `0` picks an ephemeral port.
    #[serde(default = "default_barrier_port")]
    pub barrier_port: u16,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl DistributedConfig {
    pub fn is_fan_out(&self) -> bool {
        self.processes_per_worker > 1
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn barrier_endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.barrier_port))
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            processes_per_worker: default_processes_per_worker(),
            master_port: default_master_port(),
            barrier_port: default_barrier_port(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

/// Settings only used when rendering the scheduler manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Admission queue the job is submitted to.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Persistent volume claim mounted read-write at `workspace_root`.
    #[serde(default)]
    pub workspace_claim: Option<String>,
    /// Persistent volume claim mounted read-only at `shared_cache`.
    #[serde(default)]
    pub shared_cache_claim: Option<String>,
    #[serde(default)]
    pub gpus_per_worker: u32,
    #[serde(default = "default_config_mount_path")]
    pub config_mount_path: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            namespace: None,
            queue_name: None,
            workspace_claim: None,
            shared_cache_claim: None,
            gpus_per_worker: 0,
            config_mount_path: default_config_mount_path(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            SweepError::Config(format!("Failed to read '{}': {error}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            SweepError::Config(format!("Malformed config '{}': {error}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn spec(&self) -> Result<SweepSpec, SweepError> {
        normalize_request(self.sweep.clone())
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        let spec = self.spec()?;

        if self.workspace_root.as_os_str().is_empty() {
            return Err(SweepError::Config(
                "workspace_root cannot be empty".to_string(),
            ));
        }

        if let Some(cache) = &self.shared_cache {
            if cache.starts_with(&self.workspace_root) || self.workspace_root.starts_with(cache) {
                return Err(SweepError::Config(
                    "shared_cache and workspace_root must not overlap".to_string(),
                ));
            }
        }

        self.validate_launch(&spec)?;
        self.validate_distributed()?;
        self.supervision.validate()
    }

    fn validate_launch(&self, spec: &SweepSpec) -> Result<(), SweepError> {
        let launch = &self.launch;
        if launch.program.trim().is_empty() {
            return Err(SweepError::Config(
                "launch.program cannot be empty".to_string(),
            ));
        }

        let output_flag = launch.output_flag.trim();
        if output_flag.is_empty() || output_flag.starts_with('-') {
            return Err(SweepError::Config(
                "launch.output_flag must be a bare flag name".to_string(),
            ));
        }
        if output_flag == spec.parameter {
            return Err(SweepError::Config(format!(
                "launch.output_flag '{output_flag}' collides with the swept parameter"
            )));
        }

        for name in launch.fixed_parameters.keys() {
            if name.trim().is_empty() || name.starts_with('-') {
                return Err(SweepError::Config(format!(
                    "fixed parameter '{name}' must be a bare flag name"
                )));
            }
            if *name == spec.parameter || name == output_flag {
                return Err(SweepError::Config(format!(
                    "fixed parameter '{name}' is owned by the launcher and cannot be fixed"
                )));
            }
        }

        Ok(())
    }

    fn validate_distributed(&self) -> Result<(), SweepError> {
        let distributed = &self.distributed;
        if distributed.processes_per_worker == 0 {
            return Err(SweepError::Config(
                "distributed.processes_per_worker must be a positive integer".to_string(),
            ));
        }
        if !distributed.is_fan_out() {
            return Ok(());
        }
        if distributed.master_port == 0 {
            return Err(SweepError::Config(
                "distributed.master_port must be pinned to a non-zero port".to_string(),
            ));
        }
        if distributed.master_port == distributed.barrier_port {
            return Err(SweepError::Config(
                "distributed.master_port and distributed.barrier_port must differ".to_string(),
            ));
        }
        if distributed.startup_timeout_secs == 0 {
            return Err(SweepError::Config(
                "distributed.startup_timeout_secs must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_output_flag() -> String {
    DEFAULT_OUTPUT_FLAG.to_string()
}

fn default_processes_per_worker() -> usize {
    1
}

fn default_master_port() -> u16 {
    DEFAULT_MASTER_PORT
}

fn default_barrier_port() -> u16 {
    DEFAULT_BARRIER_PORT
}

fn default_startup_timeout_secs() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_config_mount_path() -> String {
    DEFAULT_CONFIG_MOUNT_PATH.to_string()
}
