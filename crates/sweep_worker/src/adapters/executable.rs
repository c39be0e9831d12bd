use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sweep_core::contract::ResolvedTask;
use sweep_core::error::SweepError;
use sweep_core::workspace::rank_log_path;
use tokio::process::Command;

use crate::config::{LaunchConfig, LogCapture};

/// Fully built command line for one training process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub log_capture: LogCapture,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

/// Seam between worker supervision and the external training executable.
///
/// Implementations must stop the underlying process when the returned future
/// is dropped; deadlines and rendezvous failures rely on that to tear runs
/// down.
#[async_trait]
pub trait TrainingExecutable: Send + Sync {
    async fn run(&self, invocation: Invocation) -> Result<ProcessExit, SweepError>;
}

/// Spawns the invocation as an OS process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutable;

#[async_trait]
impl TrainingExecutable for ProcessExecutable {
    async fn run(&self, invocation: Invocation) -> Result<ProcessExit, SweepError> {
        let launch_error = |source| SweepError::Launch {
            program: invocation.program.clone(),
            source,
        };

        let (stdout, stderr) = match invocation.log_capture {
            LogCapture::Inherit => (Stdio::inherit(), Stdio::inherit()),
            LogCapture::Workspace => {
                let stdout = append_log(&rank_log_path(
                    &invocation.working_dir,
                    invocation.rank,
                    "stdout",
                ))
                .map_err(launch_error)?;
                let stderr = append_log(&rank_log_path(
                    &invocation.working_dir,
                    invocation.rank,
                    "stderr",
                ))
                .map_err(launch_error)?;
                (Stdio::from(stdout), Stdio::from(stderr))
            }
        };

        let status = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(launch_error)?;

        Ok(ProcessExit {
            code: status.code(),
        })
    }
}

fn append_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Builds the single-process invocation for a resolved task.
///
/// Argument order: leading arguments, fixed parameters sorted by name, the
/// swept parameter, then the output root.
pub fn build_invocation(
    task: &ResolvedTask,
    launch: &LaunchConfig,
    shared_cache: Option<&Path>,
) -> Invocation {
    let mut args = launch.leading_args.clone();
    for (name, value) in &launch.fixed_parameters {
        args.push(format!("--{name}"));
        args.push(value.to_string());
    }
    args.push(format!("--{}", task.parameter));
    args.push(task.parameter_value.to_string());
    args.push(format!("--{}", launch.output_flag.trim()));
    args.push(task.workspace_path.display().to_string());

    let mut env = launch.environment.clone();
    env.insert("SWEEP_ID".to_string(), task.sweep_id.clone());
    env.insert("SWEEP_ORDINAL".to_string(), task.ordinal.to_string());
    env.insert(
        "SWEEP_WORKSPACE".to_string(),
        task.workspace_path.display().to_string(),
    );
    if let Some(cache) = shared_cache {
        env.insert(
            "SWEEP_SHARED_CACHE".to_string(),
            cache.display().to_string(),
        );
    }

    Invocation {
        program: launch.program.clone(),
        args,
        env,
        working_dir: task.workspace_path.clone(),
        log_capture: launch.log_capture,
        rank: 0,
    }
}
