use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use sweep_worker::adapters::executable::ProcessExecutable;
use sweep_worker::adapters::rendezvous::check_in;
use sweep_worker::config::WorkerConfig;
use sweep_worker::handlers::local_queue::LocalQueue;
use sweep_worker::handlers::sentinel::{
    complete, shutdown_signal, HoldMode, TerminalReport, FATAL_EXIT_CODE,
};
use sweep_worker::handlers::submit::{plan_submission, render_manifest};
use sweep_worker::handlers::worker::run_worker_context;
use sweep_worker::logging::{init_logging, LogFormat};
use sweep_worker::runtime::contract::WorkerIdentity;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "sweep_runtime", about = "Launch and supervise hyperparameter sweep workers")]
struct Cli {
    #[arg(long, global = true, value_enum, env = "SWEEP_LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker context for one ordinal
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Defaults to the scheduler's completion index
        #[arg(long, env = "JOB_COMPLETION_INDEX")]
        ordinal: usize,
        /// Attempt number; derived from the workspace's outcome history when omitted
        #[arg(long)]
        attempt: Option<u32>,
    },
    /// Validate a sweep, print its task plan and render the job manifest
    Submit {
        #[arg(long)]
        config: PathBuf,
        /// Write the manifest here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the whole sweep on this machine
    Local {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        no_progress: bool,
    },
    /// Join a rendezvous barrier and wait for release
    CheckIn {
        #[arg(long, env = "SWEEP_RENDEZVOUS")]
        endpoint: SocketAddr,
        #[arg(long, env = "RANK")]
        rank: usize,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(init_error) = init_logging(cli.log_format) {
        eprintln!("failed to initialise logging: {init_error}");
    }

    let result = match cli.command {
        Command::Run {
            config,
            ordinal,
            attempt,
        } => Ok(run_worker(&config, ordinal, attempt).await),
        Command::Submit { config, output } => submit(&config, output.as_deref()),
        Command::Local {
            config,
            no_progress,
        } => run_local(&config, !no_progress).await,
        Command::CheckIn {
            endpoint,
            rank,
            timeout_secs,
        } => check_in(endpoint, rank, Duration::from_secs(timeout_secs))
            .await
            .map(|()| 0)
            .with_context(|| format!("rank {rank} failed to join rendezvous at {endpoint}")),
    };

    match result {
        Ok(code) => exit_code(code),
        Err(failure) => {
            error!(error = %format!("{failure:#}"), "command_failed");
            exit_code(FATAL_EXIT_CODE)
        }
    }
}

async fn run_worker(config_path: &Path, ordinal: usize, attempt: Option<u32>) -> i32 {
    let config = match WorkerConfig::load(config_path) {
        Ok(config) => config,
        Err(failure) => {
            let report = TerminalReport::Fatal(failure);
            return complete(&report, HoldMode::Exit, async {}).await;
        }
    };

    let executable = Arc::new(ProcessExecutable);
    let report =
        match run_worker_context(WorkerIdentity::new(ordinal), &config, executable, attempt).await {
            Ok(report) => TerminalReport::Outcome(report),
            Err(failure) => TerminalReport::Fatal(failure),
        };
    complete(&report, config.hold, shutdown_signal()).await
}

fn submit(config_path: &Path, output: Option<&Path>) -> anyhow::Result<i32> {
    let config = WorkerConfig::load(config_path)?;
    let plan = plan_submission(&config)?;
    let manifest = render_manifest(&config, &plan)?;

    match output {
        Some(path) => {
            fs::write(path, &manifest)
                .with_context(|| format!("failed to write manifest to '{}'", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        None => print!("{manifest}"),
    }
    Ok(0)
}

async fn run_local(config_path: &Path, show_progress: bool) -> anyhow::Result<i32> {
    let config = WorkerConfig::load(config_path)?;
    let report = LocalQueue::new(config, Arc::new(ProcessExecutable))
        .with_progress(show_progress)
        .run()
        .await?;

    let summary = report.summary();
    println!(
        "{}",
        json!({
            "sweep_id": report.sweep_id,
            "spec_fingerprint": report.spec_fingerprint,
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "in_flight": summary.in_flight,
        })
    );
    Ok(report.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
