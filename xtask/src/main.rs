use std::fs;
use std::path::Path;
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the sweep launcher workspace",
    long_about = "A unified CLI for running local sweeps, rendering job manifests,\n\
                  packaging the worker runtime, and CI checks."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a whole sweep locally under the in-process supervisor
    LocalSweep {
        /// Worker config file
        #[arg(long)]
        config: String,
    },
    /// Validate a sweep and render its job manifest
    Manifest {
        /// Worker config file
        #[arg(long)]
        config: String,
        /// Output file path
        #[arg(long, default_value = "sweep-job.yaml")]
        output: String,
    },
    /// Run CI checks (fmt, clippy, tests)
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
    /// Build the worker runtime binary and stage it for the container image
    Package {
        /// Compilation target triple for the runtime binary
        #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        /// Build profile used for binaries
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy, and tests
    Check,
    /// Render the manifest for the demo sweep
    Manifest,
    /// Run check + manifest
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }

    fn as_cargo_flag(self) -> Option<&'static str> {
        match self {
            Self::Debug => None,
            Self::Release => Some("--release"),
        }
    }
}

const RUNTIME_PACKAGE: &str = "sweep_worker";
const RUNTIME_BINARY: &str = "sweep_runtime";
const DEMO_CONFIG: &str = "demos/max_delta_sweep.json";
const DIST_DIR: &str = "dist";

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .expect("failed to execute cargo")
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn run_runtime(runtime_args: &[&str]) {
    let mut args = vec!["run", "-p", RUNTIME_PACKAGE, "--bin", RUNTIME_BINARY, "--"];
    args.extend_from_slice(runtime_args);
    run_cargo(&args);
}

fn package_runtime(target: &str, profile: BuildProfile) {
    ensure_rust_target_installed(target);

    step("Build worker runtime binary");
    let mut cargo_args = vec![
        "build",
        "-p",
        RUNTIME_PACKAGE,
        "--target",
        target,
        "--bin",
        RUNTIME_BINARY,
    ];
    if let Some(flag) = profile.as_cargo_flag() {
        cargo_args.push(flag);
    }
    run_cargo(&cargo_args);

    step("Stage runtime binary");
    let binary = binary_name(RUNTIME_BINARY, target);
    let built = Path::new("target")
        .join(target)
        .join(profile.dir_name())
        .join(&binary);
    if !built.exists() {
        panic!("expected runtime binary at '{}'", built.display());
    }

    let dist_dir = Path::new(DIST_DIR);
    fs::create_dir_all(dist_dir).expect("failed to create dist directory");
    let staged = dist_dir.join(&binary);
    fs::copy(&built, &staged).expect("failed to stage runtime binary");

    eprintln!("\nStaged artifact:\n- {}", staged.display());
}

fn ensure_rust_target_installed(target: &str) {
    let output = Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output();

    let output = match output {
        Ok(value) => value,
        Err(error) => {
            eprintln!(
                "warning: failed to run `rustup target list --installed` ({error}); continuing without target preflight"
            );
            return;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "failed to list installed rust targets; run `rustup target list --installed` manually. details: {}",
            stderr.trim()
        );
    }

    let installed = String::from_utf8_lossy(&output.stdout);
    if !installed.lines().any(|line| line.trim() == target) {
        panic!(
            "required rust target `{target}` is not installed. install it with `rustup target add {target}` and re-run `cargo run -p xtask -- package`"
        );
    }
}

fn binary_name(bin_name: &str, target: &str) -> String {
    if target.contains("windows") {
        format!("{bin_name}.exe")
    } else {
        bin_name.to_string()
    }
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_check() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);

    step("Test sweep_core");
    run_cargo(&["test", "-p", "sweep_core"]);

    step("Test sweep_worker");
    run_cargo(&["test", "-p", RUNTIME_PACKAGE]);
}

fn ci_manifest() {
    step("Render demo sweep manifest");
    run_runtime(&[
        "--log-format",
        "pretty",
        "submit",
        "--config",
        DEMO_CONFIG,
        "--output",
        "target/demo-sweep-job.yaml",
    ]);
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::LocalSweep { config } => {
            run_runtime(&["--log-format", "pretty", "local", "--config", &config]);
        }
        Commands::Manifest { config, output } => {
            run_runtime(&["submit", "--config", &config, "--output", &output]);
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Check => ci_check(),
                CiJob::Manifest => ci_manifest(),
                CiJob::All => {
                    ci_check();
                    ci_manifest();
                }
            }
            eprintln!("\nCI job passed.");
        }
        Commands::Package { target, profile } => {
            package_runtime(&target, profile);
        }
    }
}
