#![cfg(unix)]

mod support;

use std::process::Command;

use serde_json::json;
use sweep_worker::handlers::worker::read_outcome_records;
use sweep_worker::runtime::workspace::workspace_path;

use support::{read_trimmed, shell_sweep, write_config};

fn runtime() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sweep_runtime"));
    command.args(["--log-format", "json"]);
    command
}

#[test]
fn run_reports_the_executable_exit_code_for_its_ordinal() {
    let root = tempfile::tempdir().expect("tempdir");
    let raw = shell_sweep(
        root.path(),
        r#"echo "$lr" > "$out/result.txt"; [ "$lr" = "0.1" ] && exit 6; exit 0"#,
        4,
        json!({"kind": "unbounded"}),
    );
    let config_path = write_config(root.path(), &raw);

    let succeeded = runtime()
        .args(["run", "--config"])
        .arg(&config_path)
        .args(["--ordinal", "1"])
        .status()
        .expect("run ordinal 1");
    let failed = runtime()
        .args(["run", "--config"])
        .arg(&config_path)
        .env("JOB_COMPLETION_INDEX", "2")
        .status()
        .expect("run ordinal 2");

    assert_eq!(succeeded.code(), Some(0));
    assert_eq!(failed.code(), Some(6));

    let failed_workspace = workspace_path(root.path(), "lr-sweep", 2);
    assert_eq!(read_trimmed(&failed_workspace.join("result.txt")), "0.1");
    let records = read_outcome_records(&failed_workspace).expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exit_code, 6);
}

#[test]
fn executable_usage_error_exits_as_an_ordinary_failure() {
    let root = tempfile::tempdir().expect("tempdir");
    let raw = shell_sweep(root.path(), "exit 2", 4, json!({"kind": "unbounded"}));
    let config_path = write_config(root.path(), &raw);

    let status = runtime()
        .args(["run", "--config"])
        .arg(&config_path)
        .args(["--ordinal", "0"])
        .status()
        .expect("run ordinal 0");

    assert_eq!(status.code(), Some(1));
    let records =
        read_outcome_records(&workspace_path(root.path(), "lr-sweep", 0)).expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exit_code, 1);
}

#[test]
fn run_rejects_out_of_range_ordinal_with_configuration_exit_code() {
    let root = tempfile::tempdir().expect("tempdir");
    let raw = shell_sweep(root.path(), "exit 0", 4, json!({"kind": "unbounded"}));
    let config_path = write_config(root.path(), &raw);

    let status = runtime()
        .args(["run", "--config"])
        .arg(&config_path)
        .args(["--ordinal", "4"])
        .status()
        .expect("run ordinal 4");

    assert_eq!(status.code(), Some(2));
    assert!(!workspace_path(root.path(), "lr-sweep", 4).exists());
}

#[test]
fn submit_renders_an_indexed_job_manifest() {
    let root = tempfile::tempdir().expect("tempdir");
    let raw = shell_sweep(root.path(), "exit 0", 2, json!({"kind": "bounded", "max_retries": 5}));
    let config_path = write_config(root.path(), &raw);
    let manifest_path = root.path().join("job.yaml");

    let output = runtime()
        .args(["submit", "--config"])
        .arg(&config_path)
        .arg("--output")
        .arg(&manifest_path)
        .output()
        .expect("submit");

    assert!(output.status.success());
    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).expect("plan json");
    assert_eq!(plan["completions"], 4);
    assert_eq!(plan["tasks"].as_array().expect("tasks").len(), 4);

    let manifest = read_trimmed(&manifest_path);
    assert!(manifest.contains("completionMode: Indexed"));
    assert!(manifest.contains("backoffLimitPerIndex: 5"));
    assert!(manifest.contains("parallelism: 2"));
}
