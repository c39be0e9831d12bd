#![allow(dead_code)]

use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use sweep_worker::config::WorkerConfig;

/// Shell prologue that parses `--lr <value> --saving_path <dir>` into `$lr`
/// and `$out`, ignoring any other flags.
pub const PARSE_ARGS: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --lr) lr="$2"; shift 2 ;;
    --saving_path) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

pub const LR_VALUES: [&str; 4] = ["0.001", "0.01", "0.1", "1.0"];

/// Builds a sweep over `lr` whose training executable is `/bin/sh -c <body>`.
pub fn shell_sweep(root: &Path, body: &str, parallelism_cap: usize, retry_limit: Value) -> Value {
    json!({
        "sweep": {
            "sweep_id": "lr-sweep",
            "parameter": "lr",
            "values": LR_VALUES,
            "parallelism_cap": parallelism_cap
        },
        "workspace_root": root,
        "launch": {
            "program": "/bin/sh",
            "leading_args": ["-c", format!("{PARSE_ARGS}\n{body}"), "trainer"],
            "log_capture": "workspace"
        },
        "supervision": {
            "retry_limit": retry_limit,
            "deadline_secs": 10
        }
    })
}

pub fn worker_config(raw: Value) -> WorkerConfig {
    let config: WorkerConfig = serde_json::from_value(raw).expect("config should parse");
    config.validate().expect("config should validate");
    config
}

pub fn write_config(dir: &Path, raw: &Value) -> std::path::PathBuf {
    let path = dir.join("config.json");
    fs::write(&path, raw.to_string()).expect("write config");
    path
}

pub fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path)
        .unwrap_or_else(|error| panic!("read {}: {error}", path.display()))
        .trim()
        .to_string()
}
