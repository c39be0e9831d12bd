use std::path::Path;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::{WorkerConfig, CONFIG_FILE_NAME};
use crate::handlers::sentinel::{HoldMode, FATAL_EXIT_CODE};
use crate::runtime::contract::{spec_fingerprint, ResolvedTask, CONTRACT_SCHEMA_VERSION};
use crate::runtime::error::SweepError;
use crate::runtime::sharding::compute_task_plan;
use crate::runtime::supervision::RetryLimit;

pub const RUNTIME_BINARY: &str = "sweep_runtime";
pub const WORKER_CONTAINER_NAME: &str = "worker";
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";
pub const SWEEP_ID_LABEL: &str = "sweep.dev/sweep-id";
pub const SPEC_FINGERPRINT_ANNOTATION: &str = "sweep.dev/spec-fingerprint";
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
/// `backoffLimitPerIndex` rendered for an unbounded retry policy.
pub const UNBOUNDED_BACKOFF_LIMIT: i32 = i32::MAX;
/// Extra pod lifetime past the attempt deadline, so the worker reports
/// `DeadlineExceeded` itself before the scheduler kills the pod.
pub const POD_DEADLINE_GRACE_SECS: u64 = 60;
const MAX_RESOURCE_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubmissionPlan {
    pub schema_version: String,
    pub sweep_id: String,
    pub job_name: String,
    pub spec_fingerprint: String,
    pub completions: usize,
    pub parallelism: usize,
    pub tasks: Vec<ResolvedTask>,
}

/// Validates the config and resolves every ordinal up front, so a sweep that
/// cannot be scheduled in full is rejected before anything is submitted.
pub fn plan_submission(config: &WorkerConfig) -> Result<SubmissionPlan, SweepError> {
    config.validate()?;
    let spec = config.spec()?;
    let tasks = compute_task_plan(&spec, &config.workspace_root)?;

    let plan = SubmissionPlan {
        schema_version: CONTRACT_SCHEMA_VERSION.to_string(),
        sweep_id: spec.sweep_id.clone(),
        job_name: job_name(&spec.sweep_id),
        spec_fingerprint: spec_fingerprint(&spec),
        completions: spec.completions,
        parallelism: spec.parallelism_cap.min(spec.completions),
        tasks,
    };

    info!(
        component = "submit",
        sweep_id = %plan.sweep_id,
        job_name = %plan.job_name,
        completions = plan.completions,
        parallelism = plan.parallelism,
        spec_fingerprint = %plan.spec_fingerprint,
        "submission_planned"
    );
    Ok(plan)
}

/// Renders the ConfigMap and Indexed Job for `plan` as multi-document YAML.
pub fn render_manifest(config: &WorkerConfig, plan: &SubmissionPlan) -> Result<String, SweepError> {
    let config_json = serde_json::to_string_pretty(config)
        .map_err(|error| SweepError::Config(format!("Failed to serialize config: {error}")))?;

    let config_map = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata(config, plan, &config_map_name(&plan.job_name)),
        "data": { CONFIG_FILE_NAME: config_json },
    });
    let job = render_job(config, plan)?;

    let mut documents = Vec::with_capacity(2);
    for document in [config_map, job] {
        let yaml = serde_yaml::to_string(&document)
            .map_err(|error| SweepError::Config(format!("Failed to render manifest: {error}")))?;
        documents.push(yaml);
    }
    Ok(documents.join("---\n"))
}

fn render_job(config: &WorkerConfig, plan: &SubmissionPlan) -> Result<Value, SweepError> {
    let manifest = &config.manifest;
    let supervision = &config.supervision;
    let config_path = Path::new(&manifest.config_mount_path).join(CONFIG_FILE_NAME);

    let backoff_limit_per_index = match supervision.retry_limit {
        RetryLimit::Bounded(max_retries) => i32::try_from(max_retries).unwrap_or(i32::MAX),
        RetryLimit::Unbounded => UNBOUNDED_BACKOFF_LIMIT,
    };

    let mut volumes = vec![json!({
        "name": "sweep-config",
        "configMap": { "name": config_map_name(&plan.job_name) },
    })];
    let mut volume_mounts = vec![json!({
        "name": "sweep-config",
        "mountPath": manifest.config_mount_path,
        "readOnly": true,
    })];

    if let Some(claim) = &manifest.workspace_claim {
        volumes.push(json!({
            "name": "workspace",
            "persistentVolumeClaim": { "claimName": claim },
        }));
        volume_mounts.push(json!({
            "name": "workspace",
            "mountPath": config.workspace_root,
        }));
    }

    match (&manifest.shared_cache_claim, &config.shared_cache) {
        (Some(claim), Some(cache)) => {
            volumes.push(json!({
                "name": "shared-cache",
                "persistentVolumeClaim": { "claimName": claim, "readOnly": true },
            }));
            volume_mounts.push(json!({
                "name": "shared-cache",
                "mountPath": cache,
                "readOnly": true,
            }));
        }
        (Some(_), None) => {
            return Err(SweepError::Config(
                "manifest.shared_cache_claim requires shared_cache to be set".to_string(),
            ));
        }
        _ => {}
    }

    let mut container = json!({
        "name": WORKER_CONTAINER_NAME,
        "image": manifest.image,
        "command": [
            RUNTIME_BINARY,
            "--log-format",
            "json",
            "run",
            "--config",
            config_path,
        ],
        "volumeMounts": volume_mounts,
    });
    if manifest.gpus_per_worker > 0 {
        container["resources"] = json!({
            "limits": { GPU_RESOURCE: manifest.gpus_per_worker },
        });
    }

    let mut job_spec = json!({
        "completionMode": "Indexed",
        "completions": plan.completions,
        "parallelism": plan.parallelism,
        "backoffLimitPerIndex": backoff_limit_per_index,
        "podFailurePolicy": {
            "rules": [{
                "action": "FailIndex",
                "onExitCodes": {
                    "containerName": WORKER_CONTAINER_NAME,
                    "operator": "In",
                    "values": [FATAL_EXIT_CODE],
                },
            }],
        },
        "template": {
            "metadata": { "labels": labels(config, plan) },
            "spec": {
                "restartPolicy": "Never",
                "containers": [container],
                "volumes": volumes,
            },
        },
    });
    // The pod deadline counts from pod start, so it would also cut a hold
    // short. Held pods rely on the worker's own attempt deadline.
    if config.hold == HoldMode::Exit {
        job_spec["template"]["spec"]["activeDeadlineSeconds"] =
            json!(supervision.deadline_secs.saturating_add(POD_DEADLINE_GRACE_SECS));
    }
    if manifest.queue_name.is_some() {
        // Admission controllers unsuspend the job once quota is available.
        job_spec["suspend"] = Value::Bool(true);
    }

    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": metadata(config, plan, &plan.job_name),
        "spec": job_spec,
    }))
}

fn metadata(config: &WorkerConfig, plan: &SubmissionPlan, name: &str) -> Value {
    let mut metadata = json!({
        "name": name,
        "labels": labels(config, plan),
        "annotations": { SPEC_FINGERPRINT_ANNOTATION: plan.spec_fingerprint },
    });
    if let Some(namespace) = &config.manifest.namespace {
        metadata["namespace"] = Value::String(namespace.clone());
    }
    metadata
}

fn labels(config: &WorkerConfig, plan: &SubmissionPlan) -> Value {
    let mut labels = Map::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        Value::String(RUNTIME_BINARY.replace('_', "-")),
    );
    labels.insert(SWEEP_ID_LABEL.to_string(), Value::String(plan.job_name.clone()));
    if let Some(queue) = &config.manifest.queue_name {
        labels.insert(QUEUE_NAME_LABEL.to_string(), Value::String(queue.clone()));
    }
    Value::Object(labels)
}

/// DNS-1123 compatible resource name derived from the sweep id.
pub fn job_name(sweep_id: &str) -> String {
    let mut name: String = format!("sweep-{sweep_id}")
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    name.truncate(MAX_RESOURCE_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

fn config_map_name(job_name: &str) -> String {
    let mut name = format!("{job_name}-config");
    if name.len() > MAX_RESOURCE_NAME_LEN {
        let keep = MAX_RESOURCE_NAME_LEN - "-config".len();
        name = format!("{}-config", job_name[..keep].trim_end_matches('-'));
    }
    name
}
