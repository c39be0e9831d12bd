use std::collections::BTreeSet;
use std::path::Path;

use crate::contract::{ResolvedTask, ScalarValue, SweepSpec, WorkerIdentity};
use crate::error::SweepError;
use crate::workspace::workspace_path;

/// Selects the sweep value owned by `ordinal`.
///
/// Pure: the same ordinal and value list always resolve to the same value, so
/// a retried worker reproduces its experiment exactly. Ordinals past the end
/// of the list are an error; indices never wrap.
pub fn resolve(ordinal: usize, values: &[ScalarValue]) -> Result<&ScalarValue, SweepError> {
    values.get(ordinal).ok_or(SweepError::IndexOutOfRange {
        ordinal,
        len: values.len(),
    })
}

pub fn resolve_task(
    identity: WorkerIdentity,
    spec: &SweepSpec,
    workspace_root: &Path,
) -> Result<ResolvedTask, SweepError> {
    if spec.completions != spec.len() {
        return Err(SweepError::SweepSizeMismatch {
            completions: spec.completions,
            values: spec.len(),
        });
    }

    let parameter_value = resolve(identity.ordinal, &spec.values)?;
    Ok(ResolvedTask {
        sweep_id: spec.sweep_id.clone(),
        ordinal: identity.ordinal,
        parameter: spec.parameter.clone(),
        parameter_value: parameter_value.clone(),
        workspace_path: workspace_path(workspace_root, &spec.sweep_id, identity.ordinal),
    })
}

/// Resolves every ordinal of the sweep, in ordinal order.
pub fn compute_task_plan(
    spec: &SweepSpec,
    workspace_root: &Path,
) -> Result<Vec<ResolvedTask>, SweepError> {
    let tasks = (0..spec.completions)
        .map(|ordinal| resolve_task(WorkerIdentity::new(ordinal), spec, workspace_root))
        .collect::<Result<Vec<_>, _>>()?;

    validate_plan(spec, &tasks)?;
    Ok(tasks)
}

fn validate_plan(spec: &SweepSpec, tasks: &[ResolvedTask]) -> Result<(), SweepError> {
    if tasks.len() != spec.completions {
        return Err(SweepError::SweepSizeMismatch {
            completions: spec.completions,
            values: tasks.len(),
        });
    }

    let mut workspaces = BTreeSet::new();
    for (expected_ordinal, task) in tasks.iter().enumerate() {
        if task.ordinal != expected_ordinal {
            return Err(SweepError::InvalidRequest(format!(
                "Task plan is not dense: expected ordinal {expected_ordinal}, found {}",
                task.ordinal
            )));
        }
        if !workspaces.insert(task.workspace_path.clone()) {
            return Err(SweepError::InvalidRequest(format!(
                "Workspace '{}' is shared by more than one ordinal",
                task.workspace_path.display()
            )));
        }
    }

    Ok(())
}
