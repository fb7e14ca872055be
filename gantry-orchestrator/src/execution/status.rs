//! Status aggregation
//!
//! Pure functions deriving stage and execution outcomes from their children
//! and deciding which waiting stages may run.

use std::collections::HashMap;
use uuid::Uuid;

use gantry_core::domain::execution::{ExecutionStatus, Stage, StageStatus, StepStatus};

/// Outcome of a stage whose steps all finished, or `None` while any runs.
///
/// Any `error` wins, then any `failure`, then any `canceled`; skipped steps
/// count as passing.
pub fn stage_outcome(steps: &[StepStatus]) -> Option<StageStatus> {
    if steps.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    let outcome = if steps.contains(&StepStatus::Error) {
        StageStatus::Error
    } else if steps.contains(&StepStatus::Failure) {
        StageStatus::Failure
    } else if steps.contains(&StepStatus::Canceled) {
        // Partially canceled work never counts as a success
        StageStatus::Canceled
    } else {
        StageStatus::Success
    };
    Some(outcome)
}

/// Outcome of an execution whose stages all finished, or `None` while any runs.
///
/// `error` if any stage errored, else `failure` if any stage failed or was
/// skipped, else `canceled` if any stage was canceled, else `success`.
pub fn execution_outcome(stages: &[StageStatus]) -> Option<ExecutionStatus> {
    if stages.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    let outcome = if stages.contains(&StageStatus::Error) {
        ExecutionStatus::Error
    } else if stages
        .iter()
        .any(|s| matches!(s, StageStatus::Failure | StageStatus::Skipped))
    {
        ExecutionStatus::Failure
    } else if stages.contains(&StageStatus::Canceled) {
        ExecutionStatus::Canceled
    } else {
        ExecutionStatus::Success
    };
    Some(outcome)
}

/// New statuses for waiting stages whose dependencies settled.
///
/// A waiting stage becomes `pending` once every dependency succeeded and
/// `skipped` as soon as any dependency ends in anything else. Skips cascade
/// through the graph in a single call.
pub fn resolve_waiting(stages: &[Stage]) -> Vec<(Uuid, StageStatus)> {
    let mut status: HashMap<&str, StageStatus> =
        stages.iter().map(|s| (s.name.as_str(), s.status)).collect();
    let mut changes = Vec::new();

    loop {
        let mut changed = false;
        for stage in stages {
            if status.get(stage.name.as_str()) != Some(&StageStatus::Waiting) {
                continue;
            }
            let deps: Vec<StageStatus> = stage
                .depends_on
                .iter()
                .map(|d| status.get(d.as_str()).copied().unwrap_or(StageStatus::Error))
                .collect();

            let next = if deps.iter().any(|d| d.is_terminal() && !d.is_success()) {
                StageStatus::Skipped
            } else if deps.iter().all(|d| d.is_success()) {
                StageStatus::Pending
            } else {
                continue;
            };
            status.insert(stage.name.as_str(), next);
            changes.push((stage.id, next));
            changed = true;
        }
        if !changed {
            return changes;
        }
    }
}

/// Whether a settled stage triggers fail-fast handling
pub fn trips_fail_fast(stage: &Stage) -> bool {
    stage.fail_fast && matches!(stage.status, StageStatus::Failure | StageStatus::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stage(name: &str, deps: &[&str], status: StageStatus) -> Stage {
        Stage {
            id: Uuid::new_v4(),
            execution_id: Uuid::nil(),
            number: 1,
            name: name.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            labels: vec![],
            status,
            lease: None,
            reclaims: 0,
            cancel_requested: false,
            fail_fast: false,
            error: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_stage_outcome() {
        use StepStatus::*;
        assert_eq!(stage_outcome(&[Success, Running]), None);
        assert_eq!(stage_outcome(&[Success, Skipped]), Some(StageStatus::Success));
        assert_eq!(stage_outcome(&[Failure, Error]), Some(StageStatus::Error));
        assert_eq!(stage_outcome(&[Success, Failure, Skipped]), Some(StageStatus::Failure));
        assert_eq!(stage_outcome(&[Canceled, Canceled]), Some(StageStatus::Canceled));
        assert_eq!(stage_outcome(&[Success, Canceled]), Some(StageStatus::Canceled));
    }

    #[test]
    fn test_execution_outcome() {
        use StageStatus::*;
        assert_eq!(execution_outcome(&[Success, Pending]), None);
        assert_eq!(execution_outcome(&[Success, Success]), Some(ExecutionStatus::Success));
        assert_eq!(
            execution_outcome(&[Success, Failure, Skipped]),
            Some(ExecutionStatus::Failure)
        );
        assert_eq!(execution_outcome(&[Failure, Error]), Some(ExecutionStatus::Error));
        assert_eq!(execution_outcome(&[Success, Canceled]), Some(ExecutionStatus::Canceled));
    }

    #[test]
    fn test_dependents_wait_for_all_dependencies() {
        let stages = vec![
            stage("build", &[], StageStatus::Success),
            stage("lint", &[], StageStatus::Running),
            stage("deploy", &["build", "lint"], StageStatus::Waiting),
        ];
        assert!(resolve_waiting(&stages).is_empty());

        let stages = vec![
            stage("build", &[], StageStatus::Success),
            stage("lint", &[], StageStatus::Success),
            stage("deploy", &["build", "lint"], StageStatus::Waiting),
        ];
        assert_eq!(resolve_waiting(&stages), vec![(stages[2].id, StageStatus::Pending)]);
    }

    #[test]
    fn test_skips_cascade() {
        let stages = vec![
            stage("build", &[], StageStatus::Success),
            stage("lint", &[], StageStatus::Failure),
            stage("deploy", &["build", "lint"], StageStatus::Waiting),
            stage("notify", &["deploy"], StageStatus::Waiting),
        ];
        let changes = resolve_waiting(&stages);
        assert_eq!(
            changes,
            vec![
                (stages[2].id, StageStatus::Skipped),
                (stages[3].id, StageStatus::Skipped)
            ]
        );
    }

    #[test]
    fn test_failed_dependency_skips_even_while_siblings_run() {
        let stages = vec![
            stage("build", &[], StageStatus::Running),
            stage("lint", &[], StageStatus::Error),
            stage("deploy", &["build", "lint"], StageStatus::Waiting),
        ];
        assert_eq!(resolve_waiting(&stages), vec![(stages[2].id, StageStatus::Skipped)]);
    }
}
