//! Pipeline document and stage graph
//!
//! The document is YAML:
//!
//! ```yaml
//! fail_fast: false
//! stages:
//!   - name: build
//!     labels: [linux]
//!     steps:
//!       - name: compile
//!         commands: [cargo build]
//!   - name: deploy
//!     depends_on: [build]
//!     steps:
//!       - name: ship
//!         commands: [./deploy.sh]
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use gantry_core::domain::execution::{Stage, StageStatus, Step, StepStatus};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDocument {
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Overrides the document-level setting
    #[serde(default)]
    pub fail_fast: Option<bool>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl PipelineDocument {
    /// Parses and validates a document
    pub fn parse(source: &str) -> Result<Self> {
        let doc: PipelineDocument = serde_yaml::from_str(source)
            .map_err(|e| Error::ConfigInvalid(format!("malformed pipeline document: {}", e)))?;
        doc.topological_order()?;
        Ok(doc)
    }

    /// Stage indices in dependency order (Kahn's algorithm).
    ///
    /// Rejects empty graphs, duplicate names, undefined dependencies, stages
    /// without steps and cycles.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        if self.stages.is_empty() {
            return Err(Error::ConfigInvalid("pipeline has no stages".to_string()));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!("stage {} has no name", i + 1)));
            }
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate stage name {}",
                    stage.name
                )));
            }
            if stage.steps.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "stage {} has no steps",
                    stage.name
                )));
            }
            let mut step_names = HashSet::new();
            for step in &stage.steps {
                if !step_names.insert(step.name.as_str()) {
                    return Err(Error::ConfigInvalid(format!(
                        "duplicate step name {} in stage {}",
                        step.name, stage.name
                    )));
                }
            }
        }

        let mut indegree = vec![0usize; self.stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for (i, stage) in self.stages.iter().enumerate() {
            let unique: HashSet<&str> = stage.depends_on.iter().map(String::as_str).collect();
            for dep in unique {
                let Some(&d) = index.get(dep) else {
                    return Err(Error::ConfigInvalid(format!(
                        "stage {} depends on undefined stage {}",
                        stage.name, dep
                    )));
                };
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.stages.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.stages.len() {
            let cyclic: Vec<&str> = (0..self.stages.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.stages[i].name.as_str())
                .collect();
            return Err(Error::ConfigInvalid(format!(
                "dependency cycle among stages: {}",
                cyclic.join(", ")
            )));
        }
        Ok(order)
    }

    /// Builds the stage and step rows of a new execution.
    ///
    /// Stages without dependencies start `pending`, the rest `waiting`.
    pub fn materialize(&self, execution_id: Uuid, now: DateTime<Utc>) -> (Vec<Stage>, Vec<Step>) {
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut steps = Vec::new();

        for (i, def) in self.stages.iter().enumerate() {
            let stage_id = Uuid::new_v4();
            let mut depends_on = def.depends_on.clone();
            depends_on.sort();
            depends_on.dedup();

            stages.push(Stage {
                id: stage_id,
                execution_id,
                number: i as i32 + 1,
                name: def.name.clone(),
                status: if depends_on.is_empty() {
                    StageStatus::Pending
                } else {
                    StageStatus::Waiting
                },
                depends_on,
                labels: def.labels.clone(),
                lease: None,
                reclaims: 0,
                cancel_requested: false,
                fail_fast: def.fail_fast.unwrap_or(self.fail_fast),
                error: None,
                started_at: None,
                finished_at: None,
                updated_at: now,
            });

            for (j, step) in def.steps.iter().enumerate() {
                steps.push(Step {
                    id: Uuid::new_v4(),
                    stage_id,
                    execution_id,
                    number: j as i32 + 1,
                    name: step.name.clone(),
                    image: step.image.clone(),
                    commands: step.commands.clone(),
                    env: step.env.clone(),
                    secrets: step.secrets.clone(),
                    status: StepStatus::Pending,
                    exit_code: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                });
            }
        }

        (stages, steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIAMOND: &str = r#"
stages:
  - name: deploy
    depends_on: [build, lint]
    steps:
      - name: ship
        commands: ["./deploy.sh"]
  - name: build
    labels: [linux]
    steps:
      - name: compile
        commands: ["cargo build"]
  - name: lint
    fail_fast: true
    steps:
      - name: clippy
        commands: ["cargo clippy"]
"#;

    #[test]
    fn test_parse_and_order() {
        let doc = PipelineDocument::parse(DIAMOND).unwrap();
        let order = doc.topological_order().unwrap();
        let names: Vec<&str> = order.iter().map(|&i| doc.stages[i].name.as_str()).collect();
        assert_eq!(names.last(), Some(&"deploy"));
    }

    #[test]
    fn test_materialize_initial_states() {
        let doc = PipelineDocument::parse(DIAMOND).unwrap();
        let (stages, steps) = doc.materialize(Uuid::new_v4(), Utc::now());

        let by_name = |n: &str| stages.iter().find(|s| s.name == n).unwrap();
        assert_eq!(by_name("build").status, StageStatus::Pending);
        assert_eq!(by_name("lint").status, StageStatus::Pending);
        assert_eq!(by_name("deploy").status, StageStatus::Waiting);
        assert_eq!(by_name("deploy").depends_on, vec!["build", "lint"]);
        assert!(by_name("lint").fail_fast);
        assert!(!by_name("build").fail_fast);
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let yaml = r#"
stages:
  - name: a
    depends_on: [b]
    steps: [{ name: x, commands: [make] }]
  - name: b
    depends_on: [a]
    steps: [{ name: x, commands: [make] }]
"#;
        let err = PipelineDocument::parse(yaml).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_undefined_dependency_is_rejected() {
        let yaml = r#"
stages:
  - name: a
    depends_on: [ghost]
    steps: [{ name: x, commands: [make] }]
"#;
        let err = PipelineDocument::parse(yaml).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_structural_errors() {
        assert!(PipelineDocument::parse("stages: []").is_err());
        assert!(PipelineDocument::parse("stages: [{ name: a, steps: [] }]").is_err());
        assert!(
            PipelineDocument::parse(
                "stages: [{ name: a, steps: [{ name: x }] }, { name: a, steps: [{ name: y }] }]"
            )
            .is_err()
        );
        assert!(PipelineDocument::parse("stages: [{ name: a, steps: [{ name: x }, { name: x }] }]").is_err());
        assert!(PipelineDocument::parse("not: [valid").is_err());
    }
}
