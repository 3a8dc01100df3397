//! Pipeline configuration loader (spec.md 6, "Pipeline configuration (YAML,
//! persisted)").
//!
//! Split into `types` (pure `Deserialize` data) and `validation` (structural
//! checks), mirroring the teacher's `plan::schema::{types, validation}` split.

pub mod types {
    use std::collections::HashMap;

    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    pub struct WorkflowConfig {
        pub workflow: Workflow,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Workflow {
        pub entry_phase: String,
        pub phases: Vec<PhaseConfig>,
        #[serde(default)]
        pub defaults: HashMap<String, String>,
        /// Not consumed by the core (spec.md 6); kept only so a `workflow.yaml`
        /// carrying a `jira` section still deserializes.
        #[serde(default)]
        pub jira: Option<serde_yaml::Value>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct PhaseConfig {
        pub name: String,
        pub status: String,
        #[serde(default)]
        pub skill: Option<String>,
        #[serde(default)]
        pub resolver: Option<String>,
        #[serde(default)]
        pub transitions_to: Vec<String>,
    }
}

pub mod validation {
    use thiserror::Error;

    use super::types::PhaseConfig;

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("phase '{0}' declares neither 'skill' nor 'resolver'")]
        MissingAdvancement(String),
        #[error("phase '{0}' declares both 'skill' and 'resolver'")]
        AmbiguousAdvancement(String),
    }

    pub fn validate_phase(phase: &PhaseConfig) -> Result<(), ConfigError> {
        match (&phase.skill, &phase.resolver) {
            (None, None) => Err(ConfigError::MissingAdvancement(phase.name.clone())),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousAdvancement(phase.name.clone())),
            _ => Ok(()),
        }
    }
}

use std::path::Path;

use anyhow::{Context, Result};

use crate::pipeline::{Advancement, Phase, PipelineModel};
use types::WorkflowConfig;
use validation::validate_phase;

/// Loads `workflow.yaml` and builds the `PipelineModel` the rest of the crate
/// consumes. Config loading itself is a named non-goal as a *feature* (spec.md 1)
/// in the sense that the core never re-derives pipeline semantics from anything but
/// the resulting `PipelineModel` — but an orchestrator that cannot start without a
/// hand-assembled model in code is not a complete crate, so the loader is real.
pub fn load_pipeline(path: &Path) -> Result<PipelineModel> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: WorkflowConfig = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let mut phases = Vec::with_capacity(config.workflow.phases.len());
    for phase in &config.workflow.phases {
        validate_phase(phase)?;
        let advancement = match (&phase.skill, &phase.resolver) {
            (Some(skill), None) => Advancement::Skill(skill.clone()),
            (None, Some(resolver)) => Advancement::Resolver(resolver.clone()),
            _ => unreachable!("validate_phase rejects this combination"),
        };
        phases.push(Phase {
            name: phase.name.clone(),
            status: phase.status.clone().into(),
            advancement,
            transitions_to: phase.transitions_to.iter().cloned().map(Into::into).collect(),
        });
    }

    PipelineModel::new(config.workflow.entry_phase, phases).context("building pipeline model")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_two_phase_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.yaml");
        std::fs::write(
            &path,
            r#"
workflow:
  entry_phase: design
  phases:
    - name: design
      status: Design
      skill: design-skill
      transitions_to: [Build]
    - name: build
      status: Build
      skill: build-skill
      transitions_to: [Complete]
"#,
        )
        .unwrap();

        let model = load_pipeline(&path).unwrap();
        assert_eq!(model.entry_phase(), "design");
        assert_eq!(model.skill_for(&"Design".into()), Some("design-skill"));
    }

    #[test]
    fn rejects_phase_with_both_skill_and_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.yaml");
        std::fs::write(
            &path,
            r#"
workflow:
  entry_phase: design
  phases:
    - name: design
      status: Design
      skill: design-skill
      resolver: pr-status
      transitions_to: []
"#,
        )
        .unwrap();

        assert!(load_pipeline(&path).is_err());
    }
}
