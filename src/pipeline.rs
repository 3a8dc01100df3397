//! Pipeline model (C1, spec.md 4.1).
//!
//! A pipeline configuration enumerates ordered phases. Each phase binds a status to
//! exactly one advancement mechanism (a skill or a resolver) and a set of legal
//! successor statuses.

use std::collections::{HashMap, HashSet};

use crate::model::ids::{Status, COMPLETE, DONE, IN_PROGRESS, NOT_STARTED, SKIPPED};

/// Statuses that satisfy a dependency edge without the parent being `Complete`
/// (spec.md 4.10, 9's open question). A single constant consumed by both the sync
/// collaborator's soft-resolution logic and `derived_status` below, per spec.md's
/// instruction that the two rules must stay in sync.
pub const SOFT_SATISFYING_STATUSES: &[&str] = &["PR Created", "Addressing Comments"];

pub fn is_soft_satisfying(status: &Status) -> bool {
    SOFT_SATISFYING_STATUSES.contains(&status.as_str())
}

#[derive(Debug, Clone)]
pub enum Advancement {
    Skill(String),
    Resolver(String),
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub status: Status,
    pub advancement: Advancement,
    pub transitions_to: Vec<Status>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("entry phase '{0}' not declared in workflow.phases")]
    UnknownEntryPhase(String),
    #[error("phase '{0}' transitions to undeclared, non-terminal status '{1}'")]
    DanglingTransition(String, String),
}

#[derive(Debug, Clone)]
pub struct PipelineModel {
    entry_phase: String,
    phases: Vec<Phase>,
    skill_by_status: HashMap<Status, String>,
    resolver_by_status: HashMap<Status, String>,
}

impl PipelineModel {
    pub fn new(entry_phase: String, phases: Vec<Phase>) -> Result<Self, PipelineError> {
        if !phases.iter().any(|p| p.name == entry_phase) {
            return Err(PipelineError::UnknownEntryPhase(entry_phase));
        }

        let mut skill_by_status = HashMap::new();
        let mut resolver_by_status = HashMap::new();
        let declared: HashSet<&Status> = phases.iter().map(|p| &p.status).collect();

        for phase in &phases {
            match &phase.advancement {
                Advancement::Skill(name) => {
                    skill_by_status.insert(phase.status.clone(), name.clone());
                }
                Advancement::Resolver(name) => {
                    resolver_by_status.insert(phase.status.clone(), name.clone());
                }
            }
            for target in &phase.transitions_to {
                if !declared.contains(target) && !is_terminal(target) {
                    return Err(PipelineError::DanglingTransition(
                        phase.name.clone(),
                        target.to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            entry_phase,
            phases,
            skill_by_status,
            resolver_by_status,
        })
    }

    pub fn entry_phase(&self) -> &str {
        &self.entry_phase
    }

    /// Every legal status: phase-declared plus the reserved set (spec.md 4.1).
    pub fn statuses(&self) -> HashSet<Status> {
        let mut set: HashSet<Status> = self.phases.iter().map(|p| p.status.clone()).collect();
        for reserved in [NOT_STARTED, COMPLETE, SKIPPED, IN_PROGRESS] {
            set.insert(Status::from(reserved));
        }
        set
    }

    pub fn skill_for(&self, status: &Status) -> Option<&str> {
        self.skill_by_status.get(status).map(String::as_str)
    }

    pub fn resolver_for(&self, status: &Status) -> Option<&str> {
        self.resolver_by_status.get(status).map(String::as_str)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

/// `Complete`, `Done`, `Skipped` are terminal (spec.md 4.1).
pub fn is_terminal(status: &Status) -> bool {
    matches!(status.as_str(), COMPLETE | DONE | SKIPPED)
}

/// Derived-status function shared by the exit-gate runner (spec.md 4.7 step 3) and
/// epic derivation (step 4): empty maps to `None`; all `Complete` maps to
/// `Complete`; all `Not Started` maps to `Not Started`; anything else is
/// `In Progress`.
pub fn derived_status<'a, I: IntoIterator<Item = &'a Status>>(statuses: I) -> Option<Status> {
    let mut any = false;
    let mut all_complete = true;
    let mut all_not_started = true;
    for status in statuses {
        any = true;
        if status.as_str() != COMPLETE {
            all_complete = false;
        }
        if status.as_str() != NOT_STARTED {
            all_not_started = false;
        }
    }
    if !any {
        None
    } else if all_complete {
        Some(Status::from(COMPLETE))
    } else if all_not_started {
        Some(Status::from(NOT_STARTED))
    } else {
        Some(Status::from(IN_PROGRESS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PipelineModel {
        PipelineModel::new(
            "design".into(),
            vec![
                Phase {
                    name: "design".into(),
                    status: Status::from("Design"),
                    advancement: Advancement::Skill("design-skill".into()),
                    transitions_to: vec![Status::from("Build")],
                },
                Phase {
                    name: "build".into(),
                    status: Status::from("Build"),
                    advancement: Advancement::Skill("build-skill".into()),
                    transitions_to: vec![Status::from(COMPLETE)],
                },
                Phase {
                    name: "pr".into(),
                    status: Status::from("PR Created"),
                    advancement: Advancement::Resolver("pr-status".into()),
                    transitions_to: vec![Status::from(DONE)],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn skill_and_resolver_are_mutually_exclusive_lookups() {
        let m = model();
        assert_eq!(m.skill_for(&Status::from("Design")), Some("design-skill"));
        assert_eq!(m.resolver_for(&Status::from("Design")), None);
        assert_eq!(m.resolver_for(&Status::from("PR Created")), Some("pr-status"));
        assert_eq!(m.skill_for(&Status::from("PR Created")), None);
    }

    #[test]
    fn unknown_entry_phase_rejected() {
        let err = PipelineModel::new("nope".into(), vec![]);
        assert!(matches!(err, Err(PipelineError::UnknownEntryPhase(_))));
    }

    #[test]
    fn dangling_transition_rejected() {
        let err = PipelineModel::new(
            "design".into(),
            vec![Phase {
                name: "design".into(),
                status: Status::from("Design"),
                advancement: Advancement::Skill("x".into()),
                transitions_to: vec![Status::from("Nonexistent")],
            }],
        );
        assert!(matches!(err, Err(PipelineError::DanglingTransition(_, _))));
    }

    #[test]
    fn derived_status_rules() {
        assert_eq!(derived_status(std::iter::empty()), None);
        let complete = Status::from(COMPLETE);
        let not_started = Status::from(NOT_STARTED);
        let in_progress = Status::from("Design");
        assert_eq!(
            derived_status([&complete, &complete]),
            Some(Status::from(COMPLETE))
        );
        assert_eq!(
            derived_status([&not_started, &not_started]),
            Some(Status::from(NOT_STARTED))
        );
        assert_eq!(
            derived_status([&complete, &in_progress]),
            Some(Status::from(IN_PROGRESS))
        );
    }

    #[test]
    fn soft_satisfying_constant_matches_addressing_and_pr_created() {
        assert!(is_soft_satisfying(&Status::from("PR Created")));
        assert!(is_soft_satisfying(&Status::from("Addressing Comments")));
        assert!(!is_soft_satisfying(&Status::from(COMPLETE)));
    }
}
