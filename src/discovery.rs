//! Discovery (C5, spec.md 4.5).

use crate::model::ids::Status;
use crate::model::Stage;
use crate::pipeline::PipelineModel;

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub ready_stages: Vec<Stage>,
    pub blocked_count: usize,
    pub in_progress_count: usize,
    pub to_convert_count: usize,
}

/// A stage is ready when its status has a bound skill (not a resolver), its
/// dependencies are at least soft-resolved, and its lock is free. Ordering is
/// descending priority, then ascending due date (nulls last), then ascending id
/// (spec.md 4.5).
pub fn discover(
    candidates: Vec<Stage>,
    pipeline: &PipelineModel,
    dependency_satisfied: impl Fn(&Stage) -> bool,
    is_locked: impl Fn(&Stage) -> bool,
    limit: usize,
) -> DiscoveryResult {
    let mut blocked_count = 0;
    let mut in_progress_count = 0;
    let mut to_convert_count = 0;
    let mut ready: Vec<Stage> = Vec::new();

    for stage in candidates {
        if stage.session_active {
            in_progress_count += 1;
            continue;
        }
        if pipeline.skill_for(&stage.status).is_none() {
            // Resolver-driven or terminal: discovery never returns these
            // (spec.md 8 invariant 7).
            to_convert_count += 1;
            continue;
        }
        if !dependency_satisfied(&stage) {
            blocked_count += 1;
            continue;
        }
        if is_locked(&stage) {
            blocked_count += 1;
            continue;
        }
        ready.push(stage);
    }

    ready.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (&a.due_date, &b.due_date) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });

    ready.truncate(limit);

    DiscoveryResult {
        ready_stages: ready,
        blocked_count,
        in_progress_count,
        to_convert_count,
    }
}

pub fn status_has_skill(pipeline: &PipelineModel, status: &Status) -> bool {
    pipeline.skill_for(status).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ids::{EpicId, StageId, TicketId};
    use crate::pipeline::{Advancement, Phase, PipelineModel};

    fn pipeline() -> PipelineModel {
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
                    name: "pr".into(),
                    status: Status::from("PR Created"),
                    advancement: Advancement::Resolver("pr-status".into()),
                    transitions_to: vec![Status::from("Done")],
                },
            ],
        )
        .unwrap()
    }

    fn stage(id: &str, status: &str, priority: i64) -> Stage {
        Stage {
            id: StageId::from(id),
            ticket_id: TicketId::from("TICKET-1"),
            epic_id: EpicId::from("EPIC-1"),
            title: "t".into(),
            status: Status::from(status),
            worktree_branch: None,
            pr_url: None,
            pr_number: None,
            session_active: false,
            locked_at: None,
            locked_by: None,
            priority,
            due_date: None,
            depends_on: vec![],
            pending_merge_parents: vec![],
            is_draft: false,
            rebase_conflict: false,
            refinement_type: vec![],
            file_path: Default::default(),
        }
    }

    #[test]
    fn resolver_status_never_returned() {
        let pipeline = pipeline();
        let stages = vec![stage("STAGE-1", "PR Created", 0)];
        let result = discover(stages, &pipeline, |_| true, |_| false, 10);
        assert!(result.ready_stages.is_empty());
        assert_eq!(result.to_convert_count, 1);
    }

    #[test]
    fn ordering_by_priority_then_id() {
        let pipeline = pipeline();
        let stages = vec![
            stage("STAGE-B", "Design", 1),
            stage("STAGE-A", "Design", 5),
            stage("STAGE-C", "Design", 5),
        ];
        let result = discover(stages, &pipeline, |_| true, |_| false, 10);
        let ids: Vec<&str> = result
            .ready_stages
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["STAGE-A", "STAGE-C", "STAGE-B"]);
    }

    #[test]
    fn limit_truncates() {
        let pipeline = pipeline();
        let stages = vec![
            stage("STAGE-A", "Design", 0),
            stage("STAGE-B", "Design", 0),
        ];
        let result = discover(stages, &pipeline, |_| true, |_| false, 1);
        assert_eq!(result.ready_stages.len(), 1);
    }

    #[test]
    fn unsatisfied_dependency_counts_as_blocked() {
        let pipeline = pipeline();
        let stages = vec![stage("STAGE-A", "Design", 0)];
        let result = discover(stages, &pipeline, |_| false, |_| false, 10);
        assert!(result.ready_stages.is_empty());
        assert_eq!(result.blocked_count, 1);
    }
}
