//! The two built-in resolvers required by spec.md 6.

use crate::store::{ResolverContext, ResolverStageInput};

/// Consults the code-host adapter and returns `Done` when merged, else `None`.
pub fn pr_status(input: &ResolverStageInput, context: &dyn ResolverContext) -> Option<String> {
    let pr_url = input.pr_url.as_ref()?;
    let host = context.code_host()?;
    let status = host.get_pr_status(pr_url).ok()?;
    if status.merged {
        Some("Done".to_string())
    } else {
        None
    }
}

/// Inspects `refinement_type` and returns `Manual Testing` if any entry is
/// "frontend", else `Finalize`.
pub fn testing_router(input: &ResolverStageInput, _context: &dyn ResolverContext) -> Option<String> {
    if input.refinement_type.iter().any(|t| t == "frontend") {
        Some("Manual Testing".to_string())
    } else {
        Some("Finalize".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CodeHostAdapter, PrStatus};
    use anyhow::Result;

    struct FakeHost {
        merged: bool,
    }

    impl CodeHostAdapter for FakeHost {
        fn get_pr_status(&self, _pr_url: &str) -> Result<PrStatus> {
            Ok(PrStatus {
                merged: self.merged,
                ..Default::default()
            })
        }
        fn get_branch_head(&self, _branch: &str) -> Result<String> {
            Ok(String::new())
        }
        fn edit_pr_base(&self, _pr_number: u64, _target_branch: &str) -> Result<()> {
            Ok(())
        }
        fn mark_pr_ready(&self, _pr_number: u64) -> Result<()> {
            Ok(())
        }
    }

    struct FakeContext(Option<FakeHost>);

    impl ResolverContext for FakeContext {
        fn code_host(&self) -> Option<&dyn CodeHostAdapter> {
            self.0.as_ref().map(|h| h as &dyn CodeHostAdapter)
        }
    }

    fn input() -> ResolverStageInput {
        ResolverStageInput {
            id: "STAGE-1".into(),
            status: "PR Created".into(),
            ticket_id: "TICKET-1".into(),
            epic_id: "EPIC-1".into(),
            pr_url: Some("/pull/42".into()),
            pr_number: Some(42),
            worktree_branch: None,
            refinement_type: vec![],
        }
    }

    #[test]
    fn pr_status_returns_done_when_merged() {
        let context = FakeContext(Some(FakeHost { merged: true }));
        assert_eq!(pr_status(&input(), &context), Some("Done".to_string()));
    }

    #[test]
    fn pr_status_returns_none_when_not_merged() {
        let context = FakeContext(Some(FakeHost { merged: false }));
        assert_eq!(pr_status(&input(), &context), None);
    }

    #[test]
    fn pr_status_returns_none_without_adapter() {
        let context = FakeContext(None);
        assert_eq!(pr_status(&input(), &context), None);
    }

    #[test]
    fn testing_router_routes_frontend_to_manual_testing() {
        let mut stage = input();
        stage.refinement_type = vec!["frontend".to_string()];
        let context = FakeContext(None);
        assert_eq!(
            testing_router(&stage, &context),
            Some("Manual Testing".to_string())
        );
    }

    #[test]
    fn testing_router_routes_non_frontend_to_finalize() {
        let mut stage = input();
        stage.refinement_type = vec!["backend".to_string()];
        let context = FakeContext(None);
        assert_eq!(testing_router(&stage, &context), Some("Finalize".to_string()));
    }
}
