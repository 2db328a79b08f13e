//! The reconcile pass.
//!
//! Each pass re-reads the resource, then walks the action list. Before an
//! eligible action runs, the live resource version is compared against the
//! one the pass started from; any drift ends the pass early with a short
//! requeue so the next pass works on fresh state. Since actions themselves
//! write status, at most one status-writing action runs per pass.

use std::sync::Arc;
use std::time::Duration;

use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use crds::IntegrationPlatform;

use crate::context::ControllerContext;
use crate::error::ControllerError;

/// Requeue after a failed pass (fetch or action error).
pub const REQUEUE_ERROR: Duration = Duration::from_secs(10);

/// Requeue after the resource changed mid-pass.
pub const REQUEUE_STALE: Duration = Duration::from_secs(5);

/// Steady-state requeue; drives version checks, startup probes and the
/// backup schedule.
pub const REQUEUE_STEADY: Duration = Duration::from_secs(15);

/// Reconcile one IntegrationPlatform.
pub async fn reconcile(
    platform: Arc<IntegrationPlatform>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ControllerError> {
    let name = platform
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig("platform has no name".to_string()))?;

    let store = &ctx.action_ctx.store;
    let Some(snapshot) = store.get(name).await? else {
        debug!(name, "platform is gone, waiting for changes");
        return Ok(Action::await_change());
    };
    let start_version = snapshot.metadata.resource_version.clone();

    let mut actions = ctx.actions.lock().await;
    for action in actions.iter_mut() {
        if !action.can_execute(&snapshot) {
            continue;
        }

        // somebody (possibly an earlier action) wrote the resource since
        // this pass started; work on fresh state instead
        let Some(latest) = store.get(name).await? else {
            debug!(name, "platform deleted mid-pass");
            return Ok(Action::await_change());
        };
        if latest.metadata.resource_version != start_version {
            debug!(name, action = action.name(), "resource changed mid-pass");
            return Ok(Action::requeue(REQUEUE_STALE));
        }

        info!(name, action = action.name(), phase = %snapshot.phase(), "executing action");
        action.execute(&ctx.action_ctx, &snapshot).await?;
    }

    Ok(Action::requeue(REQUEUE_STEADY))
}

/// Requeue policy for failed passes.
pub fn error_policy(
    platform: Arc<IntegrationPlatform>,
    error: &ControllerError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    warn!(
        name = platform.metadata.name.as_deref().unwrap_or("<unknown>"),
        %error,
        "reconcile failed"
    );
    Action::requeue(REQUEUE_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use mockall::Sequence;

    use crds::PlatformPhase;

    use crate::actions::{ActionContext, OperatorAction};
    use crate::status::MockPlatformStore;
    use crate::test_utils;

    struct CountingAction {
        executions: Arc<AtomicU32>,
    }

    #[async_trait]
    impl OperatorAction for CountingAction {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn can_execute(&self, _platform: &IntegrationPlatform) -> bool {
            true
        }

        async fn execute(
            &mut self,
            _ctx: &ActionContext,
            _platform: &IntegrationPlatform,
        ) -> Result<(), ControllerError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context_with(store: MockPlatformStore, executions: Arc<AtomicU32>) -> Arc<ControllerContext> {
        let actions: Vec<Box<dyn OperatorAction>> =
            vec![Box::new(CountingAction { executions })];
        Arc::new(ControllerContext::new(
            actions,
            test_utils::action_ctx_with_store(store),
        ))
    }

    #[tokio::test]
    async fn pass_aborts_when_the_resource_changed_underneath() {
        let mut store = MockPlatformStore::new();
        let mut seq = Sequence::new();
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(test_utils::platform("app", PlatformPhase::Installed))));
        store.expect_get().times(1).in_sequence(&mut seq).returning(|_| {
            let mut fresh = test_utils::platform("app", PlatformPhase::Installed);
            fresh.metadata.resource_version = Some("2".to_string());
            Ok(Some(fresh))
        });

        let executions = Arc::new(AtomicU32::new(0));
        let ctx = context_with(store, executions.clone());
        let platform = Arc::new(test_utils::platform("app", PlatformPhase::Installed));

        let action = reconcile(platform, ctx).await.unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_STALE));
        // the action list never ran against the stale snapshot
        assert_eq!(executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn quiet_pass_runs_the_actions_and_requeues() {
        let mut store = MockPlatformStore::new();
        store
            .expect_get()
            .times(2)
            .returning(|_| Ok(Some(test_utils::platform("app", PlatformPhase::Installed))));

        let executions = Arc::new(AtomicU32::new(0));
        let ctx = context_with(store, executions.clone());
        let platform = Arc::new(test_utils::platform("app", PlatformPhase::Installed));

        let action = reconcile(platform, ctx).await.unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleted_platform_waits_for_changes() {
        let mut store = MockPlatformStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));

        let executions = Arc::new(AtomicU32::new(0));
        let ctx = context_with(store, executions.clone());
        let platform = Arc::new(test_utils::platform("app", PlatformPhase::Installed));

        let action = reconcile(platform, ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(executions.load(Ordering::SeqCst), 0);
    }
}
