//! Exponential backoff between failed upgrade attempts.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crds::{IntegrationPlatform, PlatformPhase, StatusReason};

use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Failed attempts after which the upgrade is abandoned.
pub const MAX_UPGRADE_ATTEMPTS: u32 = 5;

/// Wait before retry number `attempts + 1`: doubles with every failure,
/// starting at one minute.
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::minutes(1 << attempts.saturating_sub(1).min(30))
}

/// Re-arms a failed upgrade once its backoff window has passed, or gives
/// up for good after too many attempts.
pub struct UpgradeBackoffAction;

#[async_trait]
impl OperatorAction for UpgradeBackoffAction {
    fn name(&self) -> &'static str {
        "upgrade-backoff"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::UpgradeFailureBackoff])
    }

    async fn execute(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<(), ControllerError> {
        let name = platform
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("platform has no name".to_string()))?;
        let status = platform.status_or_default();

        if status.upgrade_attempts >= MAX_UPGRADE_ATTEMPTS {
            warn!(name, attempts = status.upgrade_attempts, "giving up on upgrade");
            ctx.store
                .update_status(
                    name,
                    Box::new(|status| {
                        status.phase = PlatformPhase::UpgradeFailed;
                        status.reason = StatusReason::TooManyUpgradeAttempts;
                        status.description = "upgrade failed too many times".to_string();
                    }),
                )
                .await?;
            return Ok(());
        }

        let delay = backoff_delay(status.upgrade_attempts);
        let elapsed = status
            .last_upgrade_failure
            .map(|at| Utc::now() - at)
            .unwrap_or(delay);

        if elapsed < delay {
            return Ok(());
        }

        info!(
            name,
            attempt = status.upgrade_attempts + 1,
            "backoff elapsed, retrying upgrade"
        );
        ctx.store
            .update_status(
                name,
                Box::new(|status| {
                    status.phase = PlatformPhase::Upgrading;
                    status.force_upgrade = true;
                }),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use crds::IntegrationPlatformStatus;

    use crate::status::MockPlatformStore;
    use crate::test_utils;

    fn capture_update(
        store: &mut MockPlatformStore,
    ) -> Arc<StdMutex<Option<IntegrationPlatformStatus>>> {
        let captured = Arc::new(StdMutex::new(None));
        let sink = captured.clone();
        store.expect_update_status().times(1).returning(move |_, mutate| {
            let mut status = IntegrationPlatformStatus::default();
            mutate(&mut status);
            *sink.lock().unwrap() = Some(status);
            Ok(test_utils::platform("app", PlatformPhase::UpgradeFailureBackoff))
        });
        captured
    }

    #[tokio::test]
    async fn attempt_budget_exhausted_gives_up_for_good() {
        let mut store = MockPlatformStore::new();
        let captured = capture_update(&mut store);
        let ctx = test_utils::action_ctx_with_store(store);

        let mut platform = test_utils::platform("app", PlatformPhase::UpgradeFailureBackoff);
        if let Some(status) = platform.status.as_mut() {
            status.upgrade_attempts = MAX_UPGRADE_ATTEMPTS;
            status.last_upgrade_failure = Some(Utc::now());
        }

        let mut action = UpgradeBackoffAction;
        assert!(action.can_execute(&platform));
        action.execute(&ctx, &platform).await.unwrap();

        let status = captured.lock().unwrap().take().unwrap();
        assert_eq!(status.phase, PlatformPhase::UpgradeFailed);
        assert_eq!(status.reason, StatusReason::TooManyUpgradeAttempts);
    }

    #[tokio::test]
    async fn elapsed_backoff_rearms_the_upgrade() {
        let mut store = MockPlatformStore::new();
        let captured = capture_update(&mut store);
        let ctx = test_utils::action_ctx_with_store(store);

        let mut platform = test_utils::platform("app", PlatformPhase::UpgradeFailureBackoff);
        if let Some(status) = platform.status.as_mut() {
            status.upgrade_attempts = 2;
            // two attempts mean a two minute wait, long over
            status.last_upgrade_failure = Some(Utc::now() - Duration::minutes(10));
        }

        let mut action = UpgradeBackoffAction;
        action.execute(&ctx, &platform).await.unwrap();

        let status = captured.lock().unwrap().take().unwrap();
        assert_eq!(status.phase, PlatformPhase::Upgrading);
        assert!(status.force_upgrade);
    }

    #[tokio::test]
    async fn unfinished_backoff_window_waits() {
        // no update_status expectation: a write would fail the test
        let store = MockPlatformStore::new();
        let ctx = test_utils::action_ctx_with_store(store);

        let mut platform = test_utils::platform("app", PlatformPhase::UpgradeFailureBackoff);
        if let Some(status) = platform.status.as_mut() {
            status.upgrade_attempts = 4;
            status.last_upgrade_failure = Some(Utc::now() - Duration::minutes(1));
        }

        let mut action = UpgradeBackoffAction;
        action.execute(&ctx, &platform).await.unwrap();
    }

    #[test]
    fn delay_doubles_with_each_attempt() {
        assert_eq!(backoff_delay(1), Duration::minutes(1));
        assert_eq!(backoff_delay(2), Duration::minutes(2));
        assert_eq!(backoff_delay(3), Duration::minutes(4));
        assert_eq!(backoff_delay(4), Duration::minutes(8));
        assert_eq!(backoff_delay(5), Duration::minutes(16));
    }

    #[test]
    fn zero_attempts_waits_one_minute() {
        assert_eq!(backoff_delay(0), Duration::minutes(1));
    }
}
