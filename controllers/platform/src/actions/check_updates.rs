//! Detecting that an installed platform is behind the operator build.

use async_trait::async_trait;
use tracing::info;

use crds::{IntegrationPlatform, PlatformPhase};

use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Kicks off an upgrade when the installed version differs from the
/// version this operator build ships.
pub struct CheckUpdatesAction;

#[async_trait]
impl OperatorAction for CheckUpdatesAction {
    fn name(&self) -> &'static str {
        "check-updates"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::Installed])
    }

    async fn execute(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<(), ControllerError> {
        let status = platform.status_or_default();
        if status.version == ctx.target_version {
            return Ok(());
        }

        let name = platform
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("platform has no name".to_string()))?;

        info!(
            name,
            installed = %status.version,
            target = %ctx.target_version,
            "version drift detected, scheduling upgrade"
        );

        let target = ctx.target_version.clone();
        ctx.store
            .update_status(
                name,
                Box::new(move |status| {
                    status.phase = PlatformPhase::Upgrading;
                    status.target_version = target.clone();
                    status.upgrade_attempts = 0;
                    status.last_upgrade_failure = None;
                    status.force_upgrade = false;
                }),
            )
            .await?;

        Ok(())
    }
}
