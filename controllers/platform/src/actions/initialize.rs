//! First touch of a new platform resource.

use async_trait::async_trait;
use tracing::{info, warn};

use crds::{IntegrationPlatform, PlatformPhase, StatusReason};

use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Moves a freshly created resource into `Installing`, or parks it as a
/// duplicate when the namespace already hosts an active platform.
pub struct InitializeAction;

#[async_trait]
impl OperatorAction for InitializeAction {
    fn name(&self) -> &'static str {
        "initialize"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::Missing])
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

        // one active platform per namespace
        let others = ctx.store.list().await?;
        let duplicate = others.iter().any(|other| {
            other.metadata.name.as_deref() != Some(name)
                && !other.phase_is(&[PlatformPhase::Missing, PlatformPhase::NotInstalled])
        });

        if duplicate {
            warn!(name, "another platform is already active in this namespace");
            ctx.store
                .update_status(
                    name,
                    Box::new(|status| {
                        status.phase = PlatformPhase::NotInstalled;
                        status.reason = StatusReason::Duplicate;
                        status.description =
                            "another IntegrationPlatform already exists in this namespace"
                                .to_string();
                    }),
                )
                .await?;
            return Ok(());
        }

        info!(name, target = %ctx.target_version, "initializing platform");
        let target = ctx.target_version.clone();
        ctx.store
            .update_status(
                name,
                Box::new(move |status| {
                    status.phase = PlatformPhase::Installing;
                    status.reason = StatusReason::Missing;
                    status.description = String::new();
                    status.target_version = target.clone();
                }),
            )
            .await?;

        Ok(())
    }
}
