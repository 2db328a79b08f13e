//! Watching workloads come up after an install.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use tracing::{info, warn};

use crds::{IntegrationPlatform, PlatformPhase, StatusReason};

use crate::config::OWNER_LABEL;
use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Promotes `Starting` to `Installed` once every owned Deployment is
/// ready, or to `StartupFailed` when nothing is ready and a Deployment
/// reports it stopped progressing.
pub struct StartupAction;

fn is_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    status.ready_replicas.unwrap_or(0) >= desired
}

fn stopped_progressing(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Progressing" && c.status == "False")
        })
}

#[async_trait]
impl OperatorAction for StartupAction {
    fn name(&self) -> &'static str {
        "startup"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::Starting, PlatformPhase::StartupFailed])
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
        let uid = platform
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("platform has no uid".to_string()))?;

        let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let list = deployments
            .list(&ListParams::default().labels(&format!("{OWNER_LABEL}={uid}")))
            .await?;

        if list.items.is_empty() {
            // nothing applied yet, leave the phase alone
            return Ok(());
        }

        let ready = list.items.iter().filter(|d| is_ready(d)).count();
        let total = list.items.len();

        if ready == total {
            info!(name, total, "all workloads ready, platform installed");
            let version = platform.status_or_default().target_version;
            ctx.store
                .update_status(
                    name,
                    Box::new(move |status| {
                        status.phase = PlatformPhase::Installed;
                        status.reason = StatusReason::Missing;
                        status.description = String::new();
                        if !version.is_empty() {
                            status.version = version.clone();
                        }
                    }),
                )
                .await?;
            return Ok(());
        }

        if ready == 0 && list.items.iter().any(stopped_progressing) {
            warn!(name, "workloads stopped progressing during startup");
            ctx.store
                .update_status(
                    name,
                    Box::new(|status| {
                        status.phase = PlatformPhase::StartupFailed;
                        status.reason = StatusReason::DeploymentNotReady;
                        status.description = "no deployment became ready".to_string();
                    }),
                )
                .await?;
            return Ok(());
        }

        info!(name, ready, total, "startup in progress");
        Ok(())
    }
}
