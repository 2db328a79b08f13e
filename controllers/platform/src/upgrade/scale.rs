//! Scaling of the application tier around an upgrade.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::json;
use tracing::info;

use crate::config::APP_TIER_SELECTOR;
use crate::error::ControllerError;
use crate::poll::{poll_until, POLL_INTERVAL, POLL_TIMEOUT};

use super::{PipelineStep, StepContext};

/// Scales every application-tier Deployment to a fixed replica count and
/// waits for the scale to settle.
///
/// Scaling is idempotent, so these steps always run and always roll back;
/// rollback restores the pre-upgrade state of one replica per workload.
pub struct ScaleStep {
    ctx: StepContext,
    name: &'static str,
    target: i32,
    executed: bool,
}

impl ScaleStep {
    /// Step that quiesces the application tier before the upgrade.
    pub fn scale_down(ctx: StepContext) -> Self {
        Self {
            ctx,
            name: "ScaleDown",
            target: 0,
            executed: false,
        }
    }

    /// Step that brings the application tier back up after the upgrade.
    pub fn scale_up(ctx: StepContext) -> Self {
        Self {
            ctx,
            name: "ScaleUp",
            target: 1,
            executed: false,
        }
    }

    async fn scale_to(&self, replicas: i32) -> Result<(), ControllerError> {
        let api: Api<Deployment> =
            Api::namespaced(self.ctx.client.clone(), &self.ctx.namespace);
        let list = api
            .list(&ListParams::default().labels(APP_TIER_SELECTOR))
            .await?;

        let patch = json!({"spec": {"replicas": replicas}});
        for deployment in &list.items {
            let Some(name) = deployment.metadata.name.as_deref() else {
                continue;
            };
            info!(deployment = name, replicas, "scaling application workload");
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        let api = api.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "application tier scale", || {
            let api = api.clone();
            async move {
                let list = api
                    .list(&ListParams::default().labels(APP_TIER_SELECTOR))
                    .await?;
                let settled = list.items.iter().all(|d| {
                    let ready = d
                        .status
                        .as_ref()
                        .and_then(|s| s.ready_replicas)
                        .unwrap_or(0);
                    ready == replicas
                });
                Ok(settled)
            }
        })
        .await
    }
}

#[async_trait]
impl PipelineStep for ScaleStep {
    fn name(&self) -> &str {
        self.name
    }

    fn executed(&self) -> bool {
        self.executed
    }

    async fn can_run(&self) -> Result<bool, ControllerError> {
        Ok(true)
    }

    async fn run(&mut self) -> Result<(), ControllerError> {
        self.scale_to(self.target).await?;
        self.executed = true;
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    async fn rollback(&mut self) -> Result<(), ControllerError> {
        self.scale_to(1).await?;
        self.executed = false;
        Ok(())
    }
}
