//! Propagating scheduling constraints to the infrastructure workloads.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::{json, Value};
use tracing::info;

use crds::{IntegrationPlatform, PlatformPhase, SchedulingSpec};

use crate::config::INFRA_SELECTOR;
use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Pushes the declared affinity and tolerations onto every infrastructure
/// Deployment whenever they change. A cleared field is patched to `null`,
/// which removes it from the pod template.
pub struct PodSchedulingAction {
    last_seen: Option<SchedulingSpec>,
}

impl PodSchedulingAction {
    /// Fresh action; the first pass always applies the constraints.
    pub fn new() -> Self {
        Self { last_seen: None }
    }

    fn scheduling_patch(scheduling: &SchedulingSpec) -> Value {
        json!({
            "spec": {"template": {"spec": {
                "affinity": scheduling.affinity.clone().unwrap_or(Value::Null),
                "tolerations": scheduling.tolerations.clone().unwrap_or(Value::Null),
            }}},
        })
    }
}

impl Default for PodSchedulingAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorAction for PodSchedulingAction {
    fn name(&self) -> &'static str {
        "pod-scheduling"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::Installed])
    }

    async fn execute(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<(), ControllerError> {
        let scheduling = &platform.spec.infra_scheduling;
        if self.last_seen.as_ref() == Some(scheduling) {
            return Ok(());
        }

        let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let list = deployments
            .list(&ListParams::default().labels(INFRA_SELECTOR))
            .await?;

        let patch = Self::scheduling_patch(scheduling);
        for deployment in &list.items {
            let Some(name) = deployment.metadata.name.as_deref() else {
                continue;
            };
            info!(deployment = name, "updating scheduling constraints");
            deployments
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        self.last_seen = Some(scheduling.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleared_constraints_patch_to_null() {
        let patch = PodSchedulingAction::scheduling_patch(&SchedulingSpec::default());

        assert_eq!(
            patch.pointer("/spec/template/spec/affinity"),
            Some(&Value::Null)
        );
        assert_eq!(
            patch.pointer("/spec/template/spec/tolerations"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn declared_constraints_are_forwarded_verbatim() {
        let scheduling = SchedulingSpec {
            affinity: Some(json!({"nodeAffinity": {}})),
            tolerations: Some(json!([{"key": "infra", "operator": "Exists"}])),
        };

        let patch = PodSchedulingAction::scheduling_patch(&scheduling);

        assert_eq!(
            patch.pointer("/spec/template/spec/affinity"),
            Some(&json!({"nodeAffinity": {}}))
        );
        assert_eq!(
            patch.pointer("/spec/template/spec/tolerations/0/key"),
            Some(&json!("infra"))
        );
    }
}
