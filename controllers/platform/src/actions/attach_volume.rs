//! Detecting drift between the declared and provisioned database volume.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::Api;
use tracing::warn;

use crds::{IntegrationPlatform, PlatformPhase};

use crate::apply::parse_quantity;
use crate::config::DB_DEPLOYMENT;
use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Compares the database volume claim against the declared capacity and
/// records a drift note in the status. Claims are never resized or
/// recreated here; that is an operator decision.
pub struct AttachVolumeAction;

impl AttachVolumeAction {
    /// Record the drift note, unless the status already carries it. An
    /// unconditional write would bump the resource version every pass
    /// and keep aborting the rest of the reconcile.
    async fn record_drift(
        &self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
        declared: &str,
        provisioned: &str,
    ) -> Result<(), ControllerError> {
        let name = platform
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("platform has no name".to_string()))?;

        let note = format!(
            "database volume is {provisioned} but {declared} is declared; \
             the claim is not resized automatically"
        );
        if platform.status_or_default().description == note {
            return Ok(());
        }

        warn!(
            name,
            declared = %declared,
            provisioned = %provisioned,
            "database volume capacity differs from the declared value"
        );
        ctx.store
            .update_status(
                name,
                Box::new(move |status| {
                    status.description = note.clone();
                }),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl OperatorAction for AttachVolumeAction {
    fn name(&self) -> &'static str {
        "attach-volume"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::Installed])
    }

    async fn execute(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<(), ControllerError> {
        let declared = &platform.spec.components.database.resources.volume_capacity;
        if declared.is_empty() {
            return Ok(());
        }
        let Some(declared_bytes) = parse_quantity(declared) else {
            return Err(ControllerError::InvalidConfig(format!(
                "unparseable database volume capacity {declared:?}"
            )));
        };

        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let Some(claim) = pvcs.get_opt(DB_DEPLOYMENT).await? else {
            return Ok(());
        };

        let provisioned = claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|req| req.get("storage"))
            .map(|q| q.0.clone());

        let Some(provisioned) = provisioned else {
            return Ok(());
        };
        let Some(provisioned_bytes) = parse_quantity(&provisioned) else {
            return Ok(());
        };

        // equivalent quantities in different units are not drift
        if (provisioned_bytes - declared_bytes).abs() < f64::EPSILON {
            return Ok(());
        }

        self.record_drift(ctx, platform, declared, &provisioned).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use crate::status::MockPlatformStore;
    use crate::test_utils;

    #[tokio::test]
    async fn drift_is_written_to_the_status_once() {
        let mut store = MockPlatformStore::new();
        let written = Arc::new(StdMutex::new(None));
        let sink = written.clone();
        store.expect_update_status().times(1).returning(move |_, mutate| {
            let mut status = crds::IntegrationPlatformStatus::default();
            mutate(&mut status);
            *sink.lock().unwrap() = Some(status.description);
            Ok(test_utils::platform("app", PlatformPhase::Installed))
        });

        let ctx = test_utils::action_ctx_with_store(store);
        let platform = test_utils::platform("app", PlatformPhase::Installed);

        let action = AttachVolumeAction;
        action.record_drift(&ctx, &platform, "2Gi", "1Gi").await.unwrap();

        let description = written.lock().unwrap().clone().unwrap();
        assert!(description.contains("1Gi"));
        assert!(description.contains("2Gi"));
    }

    #[tokio::test]
    async fn unchanged_drift_note_is_not_rewritten() {
        // no update_status expectation: a write would fail the test
        let store = MockPlatformStore::new();
        let ctx = test_utils::action_ctx_with_store(store);

        let mut platform = test_utils::platform("app", PlatformPhase::Installed);
        if let Some(status) = platform.status.as_mut() {
            status.description = "database volume is 1Gi but 2Gi is declared; \
                 the claim is not resized automatically"
                .to_string();
        }

        let action = AttachVolumeAction;
        action.record_drift(&ctx, &platform, "2Gi", "1Gi").await.unwrap();
    }
}
