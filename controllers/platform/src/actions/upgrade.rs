//! Driving the upgrade pipeline from the reconcile loop.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crds::{IntegrationPlatform, PlatformPhase, StatusReason};

use crate::config::DB_DEPLOYMENT;
use crate::error::ControllerError;
use crate::render::RenderContext;
use crate::upgrade::backup::BackupStep;
use crate::upgrade::database::{DatabaseMigrationStep, MarkerFile, RunningDatabase};
use crate::upgrade::reinstall::ReinstallStep;
use crate::upgrade::scale::ScaleStep;
use crate::upgrade::{PipelineStep, StepContext, UpgradePipeline};

use super::{ActionContext, OperatorAction};

/// Runs the upgrade pipeline while the platform is `Upgrading` and
/// finalizes the bookkeeping once the post-upgrade reinstall succeeded.
/// The in-flight pipeline lives in the shared context so the install
/// action can book reinstall failures against it.
pub struct UpgradeAction;

impl UpgradeAction {
    /// Fresh upgrade action.
    pub fn new() -> Self {
        Self
    }

    /// Image carrying the target database version, taken from the
    /// rendered manifest set.
    fn target_db_image(documents: &[Value]) -> Result<String, ControllerError> {
        documents
            .iter()
            .find(|doc| {
                doc.get("kind").and_then(Value::as_str) == Some("Deployment")
                    && doc.pointer("/metadata/name").and_then(Value::as_str)
                        == Some(DB_DEPLOYMENT)
            })
            .and_then(|doc| {
                doc.pointer("/spec/template/spec/containers/0/image")
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
            .ok_or_else(|| {
                ControllerError::Render(format!(
                    "manifest set has no {DB_DEPLOYMENT} Deployment with an image"
                ))
            })
    }

    fn build_pipeline(
        &self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<UpgradePipeline, ControllerError> {
        let step_ctx = StepContext {
            client: ctx.client.clone(),
            namespace: ctx.namespace.clone(),
        };

        let render_ctx = RenderContext {
            namespace: ctx.namespace.clone(),
            target_version: ctx.target_version.clone(),
            route_hostname: platform.spec.route_hostname.clone(),
        };
        let documents = ctx.renderer.render(&render_ctx)?;
        let image = Self::target_db_image(&documents)?;

        let database = &platform.spec.components.database;
        let volume_capacity = if database.resources.volume_capacity.is_empty() {
            "1Gi".to_string()
        } else {
            database.resources.volume_capacity.clone()
        };

        let current = Box::new(RunningDatabase::new(
            step_ctx.clone(),
            &database.name,
            &database.user,
        ));
        let target = Box::new(MarkerFile::new(ctx.db_version_file.clone()));

        let steps: Vec<Box<dyn PipelineStep>> = vec![
            Box::new(ScaleStep::scale_down(step_ctx.clone())),
            Box::new(BackupStep::new(ctx.backups.clone())),
            Box::new(DatabaseMigrationStep::new(
                step_ctx.clone(),
                current,
                target,
                !database.external_db_url.is_empty(),
                platform.spec.force_migration,
                image,
                volume_capacity,
            )),
            Box::new(ReinstallStep::new(ctx.backups.clone())),
            Box::new(ScaleStep::scale_up(step_ctx)),
        ];

        Ok(UpgradePipeline::new(steps))
    }

    async fn run_pipeline(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
        name: &str,
    ) -> Result<(), ControllerError> {
        let mut slot = ctx.pipeline.lock().await;
        if slot.is_none() {
            *slot = Some(self.build_pipeline(ctx, platform)?);
        }
        let pipeline = slot
            .as_mut()
            .ok_or_else(|| ControllerError::UnsupportedPhase("missing pipeline".to_string()))?;

        match pipeline.upgrade().await {
            Ok(()) => {
                info!(name, "upgrade pipeline succeeded, reinstalling at target version");
                ctx.store
                    .update_status(
                        name,
                        Box::new(|status| {
                            status.phase = PlatformPhase::PostUpgradeRun;
                            status.reason = StatusReason::PostUpgradeRun;
                            status.description = String::new();
                        }),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                warn!(name, error = %e, "upgrade pipeline failed, rolling back");
                if let Err(rb) = pipeline.rollback().await {
                    warn!(name, error = %rb, "rollback did not complete");
                }
                // the rolled-back pipeline is spent; the retry after
                // backoff starts from scratch, including a fresh backup
                *slot = None;

                let detail = e.to_string();
                ctx.store
                    .update_status(
                        name,
                        Box::new(move |status| {
                            status.phase = PlatformPhase::UpgradeFailureBackoff;
                            status.reason = StatusReason::UpgradeFailed;
                            status.description = detail.clone();
                            status.upgrade_attempts += 1;
                            status.last_upgrade_failure = Some(Utc::now());
                            status.force_upgrade = false;
                        }),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn finalize(
        &mut self,
        ctx: &ActionContext,
        name: &str,
    ) -> Result<(), ControllerError> {
        info!(name, version = %ctx.target_version, "upgrade complete");
        let target = ctx.target_version.clone();
        ctx.store
            .update_status(
                name,
                Box::new(move |status| {
                    status.phase = PlatformPhase::Installed;
                    status.reason = StatusReason::Migrated;
                    status.description = String::new();
                    status.version = target.clone();
                    status.target_version = target.clone();
                    status.upgrade_attempts = 0;
                    status.last_upgrade_failure = None;
                    status.force_upgrade = false;
                }),
            )
            .await?;

        *ctx.pipeline.lock().await = None;
        Ok(())
    }
}

impl Default for UpgradeAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorAction for UpgradeAction {
    fn name(&self) -> &'static str {
        "upgrade"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[
            PlatformPhase::Upgrading,
            PlatformPhase::PostUpgradeRunSucceed,
        ])
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

        match platform.phase() {
            PlatformPhase::Upgrading => self.run_pipeline(ctx, platform, name).await,
            PlatformPhase::PostUpgradeRunSucceed => self.finalize(ctx, name).await,
            other => Err(ControllerError::UnsupportedPhase(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use crds::IntegrationPlatformStatus;

    use crate::backup::MockBackupRunner;
    use crate::render::MockManifestRenderer;
    use crate::status::MockPlatformStore;
    use crate::test_utils;

    fn db_manifest() -> Value {
        json!({
            "kind": "Deployment",
            "metadata": {"name": "platform-db"},
            "spec": {"template": {"spec": {"containers": [
                {"name": "postgresql", "image": "registry.example/postgres:10"},
            ]}}},
        })
    }

    #[tokio::test]
    async fn failed_run_discards_the_pipeline_so_the_retry_starts_fresh() {
        let mut renderer = MockManifestRenderer::new();
        renderer.expect_render().returning(|_| Ok(vec![db_manifest()]));

        let mut store = MockPlatformStore::new();
        let captured = Arc::new(StdMutex::new(None));
        let sink = captured.clone();
        store.expect_update_status().times(1).returning(move |_, mutate| {
            let mut status = IntegrationPlatformStatus::default();
            mutate(&mut status);
            *sink.lock().unwrap() = Some(status);
            Ok(test_utils::platform("app", PlatformPhase::UpgradeFailureBackoff))
        });

        let ctx = test_utils::action_ctx(store, renderer, MockBackupRunner::new());
        let platform = test_utils::platform("app", PlatformPhase::Upgrading);

        let mut action = UpgradeAction::new();
        action.execute(&ctx, &platform).await.unwrap();

        // the offline client fails the scale-down step, so the run rolls
        // back; the spent pipeline must not survive into the next pass,
        // or the retry would skip its backup
        assert!(ctx.pipeline.lock().await.is_none());

        let status = captured.lock().unwrap().take().unwrap();
        assert_eq!(status.phase, PlatformPhase::UpgradeFailureBackoff);
        assert_eq!(status.reason, StatusReason::UpgradeFailed);
        assert_eq!(status.upgrade_attempts, 1);
        assert!(status.last_upgrade_failure.is_some());
    }

    #[test]
    fn db_image_is_read_from_the_manifest_set() {
        let docs = vec![
            json!({"kind": "ConfigMap", "metadata": {"name": "platform-config"}}),
            json!({
                "kind": "Deployment",
                "metadata": {"name": "platform-db"},
                "spec": {"template": {"spec": {"containers": [
                    {"name": "postgresql", "image": "registry.example/postgres:10"},
                ]}}},
            }),
        ];

        assert_eq!(
            UpgradeAction::target_db_image(&docs).unwrap(),
            "registry.example/postgres:10"
        );
    }

    #[test]
    fn missing_db_deployment_is_an_error() {
        let docs = vec![json!({"kind": "Service", "metadata": {"name": "platform-server"}})];
        assert!(matches!(
            UpgradeAction::target_db_image(&docs),
            Err(ControllerError::Render(_))
        ));
    }
}
