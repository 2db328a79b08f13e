//! Rendering and applying the platform resource set.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crds::{IntegrationPlatform, PlatformPhase, StatusReason};

use crate::apply::gvk_of;
use crate::config::{DB_CONTAINER, DB_DEPLOYMENT, OWNER_LABEL};
use crate::error::ControllerError;
use crate::poll::{poll_until, POLL_INTERVAL, POLL_TIMEOUT};
use crate::render::RenderContext;

use super::{ActionContext, OperatorAction};

/// Reinstall failures tolerated after a successful pipeline run before
/// the upgrade is rolled back from the backup.
const MAX_REINSTALL_ATTEMPTS: usize = 3;

/// Kinds the garbage collector scans for orphaned owned resources.
const GC_KINDS: &[(&str, &str)] = &[
    ("v1", "ConfigMap"),
    ("v1", "PersistentVolumeClaim"),
    ("v1", "Secret"),
    ("v1", "Service"),
    ("v1", "ServiceAccount"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("apps/v1", "Deployment"),
];

/// Renders the manifest set and makes the cluster match it, garbage
/// collecting owned resources that fell out of the set.
pub struct InstallAction {
    /// Kinds the cluster rejected, logged once and then skipped
    unknown_kinds: HashSet<String>,
}

impl InstallAction {
    /// Fresh install action with an empty unknown-kind cache.
    pub fn new() -> Self {
        Self {
            unknown_kinds: HashSet::new(),
        }
    }

    fn stamp(resource: &mut Value, namespace: &str, uid: &str, platform: &IntegrationPlatform) {
        let Some(metadata) = resource
            .as_object_mut()
            .and_then(|o| o.entry("metadata").or_insert_with(|| json!({})).as_object_mut())
        else {
            return;
        };

        metadata.insert("namespace".to_string(), json!(namespace));

        let labels = metadata
            .entry("labels")
            .or_insert_with(|| json!({}))
            .as_object_mut();
        if let Some(labels) = labels {
            labels.insert(OWNER_LABEL.to_string(), json!(uid));
        }

        metadata.insert(
            "ownerReferences".to_string(),
            json!([{
                "apiVersion": "platform.microscaler.io/v1alpha1",
                "kind": "IntegrationPlatform",
                "name": platform.metadata.name,
                "uid": uid,
                "controller": true,
            }]),
        );
    }

    async fn garbage_collect(
        &self,
        ctx: &ActionContext,
        uid: &str,
        applied: &HashSet<(String, String)>,
    ) -> Result<(), ControllerError> {
        let selector = format!("{OWNER_LABEL}={uid}");

        for (api_version, kind) in GC_KINDS {
            let gvk = gvk_of(&json!({"apiVersion": api_version, "kind": kind}))?;
            let ar = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> =
                Api::namespaced_with(ctx.client.clone(), &ctx.namespace, &ar);

            let list = match api.list(&ListParams::default().labels(&selector)).await {
                Ok(list) => list,
                Err(e) => {
                    debug!(kind, error = %e, "skipping garbage collection for kind");
                    continue;
                }
            };

            for item in list.items {
                let Some(name) = item.metadata.name.clone() else {
                    continue;
                };
                if applied.contains(&((*kind).to_string(), name.clone())) {
                    continue;
                }
                info!(kind, name = %name, "deleting orphaned resource");
                if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
                    if !crate::error::is_not_found(&e) {
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    /// After the post-upgrade reinstall, take the migration environment
    /// variable off the database container and wait for the workload to
    /// come back on the migrated data.
    async fn finish_database_migration(&self, ctx: &ActionContext) -> Result<(), ControllerError> {
        let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

        let needs_patch = match api.get_opt(DB_DEPLOYMENT).await? {
            None => false,
            Some(d) => serde_json::to_value(&d)?
                .pointer("/spec/template/spec/containers")
                .and_then(Value::as_array)
                .is_some_and(|containers| {
                    containers.iter().any(|c| {
                        c.get("env").and_then(Value::as_array).is_some_and(|env| {
                            env.iter()
                                .any(|e| e.get("name") == Some(&json!("POSTGRESQL_UPGRADE")))
                        })
                    })
                }),
        };

        if needs_patch {
            let patch = json!({
                "spec": {"template": {"spec": {"containers": [{
                    "name": DB_CONTAINER,
                    "env": [{"name": "POSTGRESQL_UPGRADE", "$patch": "delete"}],
                }]}}},
            });
            api.patch(
                DB_DEPLOYMENT,
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await?;
        }

        let api = api.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "migrated database", || {
            let api = api.clone();
            async move {
                match api.get_opt(DB_DEPLOYMENT).await? {
                    None => Ok(true),
                    Some(d) => {
                        let ready = d
                            .status
                            .as_ref()
                            .and_then(|s| s.ready_replicas)
                            .unwrap_or(0);
                        Ok(ready >= 1)
                    }
                }
            }
        })
        .await
    }
}

impl Default for InstallAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorAction for InstallAction {
    fn name(&self) -> &'static str {
        "install"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[
            PlatformPhase::Installing,
            PlatformPhase::Installed,
            PlatformPhase::PostUpgradeRun,
            PlatformPhase::Starting,
            PlatformPhase::StartupFailed,
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

        match self.install_pass(ctx, platform, name).await {
            Ok(()) => Ok(()),
            // a failed reinstall after an upgrade counts against the
            // upgrade, not just this pass
            Err(e) if platform.phase() == PlatformPhase::PostUpgradeRun => {
                self.reinstall_failed(ctx, name, e).await
            }
            Err(e) => Err(e),
        }
    }
}

impl InstallAction {
    async fn install_pass(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
        name: &str,
    ) -> Result<(), ControllerError> {
        let uid = platform
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("platform has no uid".to_string()))?;

        let status = platform.status_or_default();
        let target_version = if status.target_version.is_empty() {
            ctx.target_version.clone()
        } else {
            status.target_version.clone()
        };

        let render_ctx = RenderContext {
            namespace: ctx.namespace.clone(),
            target_version,
            route_hostname: platform.spec.route_hostname.clone(),
        };
        let documents = ctx.renderer.render(&render_ctx)?;

        let mut applied: HashSet<(String, String)> = HashSet::new();
        for mut doc in documents {
            Self::stamp(&mut doc, &ctx.namespace, uid, platform);

            let gvk = gvk_of(&doc)?;
            if self.unknown_kinds.contains(&gvk.kind) {
                continue;
            }

            match ctx.applier.apply(&ctx.namespace, &doc).await {
                Ok((obj, _changed)) => {
                    if let Some(obj_name) = obj.metadata.name {
                        applied.insert((gvk.kind.clone(), obj_name));
                    }
                }
                Err(e) if e.is_not_found() => {
                    // the cluster does not serve this kind
                    warn!(kind = %gvk.kind, "kind not served by this cluster, skipping");
                    self.unknown_kinds.insert(gvk.kind);
                }
                Err(e) => return Err(e),
            }
        }

        self.garbage_collect(ctx, uid, &applied).await?;

        match platform.phase() {
            PlatformPhase::Installing => {
                info!(name, "resource set applied, waiting for workloads");
                ctx.store
                    .update_status(
                        name,
                        Box::new(|status| {
                            status.phase = PlatformPhase::Starting;
                        }),
                    )
                    .await?;
            }
            PlatformPhase::PostUpgradeRun => {
                self.finish_database_migration(ctx).await?;
                info!(name, "post-upgrade reinstall complete");
                ctx.store
                    .update_status(
                        name,
                        Box::new(|status| {
                            status.phase = PlatformPhase::PostUpgradeRunSucceed;
                            status.reason = StatusReason::Missing;
                            status.description = String::new();
                        }),
                    )
                    .await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Book a post-upgrade reinstall failure against the in-flight
    /// pipeline. The first few failures surface as pass errors and are
    /// retried; once the budget is spent the pipeline rolls the upgrade
    /// back from its backup and the platform moves into backoff.
    async fn reinstall_failed(
        &mut self,
        ctx: &ActionContext,
        name: &str,
        error: ControllerError,
    ) -> Result<(), ControllerError> {
        let mut slot = ctx.pipeline.lock().await;
        let Some(pipeline) = slot.as_mut() else {
            // no pipeline in flight (operator restarted mid-upgrade);
            // nothing to book the failure against
            return Err(error);
        };

        let failures = pipeline.install_failed();
        if failures < MAX_REINSTALL_ATTEMPTS {
            warn!(name, failures, error = %error, "post-upgrade reinstall failed, retrying");
            return Err(error);
        }

        warn!(
            name,
            failures,
            error = %error,
            "post-upgrade reinstall keeps failing, rolling the upgrade back"
        );
        if let Err(rb) = pipeline.rollback().await {
            warn!(name, error = %rb, "rollback did not complete");
        }
        *slot = None;

        let detail = error.to_string();
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use crds::IntegrationPlatformStatus;

    use crate::backup::MockBackupRunner;
    use crate::render::MockManifestRenderer;
    use crate::status::MockPlatformStore;
    use crate::test_utils;
    use crate::upgrade::UpgradePipeline;

    #[tokio::test]
    async fn applied_resource_set_moves_installing_to_starting() {
        let mut renderer = MockManifestRenderer::new();
        renderer.expect_render().returning(|_| Ok(vec![]));

        let mut store = MockPlatformStore::new();
        let captured = Arc::new(StdMutex::new(None));
        let sink = captured.clone();
        store.expect_update_status().times(1).returning(move |_, mutate| {
            let mut status = IntegrationPlatformStatus::default();
            mutate(&mut status);
            *sink.lock().unwrap() = Some(status);
            Ok(test_utils::platform("app", PlatformPhase::Starting))
        });

        let ctx = test_utils::action_ctx(store, renderer, MockBackupRunner::new());
        let platform = test_utils::platform("app", PlatformPhase::Installing);

        let mut action = InstallAction::new();
        action.execute(&ctx, &platform).await.unwrap();

        let status = captured.lock().unwrap().take().unwrap();
        assert_eq!(status.phase, PlatformPhase::Starting);
    }

    #[tokio::test]
    async fn repeated_reinstall_failures_roll_the_upgrade_back() {
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .times(MAX_REINSTALL_ATTEMPTS)
            .returning(|_| Err(ControllerError::Render("manifests unreadable".to_string())));

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

        // a pipeline that just finished its run successfully
        let mut pipeline = UpgradePipeline::new(vec![]);
        pipeline.upgrade().await.unwrap();
        *ctx.pipeline.lock().await = Some(pipeline);

        let platform = test_utils::platform("app", PlatformPhase::PostUpgradeRun);
        let mut action = InstallAction::new();

        // the first failures are retried and keep the pipeline around
        for _ in 0..MAX_REINSTALL_ATTEMPTS - 1 {
            assert!(action.execute(&ctx, &platform).await.is_err());
            assert!(ctx.pipeline.lock().await.is_some());
        }

        // the last one exhausts the budget: rollback, pipeline gone,
        // platform parked in backoff with the failure booked
        action.execute(&ctx, &platform).await.unwrap();
        assert!(ctx.pipeline.lock().await.is_none());

        let status = captured.lock().unwrap().take().unwrap();
        assert_eq!(status.phase, PlatformPhase::UpgradeFailureBackoff);
        assert_eq!(status.reason, StatusReason::UpgradeFailed);
        assert_eq!(status.upgrade_attempts, 1);
    }
}
