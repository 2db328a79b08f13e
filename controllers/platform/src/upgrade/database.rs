//! Major-version migration of the managed PostgreSQL instance.
//!
//! The step compares the version of the running database against the
//! version shipped in the target image and, when the target is newer,
//! runs a one-shot migration workload that copies the data directory
//! into the new on-disk format (`POSTGRESQL_UPGRADE=copy`).

use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{
    DB_CONTAINER, DB_DEPLOYMENT, DB_UPGRADE_DEPLOYMENT, DB_UPGRADE_POD_SELECTOR,
    DB_POD_SELECTOR,
};
use crate::error::ControllerError;
use crate::exec;
use crate::poll::{poll_until, POLL_INTERVAL, POLL_TIMEOUT};

use super::{PipelineStep, StepContext};

/// Something that can report a PostgreSQL major version as `major.minor`.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// The version, e.g. `9.5` or `10.6`.
    async fn version(&self) -> Result<f64, ControllerError>;
}

/// Extract `major.minor` from a PostgreSQL version banner.
///
/// Handles both the bare form (`PostgreSQL 9.5.14`) and the `psql`
/// banner form (`postgres (PostgreSQL) 10.6 (Debian 10.6-1...)`).
pub fn parse_version(raw: &str) -> Result<f64, ControllerError> {
    let re = Regex::new(r"^.* (\d+\.\d+)(?:\.\d+)? ?")
        .map_err(|e| ControllerError::DatabaseVersion(e.to_string()))?;

    let captures = re.captures(raw.trim()).ok_or_else(|| {
        ControllerError::DatabaseVersion(format!("unrecognized version string {raw:?}"))
    })?;

    captures[1]
        .parse::<f64>()
        .map_err(|e| ControllerError::DatabaseVersion(e.to_string()))
}

/// Version of the database bundled in the target image, read from the
/// marker file the image build writes next to its data directory.
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    /// Version source backed by a marker file.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl VersionSource for MarkerFile {
    async fn version(&self) -> Result<f64, ControllerError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ControllerError::DatabaseVersion(format!(
                "cannot read marker file {}: {e}",
                self.path.display()
            ))
        })?;
        parse_version(&raw)
    }
}

/// Version of the currently running database, probed with `psql` inside
/// the database pod.
pub struct RunningDatabase {
    ctx: StepContext,
    db_name: String,
    db_user: String,
}

impl RunningDatabase {
    /// Version source backed by the live database pod.
    pub fn new(ctx: StepContext, db_name: &str, db_user: &str) -> Self {
        Self {
            ctx,
            db_name: db_name.to_string(),
            db_user: db_user.to_string(),
        }
    }
}

#[async_trait]
impl VersionSource for RunningDatabase {
    async fn version(&self) -> Result<f64, ControllerError> {
        let pod =
            exec::single_pod(&self.ctx.client, &self.ctx.namespace, DB_POD_SELECTOR).await?;
        let out = exec::exec_capture(
            &self.ctx.client,
            &self.ctx.namespace,
            &pod,
            DB_CONTAINER,
            vec![
                "psql".to_string(),
                "-qtA".to_string(),
                format!("--dbname={}", self.db_name),
                format!("--username={}", self.db_user),
                "--host=127.0.0.1".to_string(),
                "--command=SELECT version();".to_string(),
            ],
            None,
        )
        .await?;

        parse_version(&String::from_utf8_lossy(&out))
    }
}

/// Migrates the database data directory to the target major version.
pub struct DatabaseMigrationStep {
    ctx: StepContext,
    current: Box<dyn VersionSource>,
    target: Box<dyn VersionSource>,
    /// True when the platform points at an external database we must not touch
    external_db: bool,
    /// Run the migration even when the version comparison says otherwise
    force: bool,
    /// Image carrying the target PostgreSQL version
    image: String,
    /// Capacity of the migration volume claim
    volume_capacity: String,
    executed: bool,
}

impl DatabaseMigrationStep {
    /// Build the migration step.
    pub fn new(
        ctx: StepContext,
        current: Box<dyn VersionSource>,
        target: Box<dyn VersionSource>,
        external_db: bool,
        force: bool,
        image: String,
        volume_capacity: String,
    ) -> Self {
        Self {
            ctx,
            current,
            target,
            external_db,
            force,
            image,
            volume_capacity,
            executed: false,
        }
    }

    async fn scale_db(&self, replicas: i32) -> Result<(), ControllerError> {
        let api: Api<Deployment> =
            Api::namespaced(self.ctx.client.clone(), &self.ctx.namespace);
        api.patch(
            DB_DEPLOYMENT,
            &PatchParams::default(),
            &Patch::Merge(&json!({"spec": {"replicas": replicas}})),
        )
        .await?;

        let api = api.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "database scale", || {
            let api = api.clone();
            async move {
                let d = api.get(DB_DEPLOYMENT).await?;
                let ready = d
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                Ok(ready == replicas)
            }
        })
        .await
    }

    fn migration_manifests(&self) -> (serde_json::Value, serde_json::Value) {
        let pvc = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": DB_UPGRADE_DEPLOYMENT,
                "namespace": self.ctx.namespace,
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": self.volume_capacity}},
            },
        });

        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": DB_UPGRADE_DEPLOYMENT,
                "namespace": self.ctx.namespace,
                "labels": {"platform.microscaler.io/component": DB_UPGRADE_DEPLOYMENT},
            },
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {
                    "platform.microscaler.io/component": DB_UPGRADE_DEPLOYMENT,
                }},
                "strategy": {"type": "Recreate"},
                "template": {
                    "metadata": {"labels": {
                        "platform.microscaler.io/component": DB_UPGRADE_DEPLOYMENT,
                    }},
                    "spec": {
                        "containers": [{
                            "name": DB_CONTAINER,
                            "image": self.image,
                            "env": [{"name": "POSTGRESQL_UPGRADE", "value": "copy"}],
                            "volumeMounts": [
                                {"name": "old-data", "mountPath": "/var/lib/pgsql/data-old"},
                                {"name": "new-data", "mountPath": "/var/lib/pgsql/data"},
                            ],
                        }],
                        "volumes": [
                            {"name": "old-data",
                             "persistentVolumeClaim": {"claimName": DB_DEPLOYMENT}},
                            {"name": "new-data",
                             "persistentVolumeClaim": {"claimName": DB_UPGRADE_DEPLOYMENT}},
                        ],
                    },
                },
            },
        });

        (pvc, deployment)
    }

    async fn delete_migration_workload(&self) -> Result<(), ControllerError> {
        let deployments: Api<Deployment> =
            Api::namespaced(self.ctx.client.clone(), &self.ctx.namespace);
        if let Err(e) = deployments
            .delete(DB_UPGRADE_DEPLOYMENT, &DeleteParams::default())
            .await
        {
            if !crate::error::is_not_found(&e) {
                return Err(e.into());
            }
        }

        let pvc_resource = ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
            "",
            "v1",
            "PersistentVolumeClaim",
        ));
        let pvcs: Api<DynamicObject> = Api::namespaced_with(
            self.ctx.client.clone(),
            &self.ctx.namespace,
            &pvc_resource,
        );
        if let Err(e) = pvcs.delete(DB_UPGRADE_DEPLOYMENT, &DeleteParams::default()).await {
            if !crate::error::is_not_found(&e) {
                return Err(e.into());
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PipelineStep for DatabaseMigrationStep {
    fn name(&self) -> &str {
        "DatabaseMigration"
    }

    fn executed(&self) -> bool {
        self.executed
    }

    async fn can_run(&self) -> Result<bool, ControllerError> {
        if self.executed {
            return Ok(false);
        }
        if self.external_db {
            info!("external database configured, skipping migration");
            return Ok(false);
        }
        if self.force {
            info!("migration forced by the platform spec");
            return Ok(true);
        }

        let current = match self.current.version().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cannot determine running database version, skipping migration");
                return Ok(false);
            }
        };
        let target = match self.target.version().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cannot determine target database version, skipping migration");
                return Ok(false);
            }
        };

        info!(current, target, "database version check");
        Ok(target > current)
    }

    async fn run(&mut self) -> Result<(), ControllerError> {
        // the data directory must be quiet while it is copied
        self.scale_db(0).await?;

        let (pvc, deployment) = self.migration_manifests();

        let pvc_resource = ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
            "",
            "v1",
            "PersistentVolumeClaim",
        ));
        let pvcs: Api<DynamicObject> = Api::namespaced_with(
            self.ctx.client.clone(),
            &self.ctx.namespace,
            &pvc_resource,
        );
        let pvc_obj: DynamicObject = serde_json::from_value(pvc)?;
        match pvcs.create(&PostParams::default(), &pvc_obj).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }

        let deployments: Api<Deployment> =
            Api::namespaced(self.ctx.client.clone(), &self.ctx.namespace);
        let deployment_obj: Deployment = serde_json::from_value(deployment)?;
        match deployments.create(&PostParams::default(), &deployment_obj).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }

        // the image entrypoint copies the data directory before the
        // container turns ready
        let client = self.ctx.client.clone();
        let namespace = self.ctx.namespace.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "database migration", || {
            let client = client.clone();
            let namespace = namespace.clone();
            async move {
                let pods: Api<k8s_openapi::api::core::v1::Pod> =
                    Api::namespaced(client, &namespace);
                let list = pods
                    .list(&ListParams::default().labels(DB_UPGRADE_POD_SELECTOR))
                    .await?;
                let ready = list.items.iter().any(|p| {
                    p.status
                        .as_ref()
                        .and_then(|s| s.conditions.as_ref())
                        .is_some_and(|conds| {
                            conds
                                .iter()
                                .any(|c| c.type_ == "Ready" && c.status == "True")
                        })
                });
                Ok(ready)
            }
        })
        .await?;

        self.executed = true;
        Ok(())
    }

    // `run` scales the database down and creates the workload before it
    // flips `executed`, so a partial failure leaves real state behind.
    // Rollback is unconditional: deletes are 404-tolerant and scaling an
    // untouched database to one replica is a no-op.
    fn can_rollback(&self) -> bool {
        true
    }

    async fn rollback(&mut self) -> Result<(), ControllerError> {
        self.delete_migration_workload().await?;
        self.scale_db(1).await?;
        self.executed = false;
        Ok(())
    }
}
