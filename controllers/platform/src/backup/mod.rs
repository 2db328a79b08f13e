//! Point-in-time export and restore of the managed platform.
//!
//! A backup is a directory `<root>/<unix-timestamp>/` holding a
//! `resources/` tree of YAML dumps of every labeled infrastructure object
//! plus `platform-db.dump`, a SQL export produced by exec-ing `pg_dump`
//! inside the database pod. Remote archive storage plugs in behind the
//! [`Uploader`] trait and is not provided here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::apply::ResourceApplier;
use crate::config::{DB_CONTAINER, DB_POD_SELECTOR, INFRA_SELECTOR};
use crate::error::ControllerError;
use crate::exec;

#[cfg(test)]
use mockall::automock;

/// The file holding the SQL dump inside a backup directory.
pub const DB_DUMP_FILE: &str = "platform-db.dump";

/// Produces, validates and restores platform backups.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Full backup: dump labeled resources and the database, then hand the
    /// directory to any enabled uploader.
    async fn run(&self) -> Result<(), ControllerError>;

    /// Inverse of [`run`](BackupRunner::run): restore database and
    /// resources from the most recent backup.
    async fn restore(&self) -> Result<(), ControllerError>;

    /// Check that the most recent backup has both a resources manifest set
    /// and a database dump before it is trusted for rollback.
    async fn validate(&self) -> Result<(), ControllerError>;

    /// Resources-only restore, used by pipeline rollback without touching
    /// the database.
    async fn restore_resources(&self) -> Result<(), ControllerError>;

    /// Database-only restore via an exec'd import.
    async fn restore_db(&self) -> Result<(), ControllerError>;
}

/// Remote storage for finished backup directories.
pub trait Uploader: Send + Sync {
    /// Whether this uploader is usable with the current settings.
    fn enabled(&self) -> bool;

    /// Upload the backup directory to the remote location.
    fn upload(&self, dir: &Path) -> Result<(), ControllerError>;
}

/// Kinds included in a resource backup.
const BACKUP_KINDS: &[(&str, &str)] = &[
    ("v1", "ConfigMap"),
    ("v1", "PersistentVolumeClaim"),
    ("v1", "Secret"),
    ("v1", "Service"),
    ("v1", "ServiceAccount"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("apps/v1", "Deployment"),
];

/// BackupRunner implementation working against the live cluster.
pub struct PodBackup {
    client: Client,
    namespace: String,
    db_name: String,
    db_user: String,
    backup_root: PathBuf,
    applier: ResourceApplier,
    uploaders: Vec<Box<dyn Uploader>>,
}

impl std::fmt::Debug for PodBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodBackup")
            .field("namespace", &self.namespace)
            .field("backup_root", &self.backup_root)
            .finish_non_exhaustive()
    }
}

impl PodBackup {
    /// Create a backup runner for one namespace.
    pub fn new(
        client: Client,
        namespace: &str,
        db_name: &str,
        db_user: &str,
        backup_root: PathBuf,
        applier: ResourceApplier,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            db_name: db_name.to_string(),
            db_user: db_user.to_string(),
            backup_root,
            applier,
            uploaders: Vec::new(),
        }
    }

    /// Register a remote uploader.
    #[must_use]
    pub fn with_uploader(mut self, uploader: Box<dyn Uploader>) -> Self {
        self.uploaders.push(uploader);
        self
    }

    async fn backup_resources(&self, dir: &Path) -> Result<(), ControllerError> {
        let resources_dir = dir.join("resources");
        tokio::fs::create_dir_all(&resources_dir).await?;

        for (api_version, kind) in BACKUP_KINDS {
            let gvk = crate::apply::gvk_of(&serde_json::json!({
                "apiVersion": api_version,
                "kind": kind,
            }))?;
            let ar = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &self.namespace, &ar);

            let list = api
                .list(&ListParams::default().labels(INFRA_SELECTOR).limit(200))
                .await?;

            for item in list.items {
                let name = item.metadata.name.clone().unwrap_or_default();
                let body = serde_json::to_value(&item)?;
                let yaml = serde_yaml::to_string(&body)?;
                let file = resources_dir
                    .join(format!("{}-{}.yaml", kind.to_lowercase(), name));
                tokio::fs::write(&file, yaml).await?;
                debug!(kind, name = %name, "resource dumped");
            }
        }

        Ok(())
    }

    async fn backup_database(&self, dir: &Path) -> Result<(), ControllerError> {
        let dump = self
            .exec_in_db_pod(
                vec![
                    "pg_dump".to_string(),
                    "--clean".to_string(),
                    "--if-exists".to_string(),
                    format!("--dbname={}", self.db_name),
                    format!("--username={}", self.db_user),
                    "--host=127.0.0.1".to_string(),
                ],
                None,
            )
            .await?;

        if dump.is_empty() {
            return Err(ControllerError::Backup(
                "pg_dump produced no output".to_string(),
            ));
        }

        tokio::fs::write(dir.join(DB_DUMP_FILE), dump).await?;
        Ok(())
    }

    async fn exec_in_db_pod(
        &self,
        command: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, ControllerError> {
        let pod = exec::single_pod(&self.client, &self.namespace, DB_POD_SELECTOR).await?;
        exec::exec_capture(
            &self.client,
            &self.namespace,
            &pod,
            DB_CONTAINER,
            command,
            stdin,
        )
        .await
    }
}

#[async_trait]
impl BackupRunner for PodBackup {
    async fn run(&self) -> Result<(), ControllerError> {
        info!(namespace = %self.namespace, "starting platform backup");

        let dir = self.backup_root.join(Utc::now().timestamp().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        self.backup_resources(&dir).await?;
        self.backup_database(&dir).await?;

        for uploader in &self.uploaders {
            if uploader.enabled() {
                uploader.upload(&dir)?;
                break;
            }
        }

        info!(dir = %dir.display(), "platform backup done");
        Ok(())
    }

    async fn restore(&self) -> Result<(), ControllerError> {
        self.validate().await?;
        self.restore_db().await?;
        self.restore_resources().await?;
        Ok(())
    }

    async fn validate(&self) -> Result<(), ControllerError> {
        let dir = latest_backup(&self.backup_root)?;
        validate_dir(&dir)
    }

    async fn restore_resources(&self) -> Result<(), ControllerError> {
        let dir = latest_backup(&self.backup_root)?;
        let resources_dir = dir.join("resources");
        info!(dir = %resources_dir.display(), "restoring platform resources");

        let mut entries = tokio::fs::read_dir(&resources_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }

            let raw = tokio::fs::read_to_string(&path).await?;
            let body: Value = serde_yaml::from_str(&raw)?;
            if let Err(e) = self.applier.apply(&self.namespace, &body).await {
                // partial restore is better than none
                warn!(file = %path.display(), error = %e, "failed to restore resource");
            }
        }

        Ok(())
    }

    async fn restore_db(&self) -> Result<(), ControllerError> {
        let dir = latest_backup(&self.backup_root)?;
        let dump = tokio::fs::read(dir.join(DB_DUMP_FILE)).await?;

        info!(namespace = %self.namespace, "restoring platform database");
        self.exec_in_db_pod(
            vec![
                "psql".to_string(),
                "--set=ON_ERROR_STOP=on".to_string(),
                format!("--dbname={}", self.db_name),
                format!("--username={}", self.db_user),
                "--host=127.0.0.1".to_string(),
            ],
            Some(dump),
        )
        .await?;

        self.exec_in_db_pod(
            vec![
                "psql".to_string(),
                format!("--dbname={}", self.db_name),
                format!("--username={}", self.db_user),
                "--host=127.0.0.1".to_string(),
                "--command=ANALYZE".to_string(),
            ],
            None,
        )
        .await?;

        Ok(())
    }
}

/// Most recent backup directory under `root` (directories are named by
/// their unix timestamp, so lexicographic max on numeric names wins).
pub fn latest_backup(root: &Path) -> Result<PathBuf, ControllerError> {
    let mut newest: Option<(i64, PathBuf)> = None;

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(ts) = entry.file_name().to_string_lossy().parse::<i64>() else {
            continue;
        };
        if newest.as_ref().is_none_or(|(best, _)| ts > *best) {
            newest = Some((ts, entry.path()));
        }
    }

    newest.map(|(_, path)| path).ok_or_else(|| {
        ControllerError::Backup(format!("no backup found under {}", root.display()))
    })
}

/// A backup directory is structurally complete when it has a non-empty
/// `resources/` tree and a non-empty database dump.
pub fn validate_dir(dir: &Path) -> Result<(), ControllerError> {
    let resources = dir.join("resources");
    let has_resources = std::fs::read_dir(&resources)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if !has_resources {
        return Err(ControllerError::Backup(format!(
            "backup {} has no resources manifest set",
            dir.display()
        )));
    }

    let dump = dir.join(DB_DUMP_FILE);
    let has_dump = std::fs::metadata(&dump).map(|m| m.len() > 0).unwrap_or(false);
    if !has_dump {
        return Err(ControllerError::Backup(format!(
            "backup {} has no database dump",
            dir.display()
        )));
    }

    Ok(())
}
