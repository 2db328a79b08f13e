//! Reconcile actions.
//!
//! A reconcile pass walks an ordered list of actions; each action declares
//! the phases it applies to via `can_execute` and performs one bounded
//! piece of work in `execute`. Private state an action keeps across
//! passes (caches, last-seen values) lives in the action value itself,
//! which is why the list is owned mutably by the controller context;
//! state shared between actions, like the in-flight upgrade pipeline,
//! lives in [`ActionContext`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::Mutex;

use crds::IntegrationPlatform;

use crate::apply::ResourceApplier;
use crate::backup::BackupRunner;
use crate::error::ControllerError;
use crate::render::ManifestRenderer;
use crate::status::PlatformStore;
use crate::upgrade::UpgradePipeline;

pub mod attach_volume;
pub mod backoff;
pub mod check_updates;
pub mod initialize;
pub mod install;
pub mod periodic_backup;
pub mod pod_scheduling;
pub mod startup;
pub mod upgrade;

/// Shared collaborators handed to every action.
pub struct ActionContext {
    /// Cluster client
    pub client: Client,
    /// Namespace being reconciled
    pub namespace: String,
    /// Platform reads and status writes
    pub store: Arc<dyn PlatformStore>,
    /// Renders the bundled manifest set
    pub renderer: Arc<dyn ManifestRenderer>,
    /// Backup and restore machinery
    pub backups: Arc<dyn BackupRunner>,
    /// Deep-merge apply engine
    pub applier: ResourceApplier,
    /// Version this operator build drives installations towards
    pub target_version: String,
    /// Marker file carrying the bundled database version
    pub db_version_file: PathBuf,
    /// Pipeline of the upgrade currently in flight, if any. Shared between
    /// the upgrade action (which runs it) and the install action (which
    /// books reinstall failures against it).
    pub pipeline: Mutex<Option<UpgradePipeline>>,
}

/// One unit of reconcile work.
#[async_trait]
pub trait OperatorAction: Send {
    /// Action name for log lines.
    fn name(&self) -> &'static str;

    /// Whether this action applies to the platform's current phase.
    fn can_execute(&self, platform: &IntegrationPlatform) -> bool;

    /// Perform the action against the given snapshot.
    async fn execute(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<(), ControllerError>;
}

/// The action list in its reconcile order. Upgrade-related actions run
/// before install so that a pending upgrade is picked up before the
/// resource set is touched.
pub fn default_actions() -> Vec<Box<dyn OperatorAction>> {
    vec![
        Box::new(check_updates::CheckUpdatesAction),
        Box::new(upgrade::UpgradeAction::new()),
        Box::new(backoff::UpgradeBackoffAction),
        Box::new(initialize::InitializeAction),
        Box::new(install::InstallAction::new()),
        Box::new(startup::StartupAction),
        Box::new(attach_volume::AttachVolumeAction),
        Box::new(pod_scheduling::PodSchedulingAction::new()),
        Box::new(periodic_backup::PeriodicBackupAction::new()),
    ]
}
