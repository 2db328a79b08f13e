//! Main controller implementation.
//!
//! Wires the action list, the apply engine and the backup machinery into
//! a kube-runtime controller over IntegrationPlatform resources.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::Client;
use kube_runtime::{watcher, Controller as RuntimeController};
use tracing::{info, warn};

use crds::IntegrationPlatform;

use crate::actions::{default_actions, ActionContext};
use crate::apply::{MergeConfig, ResourceApplier};
use crate::backup::PodBackup;
use crate::config::OperatorConfig;
use crate::context::ControllerContext;
use crate::error::ControllerError;
use crate::reconciler::{error_policy, reconcile};
use crate::render::DirRenderer;
use crate::status::KubePlatformStore;

/// Controller for IntegrationPlatform lifecycle management.
pub struct Controller {
    client: Client,
    context: Arc<ControllerContext>,
    namespace: String,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing platform controller");

        let client = Client::try_default().await?;
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        let renderer = Arc::new(DirRenderer::new(config.manifest_dir.clone()));
        let backups = Arc::new(PodBackup::new(
            client.clone(),
            &namespace,
            &config.db_name,
            &config.db_user,
            config.backup_dir.clone(),
            ResourceApplier::new(client.clone(), MergeConfig::default()),
        ));

        let store = Arc::new(KubePlatformStore::new(Api::namespaced(
            client.clone(),
            &namespace,
        )));

        let action_ctx = ActionContext {
            client: client.clone(),
            namespace: namespace.clone(),
            store,
            renderer,
            backups,
            applier: ResourceApplier::new(client.clone(), MergeConfig::default()),
            target_version: config.target_version.clone(),
            db_version_file: config.db_version_file.clone(),
            pipeline: tokio::sync::Mutex::new(None),
        };

        let context = Arc::new(ControllerContext::new(default_actions(), action_ctx));

        Ok(Self {
            client,
            context,
            namespace,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(namespace = %self.namespace, "Platform controller running");

        let api: Api<IntegrationPlatform> =
            Api::namespaced(self.client.clone(), &self.namespace);

        RuntimeController::new(api, watcher::Config::default())
            .run(reconcile, error_policy, self.context)
            .for_each(|result| async move {
                match result {
                    Ok((object, _action)) => {
                        info!(name = %object.name, "reconciled");
                    }
                    Err(e) => {
                        warn!(error = %e, "reconcile stream error");
                    }
                }
            })
            .await;

        Ok(())
    }
}
