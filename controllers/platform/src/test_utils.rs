//! Shared fixtures for unit tests.

use std::path::PathBuf;
use std::sync::Arc;

use http::{Request, Response};
use kube::client::Body;
use kube::Client;
use tokio::sync::Mutex;
use tower::service_fn;

use crds::{
    BackupConfig, ComponentsSpec, IntegrationPlatform, IntegrationPlatformSpec,
    IntegrationPlatformStatus, PlatformPhase, SchedulingSpec,
};

use crate::actions::ActionContext;
use crate::apply::{MergeConfig, ResourceApplier};
use crate::backup::MockBackupRunner;
use crate::render::MockManifestRenderer;
use crate::status::MockPlatformStore;

/// Target version the fixtures install towards.
pub const TARGET_VERSION: &str = "7.1.0";

/// Client whose every request fails. Tests exercising phase-machine
/// logic must go through the mocked store instead of the cluster, and
/// this client makes any stray cluster call a loud error.
pub fn no_cluster_client() -> Client {
    let service = service_fn(|_req: Request<Body>| async {
        Err::<Response<Body>, std::io::Error>(std::io::Error::other("no cluster in unit tests"))
    });
    Client::new(service, "unit-tests")
}

/// Platform named `name` sitting in the given phase with a default spec.
pub fn platform(name: &str, phase: PlatformPhase) -> IntegrationPlatform {
    let spec = IntegrationPlatformSpec {
        backup: BackupConfig::default(),
        route_hostname: None,
        components: ComponentsSpec::default(),
        infra_scheduling: SchedulingSpec::default(),
        force_migration: false,
    };
    let mut platform = IntegrationPlatform::new(name, spec);
    platform.metadata.uid = Some(format!("{name}-uid"));
    platform.metadata.resource_version = Some("1".to_string());
    platform.status = Some(IntegrationPlatformStatus {
        phase,
        ..IntegrationPlatformStatus::default()
    });
    platform
}

/// Action context over the given mocks and the offline client.
pub fn action_ctx(
    store: MockPlatformStore,
    renderer: MockManifestRenderer,
    backups: MockBackupRunner,
) -> ActionContext {
    let client = no_cluster_client();
    ActionContext {
        client: client.clone(),
        namespace: "platform-tests".to_string(),
        store: Arc::new(store),
        renderer: Arc::new(renderer),
        backups: Arc::new(backups),
        applier: ResourceApplier::new(client, MergeConfig::default()),
        target_version: TARGET_VERSION.to_string(),
        db_version_file: PathBuf::from("/nonexistent/postgresql.txt"),
        pipeline: Mutex::new(None),
    }
}

/// Action context where only the store matters.
pub fn action_ctx_with_store(store: MockPlatformStore) -> ActionContext {
    action_ctx(store, MockManifestRenderer::new(), MockBackupRunner::new())
}
