//! Operator configuration and well-known resource names.
//!
//! Configuration is loaded from environment variables, matching how the
//! controller is parameterised in its deployment manifest.

use std::env;
use std::path::PathBuf;

/// Label selector matching every resource owned by a platform installation.
pub const APP_SELECTOR: &str = "platform.microscaler.io/app=platform";

/// Label selector matching the infrastructure workloads (server, meta, ui,
/// db, prometheus) as opposed to user-deployed integrations.
pub const INFRA_SELECTOR: &str =
    "platform.microscaler.io/app=platform,platform.microscaler.io/type=infrastructure";

/// Label selector matching the application tier scaled down during upgrades.
pub const APP_TIER_SELECTOR: &str =
    "platform.microscaler.io/app=platform,platform.microscaler.io/tier=app";

/// Label selector matching the database pod.
pub const DB_POD_SELECTOR: &str = "platform.microscaler.io/component=platform-db";

/// Label selector matching the temporary database migration workload.
pub const DB_UPGRADE_POD_SELECTOR: &str =
    "platform.microscaler.io/component=platform-db-upgrade";

/// Name of the managed database Deployment and its volume claim.
pub const DB_DEPLOYMENT: &str = "platform-db";

/// Name of the temporary migration Deployment and its volume claim.
pub const DB_UPGRADE_DEPLOYMENT: &str = "platform-db-upgrade";

/// Container name running PostgreSQL in both db workloads.
pub const DB_CONTAINER: &str = "postgresql";

/// Label key recording the owning IntegrationPlatform UID on every
/// generated resource; used for garbage collection.
pub const OWNER_LABEL: &str = "owner";

/// Runtime configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` means all namespaces
    pub namespace: Option<String>,
    /// Root directory for backup archives
    pub backup_dir: PathBuf,
    /// Directory holding the bundled manifest set
    pub manifest_dir: PathBuf,
    /// Marker file written by the database init container with the
    /// PostgreSQL version string of the bundled image
    pub db_version_file: PathBuf,
    /// Platform version this operator build installs and upgrades towards
    pub target_version: String,
    /// Name of the managed PostgreSQL database
    pub db_name: String,
    /// User the operator connects to the database as
    pub db_user: String,
}

impl OperatorConfig {
    /// Load configuration from environment variables, falling back to the
    /// image defaults.
    pub fn from_env() -> Self {
        Self {
            namespace: env::var("WATCH_NAMESPACE").ok(),
            backup_dir: env::var("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/backups")),
            manifest_dir: env::var("MANIFEST_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/manifests")),
            db_version_file: env::var("DB_VERSION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data/postgresql.txt")),
            target_version: env::var("TARGET_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            db_name: env::var("DB_NAME").unwrap_or_else(|_| "platform".to_string()),
            db_user: env::var("DB_USER").unwrap_or_else(|_| "platform".to_string()),
        }
    }
}
