//! IntegrationPlatform CRD
//!
//! The declarative resource describing the desired state of one installed
//! platform instance (server, meta, ui, database and prometheus components)
//! plus the observed lifecycle status maintained by the operator.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "platform.microscaler.io",
    version = "v1alpha1",
    kind = "IntegrationPlatform",
    status = "IntegrationPlatformStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationPlatformSpec {
    /// Scheduled backup configuration
    #[serde(default)]
    pub backup: BackupConfig,

    /// External hostname used to access the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_hostname: Option<String>,

    /// Configuration of the core platform components
    #[serde(default)]
    pub components: ComponentsSpec,

    /// Scheduling constraints applied to all infrastructure pods
    #[serde(default)]
    pub infra_scheduling: SchedulingSpec,

    /// Force the data migration step even when versions look equal
    #[serde(default)]
    pub force_migration: bool,
}

/// Configuration of the core platform components.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsSpec {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub meta: MetaConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetaConfig {
    #[serde(default)]
    pub resources: ResourcesWithVolume,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    #[serde(default)]
    pub resources: ResourcesWithVolume,
}

/// PostgreSQL database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Username for the PostgreSQL user that accesses the database
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Name of the PostgreSQL database
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Host and port of the PostgreSQL service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// If set, use an external database instead of the managed one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_db_url: String,

    #[serde(default)]
    pub resources: ResourcesWithPersistentVolume,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesWithVolume {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_capacity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesWithPersistentVolume {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_capacity: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_storage_class: String,
}

/// Affinity and toleration constraints, kept as raw JSON so they can be
/// forwarded verbatim as patch payloads to the workload objects.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<serde_json::Value>,
}

/// Scheduled backup configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Backup cadence: `hourly`, `daily`, `midnight`, `weekly`, `monthly`,
    /// `yearly` or `every <n>m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// Observed backup run timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// When the next backup is planned
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next: String,

    /// When the previous backup was executed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous: String,
}

/// Coarse lifecycle state of the platform instance. The primary
/// state-machine variable; only reconcile actions may write it.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash,
)]
pub enum PlatformPhase {
    /// Status not yet populated
    #[default]
    #[serde(rename = "")]
    Missing,
    Installing,
    Starting,
    StartupFailed,
    Installed,
    NotInstalled,
    Upgrading,
    PostUpgradeRun,
    PostUpgradeRunSucceed,
    UpgradeFailureBackoff,
    UpgradeFailed,
}

impl fmt::Display for PlatformPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlatformPhase::Missing => "",
            PlatformPhase::Installing => "Installing",
            PlatformPhase::Starting => "Starting",
            PlatformPhase::StartupFailed => "StartupFailed",
            PlatformPhase::Installed => "Installed",
            PlatformPhase::NotInstalled => "NotInstalled",
            PlatformPhase::Upgrading => "Upgrading",
            PlatformPhase::PostUpgradeRun => "PostUpgradeRun",
            PlatformPhase::PostUpgradeRunSucceed => "PostUpgradeRunSucceed",
            PlatformPhase::UpgradeFailureBackoff => "UpgradeFailureBackoff",
            PlatformPhase::UpgradeFailed => "UpgradeFailed",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable explanation attached to a phase.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash,
)]
pub enum StatusReason {
    #[default]
    #[serde(rename = "")]
    Missing,
    Duplicate,
    DeploymentNotReady,
    UpgradeFailed,
    TooManyUpgradeAttempts,
    PostUpgradeRun,
    Migrated,
}

/// Observed state of an IntegrationPlatform.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationPlatformStatus {
    #[serde(default)]
    pub phase: PlatformPhase,

    #[serde(default)]
    pub reason: StatusReason,

    /// Human readable detail for the current phase/reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Version currently installed in the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Version the operator is driving the installation towards
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_version: String,

    /// Number of failed upgrade attempts since the last success
    #[serde(default)]
    pub upgrade_attempts: u32,

    /// When the most recent upgrade attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_failure: Option<chrono::DateTime<chrono::Utc>>,

    /// Retry the upgrade even though the attempt bookkeeping says otherwise
    #[serde(default)]
    pub force_upgrade: bool,

    #[serde(default)]
    pub backup: BackupStatus,
}

impl IntegrationPlatform {
    /// Current phase, `Missing` when the status subresource is not yet set.
    pub fn phase(&self) -> PlatformPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the current phase is one of `phases`.
    pub fn phase_is(&self, phases: &[PlatformPhase]) -> bool {
        phases.contains(&self.phase())
    }

    /// Status snapshot, defaulted when not yet populated.
    pub fn status_or_default(&self) -> IntegrationPlatformStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wire_strings_round_trip() {
        let cases = [
            (PlatformPhase::Missing, "\"\""),
            (PlatformPhase::Installing, "\"Installing\""),
            (PlatformPhase::Starting, "\"Starting\""),
            (PlatformPhase::StartupFailed, "\"StartupFailed\""),
            (PlatformPhase::Installed, "\"Installed\""),
            (PlatformPhase::NotInstalled, "\"NotInstalled\""),
            (PlatformPhase::Upgrading, "\"Upgrading\""),
            (PlatformPhase::PostUpgradeRun, "\"PostUpgradeRun\""),
            (
                PlatformPhase::PostUpgradeRunSucceed,
                "\"PostUpgradeRunSucceed\"",
            ),
            (
                PlatformPhase::UpgradeFailureBackoff,
                "\"UpgradeFailureBackoff\"",
            ),
            (PlatformPhase::UpgradeFailed, "\"UpgradeFailed\""),
        ];

        for (phase, wire) in cases {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, wire);
            let back: PlatformPhase = serde_json::from_str(wire).unwrap();
            assert_eq!(back, phase);
        }
    }

    #[test]
    fn missing_phase_defaults() {
        let status = IntegrationPlatformStatus::default();
        assert_eq!(status.phase, PlatformPhase::Missing);
        assert_eq!(status.reason, StatusReason::Missing);
        assert_eq!(status.upgrade_attempts, 0);
    }

    #[test]
    fn phase_helper_handles_missing_status() {
        let platform = IntegrationPlatform::new(
            "app",
            IntegrationPlatformSpec {
                backup: BackupConfig::default(),
                route_hostname: None,
                components: ComponentsSpec::default(),
                infra_scheduling: SchedulingSpec::default(),
                force_migration: false,
            },
        );
        assert_eq!(platform.phase(), PlatformPhase::Missing);
        assert!(platform.phase_is(&[PlatformPhase::Missing, PlatformPhase::Installing]));
        assert!(!platform.phase_is(&[PlatformPhase::Installed]));
    }
}
