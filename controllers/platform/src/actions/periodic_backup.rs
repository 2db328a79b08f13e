//! Scheduled platform backups.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crds::{IntegrationPlatform, PlatformPhase};

use crate::error::ControllerError;

use super::{ActionContext, OperatorAction};

/// Turn a schedule keyword into a backup interval.
///
/// Supported values: `hourly`, `daily`, `midnight` (alias of daily),
/// `weekly`, `monthly`, `yearly` and `every <n>m` for an interval in
/// minutes.
pub fn parse_schedule(schedule: &str) -> Result<Duration, ControllerError> {
    match schedule {
        "hourly" => Ok(Duration::hours(1)),
        "daily" | "midnight" => Ok(Duration::days(1)),
        "weekly" => Ok(Duration::weeks(1)),
        "monthly" => Ok(Duration::days(30)),
        "yearly" => Ok(Duration::days(365)),
        other => {
            let minutes = other
                .strip_prefix("every ")
                .and_then(|rest| rest.strip_suffix('m'))
                .and_then(|n| n.trim().parse::<i64>().ok())
                .filter(|n| *n > 0);
            match minutes {
                Some(n) => Ok(Duration::minutes(n)),
                None => Err(ControllerError::InvalidConfig(format!(
                    "unrecognized backup schedule {other:?}"
                ))),
            }
        }
    }
}

/// Runs a platform backup whenever the scheduled time passes, keeping
/// the next/previous run timestamps in the status. The check is driven
/// by the steady reconcile requeue, so no separate timer task is needed.
pub struct PeriodicBackupAction;

impl PeriodicBackupAction {
    /// Fresh action.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PeriodicBackupAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorAction for PeriodicBackupAction {
    fn name(&self) -> &'static str {
        "periodic-backup"
    }

    fn can_execute(&self, platform: &IntegrationPlatform) -> bool {
        platform.phase_is(&[PlatformPhase::Installed])
    }

    async fn execute(
        &mut self,
        ctx: &ActionContext,
        platform: &IntegrationPlatform,
    ) -> Result<(), ControllerError> {
        let Some(schedule) = platform.spec.backup.schedule.as_deref() else {
            return Ok(());
        };
        let interval = parse_schedule(schedule)?;

        let name = platform
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("platform has no name".to_string()))?;

        let next = platform.status_or_default().backup.next;
        if next.is_empty() {
            let planned = (Utc::now() + interval).to_rfc3339();
            info!(name, schedule, next = %planned, "backup scheduled");
            ctx.store
                .update_status(
                    name,
                    Box::new(move |status| {
                        status.backup.next = planned.clone();
                    }),
                )
                .await?;
            return Ok(());
        }

        let due = DateTime::parse_from_rfc3339(&next)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                ControllerError::InvalidConfig(format!("bad backup timestamp {next:?}: {e}"))
            })?;
        if Utc::now() < due {
            return Ok(());
        }

        info!(name, "running scheduled backup");
        if let Err(e) = ctx.backups.run().await {
            // a failed backup does not block the platform; retry next slot
            warn!(name, error = %e, "scheduled backup failed");
        }

        let now = Utc::now();
        let previous = now.to_rfc3339();
        let planned = (now + interval).to_rfc3339();
        ctx.store
            .update_status(
                name,
                Box::new(move |status| {
                    status.backup.previous = previous.clone();
                    status.backup.next = planned.clone();
                }),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_schedules() {
        assert_eq!(parse_schedule("hourly").unwrap(), Duration::hours(1));
        assert_eq!(parse_schedule("daily").unwrap(), Duration::days(1));
        assert_eq!(parse_schedule("midnight").unwrap(), Duration::days(1));
        assert_eq!(parse_schedule("weekly").unwrap(), Duration::weeks(1));
        assert_eq!(parse_schedule("monthly").unwrap(), Duration::days(30));
        assert_eq!(parse_schedule("yearly").unwrap(), Duration::days(365));
    }

    #[test]
    fn minute_interval_schedule() {
        assert_eq!(parse_schedule("every 45m").unwrap(), Duration::minutes(45));
    }

    #[test]
    fn bad_schedules_are_rejected() {
        assert!(parse_schedule("fortnightly").is_err());
        assert!(parse_schedule("every 0m").is_err());
        assert!(parse_schedule("every m").is_err());
    }
}
