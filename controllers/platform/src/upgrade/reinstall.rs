//! Reinstall marker step.
//!
//! The actual reinstall of the platform at the target version happens in
//! the post-upgrade reconcile pass, where the regular install machinery
//! re-applies the manifest set. This step only records that the pipeline
//! reached that point, and carries the rollback path: when the reinstall
//! goes wrong, the pre-upgrade backup is validated and restored.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::backup::BackupRunner;
use crate::error::ControllerError;

use super::PipelineStep;

/// Hands over to the install machinery and restores from backup on rollback.
pub struct ReinstallStep {
    runner: Arc<dyn BackupRunner>,
    executed: bool,
}

impl ReinstallStep {
    /// Build the step around the backup runner used for rollback.
    pub fn new(runner: Arc<dyn BackupRunner>) -> Self {
        Self {
            runner,
            executed: false,
        }
    }
}

#[async_trait]
impl PipelineStep for ReinstallStep {
    fn name(&self) -> &str {
        "Reinstall"
    }

    fn executed(&self) -> bool {
        self.executed
    }

    async fn run(&mut self) -> Result<(), ControllerError> {
        info!("handing over to the install machinery for the target version");
        self.executed = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ControllerError> {
        self.runner.validate().await?;
        self.runner.restore_resources().await?;
        self.runner.restore_db().await?;
        self.executed = false;
        Ok(())
    }
}
