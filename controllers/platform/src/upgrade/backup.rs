//! Backup step of the upgrade pipeline.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backup::BackupRunner;
use crate::error::ControllerError;

use super::PipelineStep;

/// Takes a full platform backup before anything destructive happens.
///
/// The step itself never rolls back: the backup it produced is exactly
/// what the later steps restore from, so deleting it on rollback would
/// defeat its purpose.
pub struct BackupStep {
    runner: Arc<dyn BackupRunner>,
    executed: bool,
}

impl BackupStep {
    /// Wrap a backup runner as a pipeline step.
    pub fn new(runner: Arc<dyn BackupRunner>) -> Self {
        Self {
            runner,
            executed: false,
        }
    }
}

#[async_trait]
impl PipelineStep for BackupStep {
    fn name(&self) -> &str {
        "Backup"
    }

    fn executed(&self) -> bool {
        self.executed
    }

    async fn run(&mut self) -> Result<(), ControllerError> {
        self.runner.run().await?;
        self.executed = true;
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        false
    }

    async fn rollback(&mut self) -> Result<(), ControllerError> {
        Ok(())
    }
}
