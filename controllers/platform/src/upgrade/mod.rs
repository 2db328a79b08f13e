//! Upgrade pipeline: an ordered list of steps with an attempt log.
//!
//! A pipeline run is fail-fast: steps execute in order and the first
//! failure stops the run and is recorded. Rollback walks every step and
//! undoes the ones that report they ran, and is only permitted when the
//! attempt log shows the last run failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::Client;
use tracing::{info, warn};

use crate::error::ControllerError;

pub mod backup;
pub mod database;
pub mod reinstall;
pub mod scale;

/// Shared handles every pipeline step needs.
#[derive(Clone)]
pub struct StepContext {
    /// Cluster client
    pub client: Client,
    /// Namespace the platform lives in
    pub namespace: String,
}

/// One stage of the upgrade pipeline.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Stable step name, used in the attempt log and in log lines.
    fn name(&self) -> &str;

    /// Whether this step has already run in the current pipeline.
    fn executed(&self) -> bool;

    /// Whether the step should run. The default skips steps that already
    /// ran, which makes a re-entered pipeline idempotent.
    async fn can_run(&self) -> Result<bool, ControllerError> {
        Ok(!self.executed())
    }

    /// Execute the step.
    async fn run(&mut self) -> Result<(), ControllerError>;

    /// Whether the step has anything to undo.
    fn can_rollback(&self) -> bool {
        self.executed()
    }

    /// Undo the step's effects.
    async fn rollback(&mut self) -> Result<(), ControllerError>;
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The run completed every step
    Succeeded {
        /// When the run finished
        at: DateTime<Utc>,
    },
    /// The run stopped at a failing step
    Failed {
        /// When the failure happened
        at: DateTime<Utc>,
        /// Name of the failing step
        step: String,
        /// Failure detail
        error: String,
    },
}

/// Ordered steps plus the log of previous runs.
pub struct UpgradePipeline {
    steps: Vec<Box<dyn PipelineStep>>,
    attempts: Vec<Attempt>,
}

impl UpgradePipeline {
    /// Build a pipeline over the given steps, with an empty attempt log.
    pub fn new(steps: Vec<Box<dyn PipelineStep>>) -> Self {
        Self {
            steps,
            attempts: Vec::new(),
        }
    }

    /// Attempts recorded so far, oldest first.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Run the pipeline front to back. The first failing step stops the
    /// run; either way exactly one attempt is appended to the log.
    pub async fn upgrade(&mut self) -> Result<(), ControllerError> {
        for step in &mut self.steps {
            if !step.can_run().await? {
                info!(step = step.name(), "step skipped");
                continue;
            }

            info!(step = step.name(), "running upgrade step");
            if let Err(e) = step.run().await {
                let failure = Attempt::Failed {
                    at: Utc::now(),
                    step: step.name().to_string(),
                    error: e.to_string(),
                };
                warn!(step = step.name(), error = %e, "upgrade step failed");
                self.attempts.push(failure);
                return Err(ControllerError::Step {
                    step: step.name().to_string(),
                    message: e.to_string(),
                });
            }
        }

        self.attempts.push(Attempt::Succeeded { at: Utc::now() });
        Ok(())
    }

    /// Undo a failed run. Only legal when the last attempt failed; every
    /// step that reports it ran is rolled back, and individual rollback
    /// errors are logged but do not stop the remaining steps. On return
    /// the attempt log is cleared so a fresh run starts clean.
    pub async fn rollback(&mut self) -> Result<(), ControllerError> {
        match self.attempts.last() {
            Some(Attempt::Failed { .. }) => {}
            Some(Attempt::Succeeded { .. }) => {
                return Err(ControllerError::RollbackNotAllowed(
                    "last attempt succeeded".to_string(),
                ));
            }
            None => {
                return Err(ControllerError::RollbackNotAllowed(
                    "no attempt recorded".to_string(),
                ));
            }
        }

        for step in &mut self.steps {
            if !step.can_rollback() {
                continue;
            }
            info!(step = step.name(), "rolling back upgrade step");
            if let Err(e) = step.rollback().await {
                warn!(step = step.name(), error = %e, "rollback of step failed");
            }
        }

        self.attempts.clear();
        Ok(())
    }

    /// Record that the reinstall that follows a successful pipeline run
    /// failed, so the next pass sees a failed attempt and may roll back.
    /// Returns how many reinstall failures the log now holds, so the
    /// caller can decide when to stop retrying.
    pub fn install_failed(&mut self) -> usize {
        self.attempts.push(Attempt::Failed {
            at: Utc::now(),
            step: "Reinstall".to_string(),
            error: "platform reinstall failed after upgrade".to_string(),
        });
        self.attempts
            .iter()
            .filter(|a| matches!(a, Attempt::Failed { step, .. } if step == "Reinstall"))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct StubStep {
        name: &'static str,
        executed: bool,
        fail: bool,
        rollback_always: bool,
        runs: Arc<AtomicU32>,
        rollbacks: Arc<AtomicU32>,
    }

    impl StubStep {
        fn new(name: &'static str, fail: bool) -> (Self, Arc<AtomicU32>, Arc<AtomicU32>) {
            let runs = Arc::new(AtomicU32::new(0));
            let rollbacks = Arc::new(AtomicU32::new(0));
            (
                Self {
                    name,
                    executed: false,
                    fail,
                    rollback_always: false,
                    runs: runs.clone(),
                    rollbacks: rollbacks.clone(),
                },
                runs,
                rollbacks,
            )
        }

        fn rollback_always(mut self) -> Self {
            self.rollback_always = true;
            self
        }
    }

    #[async_trait]
    impl PipelineStep for StubStep {
        fn name(&self) -> &str {
            self.name
        }

        fn executed(&self) -> bool {
            self.executed
        }

        async fn run(&mut self) -> Result<(), ControllerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ControllerError::Step {
                    step: self.name.to_string(),
                    message: "boom".to_string(),
                });
            }
            self.executed = true;
            Ok(())
        }

        fn can_rollback(&self) -> bool {
            self.rollback_always || self.executed
        }

        async fn rollback(&mut self) -> Result<(), ControllerError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.executed = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_pass_records_one_success() {
        let (a, _, _) = StubStep::new("A", false);
        let (b, _, _) = StubStep::new("B", false);
        let mut pipeline = UpgradePipeline::new(vec![Box::new(a), Box::new(b)]);

        pipeline.upgrade().await.unwrap();

        assert_eq!(pipeline.attempts().len(), 1);
        assert!(matches!(pipeline.attempts()[0], Attempt::Succeeded { .. }));
    }

    #[tokio::test]
    async fn failure_stops_the_run_and_names_the_step() {
        let (a, a_runs, _) = StubStep::new("A", false);
        let (b, _, _) = StubStep::new("B", true);
        let (c, c_runs, _) = StubStep::new("C", false);
        let mut pipeline =
            UpgradePipeline::new(vec![Box::new(a), Box::new(b), Box::new(c)]);

        let err = pipeline.upgrade().await.unwrap_err();

        assert!(matches!(err, ControllerError::Step { ref step, .. } if step == "B"));
        assert_eq!(a_runs.load(Ordering::SeqCst), 1);
        assert_eq!(c_runs.load(Ordering::SeqCst), 0);
        match &pipeline.attempts()[0] {
            Attempt::Failed { step, .. } => assert_eq!(step, "B"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn executed_steps_are_skipped_on_reentry() {
        let (a, a_runs, _) = StubStep::new("A", false);
        let (b, _, _) = StubStep::new("B", true);
        let mut pipeline = UpgradePipeline::new(vec![Box::new(a), Box::new(b)]);

        assert!(pipeline.upgrade().await.is_err());
        assert!(pipeline.upgrade().await.is_err());

        // A ran once; the retry skipped it and went straight to B
        assert_eq!(a_runs.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.attempts().len(), 2);
    }

    #[tokio::test]
    async fn rollback_requires_a_trailing_failure() {
        let (a, _, _) = StubStep::new("A", false);
        let mut pipeline = UpgradePipeline::new(vec![Box::new(a)]);

        assert!(matches!(
            pipeline.rollback().await,
            Err(ControllerError::RollbackNotAllowed(_))
        ));

        pipeline.upgrade().await.unwrap();
        assert!(matches!(
            pipeline.rollback().await,
            Err(ControllerError::RollbackNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn rollback_undoes_executed_steps_and_clears_the_log() {
        let (a, _, a_rb) = StubStep::new("A", false);
        let (b, _, b_rb) = StubStep::new("B", true);
        let mut pipeline = UpgradePipeline::new(vec![Box::new(a), Box::new(b)]);

        assert!(pipeline.upgrade().await.is_err());
        pipeline.rollback().await.unwrap();

        assert_eq!(a_rb.load(Ordering::SeqCst), 1);
        // B never executed, so it has nothing to undo
        assert_eq!(b_rb.load(Ordering::SeqCst), 0);
        assert!(pipeline.attempts().is_empty());
    }

    #[tokio::test]
    async fn rollback_includes_steps_that_failed_partway() {
        // a step that leaves state behind before it fails opts into
        // unconditional rollback, and the pipeline must honor that
        let (a, _, a_rb) = StubStep::new("A", false);
        let (b, _, b_rb) = StubStep::new("B", true);
        let b = b.rollback_always();
        let mut pipeline = UpgradePipeline::new(vec![Box::new(a), Box::new(b)]);

        assert!(pipeline.upgrade().await.is_err());
        pipeline.rollback().await.unwrap();

        assert_eq!(a_rb.load(Ordering::SeqCst), 1);
        assert_eq!(b_rb.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn install_failed_counts_only_reinstall_failures() {
        let (a, _, _) = StubStep::new("A", false);
        let mut pipeline = UpgradePipeline::new(vec![Box::new(a)]);

        pipeline.upgrade().await.unwrap();
        assert_eq!(pipeline.install_failed(), 1);
        assert_eq!(pipeline.install_failed(), 2);
        match pipeline.attempts().last() {
            Some(Attempt::Failed { step, .. }) => assert_eq!(step, "Reinstall"),
            other => panic!("expected Failed, got {other:?}"),
        }
        // a failed tail re-arms rollback
        assert!(pipeline.rollback().await.is_ok());
    }
}
