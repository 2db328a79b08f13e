//! Bounded polling helper.
//!
//! Readiness of external objects (Deployments, Pods, Jobs) is only
//! observable by polling. Every wait in the controller goes through
//! `poll_until`, which carries both an interval and a hard timeout and
//! fails rather than hangs once the timeout passes.

use std::future::Future;
use std::time::Duration;

use crate::error::ControllerError;

/// Default interval between condition checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default hard timeout for a single wait.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Poll `cond` every `interval` until it returns true, errors, or
/// `timeout` elapses. The condition is checked immediately on entry.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut cond: F,
) -> Result<(), ControllerError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool, ControllerError>> + Send,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if cond().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(ControllerError::PollTimeout(what.to_string()));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_once_condition_holds() {
        let calls = AtomicU32::new(0);

        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_secs(30),
            "test condition",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n >= 2) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_past_the_hard_timeout() {
        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(20),
            "never ready",
            || async { Ok(false) },
        )
        .await;

        match result {
            Err(ControllerError::PollTimeout(what)) => assert_eq!(what, "never ready"),
            other => panic!("expected PollTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn condition_errors_are_propagated() {
        let result: Result<(), ControllerError> = poll_until(
            Duration::from_secs(1),
            Duration::from_secs(10),
            "broken probe",
            || async { Err(ControllerError::DatabaseVersion("boom".to_string())) },
        )
        .await;

        assert!(matches!(result, Err(ControllerError::DatabaseVersion(_))));
    }
}
