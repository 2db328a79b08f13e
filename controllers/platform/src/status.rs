//! Platform resource access and optimistic-concurrency status updates.
//!
//! Actions and the reconciler go through [`PlatformStore`] rather than a
//! raw `Api` handle, so phase-machine logic can be tested against a mock.
//! Every status write re-reads the resource, mutates a copy and replaces
//! the status subresource keyed on the read `resourceVersion`. A 409 means
//! someone else wrote in between; the write is retried a few times on a
//! fresh read before the whole reconcile pass gives up.

use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams};
use crds::{IntegrationPlatform, IntegrationPlatformStatus};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::error::ControllerError;

/// Local retries before a conflict is surfaced to the reconciler.
const CONFLICT_RETRIES: usize = 3;

/// Status mutation applied on a fresh read before each write attempt.
pub type StatusMutation = Box<dyn Fn(&mut IntegrationPlatformStatus) + Send + Sync>;

/// Reads and status-writes for IntegrationPlatform resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Fetch one platform, `None` when it no longer exists.
    async fn get(&self, name: &str) -> Result<Option<IntegrationPlatform>, ControllerError>;

    /// All platforms in the watched namespace.
    async fn list(&self) -> Result<Vec<IntegrationPlatform>, ControllerError>;

    /// Apply `mutate` to the platform's status and persist it.
    async fn update_status(
        &self,
        name: &str,
        mutate: StatusMutation,
    ) -> Result<IntegrationPlatform, ControllerError>;
}

/// Store backed by the cluster API.
pub struct KubePlatformStore {
    api: Api<IntegrationPlatform>,
}

impl KubePlatformStore {
    /// Build a store over the given API handle.
    pub fn new(api: Api<IntegrationPlatform>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PlatformStore for KubePlatformStore {
    async fn get(&self, name: &str) -> Result<Option<IntegrationPlatform>, ControllerError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<IntegrationPlatform>, ControllerError> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn update_status(
        &self,
        name: &str,
        mutate: StatusMutation,
    ) -> Result<IntegrationPlatform, ControllerError> {
        for attempt in 0..CONFLICT_RETRIES {
            let mut platform = self.api.get(name).await?;
            let mut status = platform.status.take().unwrap_or_default();
            mutate(&mut status);
            platform.status = Some(status);

            let body = serde_json::to_vec(&platform)?;
            match self
                .api
                .replace_status(name, &PostParams::default(), body)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!(name, attempt, "status write conflicted, retrying on fresh read");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControllerError::Conflict(name.to_string()))
    }
}
