//! Explicit engine context
//!
//! Every component is built from an [`EngineContext`] instead of reaching for
//! process-wide client handles, so several sessions (different identities or
//! substrates) can run side by side and tear down independently.

use std::future::Future;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::ChannelResult;
use crate::retry;
use crate::substrate::Substrate;
use crate::types::Address;

/// Shared handles for one engine session.
#[derive(Clone)]
pub struct EngineContext {
    /// Pub/sub substrate acting as `owner`
    pub substrate: Arc<dyn Substrate>,
    /// Identity of this session; new channels are namespaced under it
    pub owner: Address,
    pub config: Arc<EngineConfig>,
}

impl EngineContext {
    /// Build a context, validating the configuration.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        owner: Address,
        config: EngineConfig,
    ) -> ChannelResult<Self> {
        config.validate()?;
        Ok(Self {
            substrate,
            owner,
            config: Arc::new(config),
        })
    }

    /// Run a substrate call under the configured retry policy.
    pub async fn retry<F, Fut, T>(&self, operation: &str, target: &str, op: F) -> ChannelResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ChannelResult<T>>,
    {
        retry::retry(&self.config.retry, operation, target, op).await
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
