//! Named limiters owned by one client.
//!
//! A client that talks to several quota pools on the same remote (for example
//! public and authenticated endpoints) holds one `Limiters` and routes every
//! outbound call through the matching entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use crate::config::LimiterConfig;
use crate::error::{Result, ThrottleError};

use super::limiter::{Limiter, LimiterStatus};

/// A fixed set of independent limiters, keyed by name.
#[derive(Debug, Default)]
pub struct Limiters {
    limiters: BTreeMap<String, Arc<Limiter>>,
}

impl Limiters {
    /// Build one limiter per configured entry.
    ///
    /// Fails on the first invalid entry, naming it.
    pub fn from_config(configs: &BTreeMap<String, LimiterConfig>) -> Result<Self> {
        let mut limiters = BTreeMap::new();

        for (name, config) in configs {
            let limiter = Limiter::new(name.clone(), config).map_err(|e| e.for_limiter(name))?;
            limiters.insert(name.clone(), Arc::new(limiter));
        }

        info!(count = limiters.len(), "Limiters initialized");
        Ok(Self { limiters })
    }

    /// Get a shared handle to the limiter called `name`.
    pub fn get(&self, name: &str) -> Result<Arc<Limiter>> {
        self.limiters
            .get(name)
            .cloned()
            .ok_or_else(|| ThrottleError::UnknownLimiter(name.to_string()))
    }

    /// Configured names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Snapshot every limiter.
    pub fn statuses(&self) -> BTreeMap<String, LimiterStatus> {
        self.limiters
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.status()))
            .collect()
    }

    /// Wait until every limiter has an empty queue and no running drain loop.
    pub async fn drain_idle(&self) {
        debug!(count = self.limiters.len(), "Waiting for limiters to drain");
        join_all(self.limiters.values().map(|limiter| limiter.drain_idle())).await;
    }
}
