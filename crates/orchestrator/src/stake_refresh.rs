//! Periodic stake refresh.
//!
//! Pulls a complete stake mapping from a [`StakeSource`] and swaps it into a
//! [`StakeDirectory`]. A failed fetch keeps the previous snapshot in place.
//! The same job shape serves both caller stakes (feeding admission) and
//! delegated worker stakes (feeding trust).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use routing::stakes::StakeSnapshot;
use routing::{CollaboratorError, RateLimiter, StakeDirectory, StakeSource};

use crate::periodic::{run_periodic, ShutdownRx};

/// Tunables for [`StakeRefresher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeRefreshConfig {
    pub interval_secs: u64,
}

impl Default for StakeRefreshConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Keeps one [`StakeDirectory`] in step with one [`StakeSource`].
pub struct StakeRefresher {
    name: &'static str,
    source: Arc<dyn StakeSource>,
    directory: Arc<StakeDirectory>,
    limiter: Option<Arc<RateLimiter>>,
}

impl StakeRefresher {
    pub fn new(
        name: &'static str,
        source: Arc<dyn StakeSource>,
        directory: Arc<StakeDirectory>,
    ) -> Self {
        Self {
            name,
            source,
            directory,
            limiter: None,
        }
    }

    /// Also prunes idle budgets from `limiter` after every refresh.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Fetches and installs one snapshot.
    ///
    /// # Errors
    ///
    /// Returns the source's error; the directory is left unchanged.
    pub async fn refresh_once(&self) -> Result<Arc<StakeSnapshot>, CollaboratorError> {
        let stakes = self.source.fetch_stakes().await?;
        let snapshot = self.directory.replace(stakes);
        let pruned = self
            .limiter
            .as_ref()
            .map_or(0, |limiter| limiter.prune_idle(std::time::Instant::now()));
        info!(
            job = self.name,
            identities = snapshot.len(),
            total_active = snapshot.total_active(),
            version = snapshot.version(),
            pruned,
            "Stake snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Refreshes every `interval` until shutdown.
    pub async fn run(self, interval: Duration, shutdown: ShutdownRx) {
        let job = &self;
        run_periodic(self.name, interval, shutdown, || async move {
            if let Err(err) = job.refresh_once().await {
                warn!(
                    job = job.name,
                    error = %err,
                    version = job.directory.snapshot().version(),
                    "Stake refresh failed; keeping previous snapshot"
                );
            }
        })
        .await;
    }
}
