//! Periodic weight publication.
//!
//! Each cycle recomputes the full [`WeightSnapshot`], swaps it into the
//! [`WeightBoard`], persists it, and pushes it to the external
//! [`WeightSink`]. Persistence and export failures are logged; the board
//! always holds the newest snapshot.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use routing::{
    Identity, PersistenceError, ScoreStore, StakeDirectory, Timestamp, UsageTracker, WeightBoard,
    WeightEngine, WeightRepository, WeightSink, WeightSnapshot,
};

use crate::evaluation::known_workers;
use crate::periodic::{run_periodic, ShutdownRx};

/// Tunables for [`WeightPublisher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicationConfig {
    pub interval_secs: u64,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

pub struct WeightPublisher {
    engine: WeightEngine,
    scores: Arc<ScoreStore>,
    trust: Arc<StakeDirectory>,
    usage: Arc<UsageTracker>,
    board: Arc<WeightBoard>,
    repository: Arc<dyn WeightRepository>,
    sink: Option<Arc<dyn WeightSink>>,
    configured_workers: Vec<Identity>,
}

impl WeightPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scores: Arc<ScoreStore>,
        trust: Arc<StakeDirectory>,
        usage: Arc<UsageTracker>,
        board: Arc<WeightBoard>,
        repository: Arc<dyn WeightRepository>,
        configured_workers: Vec<Identity>,
    ) -> Self {
        Self {
            engine: WeightEngine::new(),
            scores,
            trust,
            usage,
            board,
            repository,
            sink: None,
            configured_workers,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn WeightSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Computes, publishes, persists, and exports one snapshot.
    pub async fn publish_once(&self, at: Timestamp) -> Arc<WeightSnapshot> {
        let workers = known_workers(&self.configured_workers, &self.scores);
        let snapshot = self.engine.recompute(
            &workers,
            &self.scores,
            &self.trust.snapshot(),
            &self.usage,
            at,
        );
        let published = self.board.publish(snapshot);
        info!(workers = published.records.len(), "Published weight snapshot");

        if let Err(err) = self.repository.save_weights(&published).await {
            warn!(error = %err, "Failed to persist weight snapshot");
        }
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.submit(&published).await {
                warn!(error = %err, "Weight export failed");
            }
        }
        published
    }

    /// Publishes the last persisted snapshot, if any, without recomputing.
    ///
    /// Returns `true` when a snapshot was restored.
    ///
    /// # Errors
    ///
    /// Propagates load failures.
    pub async fn restore(&self) -> Result<bool, PersistenceError> {
        match self.repository.load_weights().await? {
            Some(snapshot) => {
                info!(
                    workers = snapshot.records.len(),
                    computed_at = ?snapshot.computed_at,
                    "Restored persisted weight snapshot"
                );
                self.board.publish(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Publishes every `interval` until shutdown.
    pub async fn run(self, interval: Duration, shutdown: ShutdownRx) {
        let publisher = &self;
        run_periodic("weight_publication", interval, shutdown, || async move {
            publisher.publish_once(Timestamp::now()).await;
        })
        .await;
    }
}
