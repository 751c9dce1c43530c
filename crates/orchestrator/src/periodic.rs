//! Independently cancellable periodic jobs.
//!
//! Every background job is a loop over [`tokio::time::interval`] that stops as
//! soon as the shared shutdown signal flips to `true` (or its sender is
//! dropped). Jobs never call each other; they communicate only through the
//! snapshot-swapping state cells they are given.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Sender half of the shutdown signal.
pub type ShutdownTx = watch::Sender<bool>;
/// Receiver half of the shutdown signal. Cheap to clone; one per job.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a new shutdown signal, initially `false`.
pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Calls `tick` every `period` until shutdown.
///
/// The first tick fires immediately. A tick that overruns the period delays
/// the next one rather than causing a burst of catch-up ticks.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownRx,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    if *shutdown.borrow() {
        return;
    }
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(job = name, period_ms = period.as_millis() as u64, "Periodic job started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                debug!(job = name, "Tick");
                tick().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(job = name, "Periodic job stopped");
}
