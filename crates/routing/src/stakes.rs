//! Copy-on-write directory of staked balances.
//!
//! A [`StakeDirectory`] holds an immutable [`StakeSnapshot`] behind an `Arc`.
//! A refresh builds the replacement snapshot off to the side and then swaps
//! the pointer, so readers only ever hold the lock long enough to clone an
//! `Arc` and never observe a half-applied refresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::{Identity, Stake, Timestamp};

/// One immutable view of every known identity's stake.
#[derive(Debug, Clone, Default)]
pub struct StakeSnapshot {
    stakes: HashMap<Identity, Stake>,
    total_active: f64,
    max_stake: f64,
    version: u64,
    refreshed_at: Option<Timestamp>,
}

impl StakeSnapshot {
    fn build(stakes: HashMap<Identity, Stake>, version: u64) -> Self {
        let total_active = stakes.values().map(|s| s.as_f64()).sum();
        let max_stake = stakes.values().map(|s| s.as_f64()).fold(0.0, f64::max);
        Self {
            stakes,
            total_active,
            max_stake,
            version,
            refreshed_at: Some(Timestamp::now()),
        }
    }

    /// Stake of `identity`, or zero if it is unknown.
    pub fn stake_of(&self, identity: &Identity) -> Stake {
        self.stakes.get(identity).copied().unwrap_or_else(Stake::zero)
    }

    /// Sum of all stakes in the snapshot.
    pub fn total_active(&self) -> f64 {
        self.total_active
    }

    /// Largest single stake in the snapshot.
    pub fn max_stake(&self) -> f64 {
        self.max_stake
    }

    /// `stake_of(identity) / total_active`, or zero when nothing is staked.
    pub fn fraction_of(&self, identity: &Identity) -> f64 {
        if self.total_active > 0.0 {
            self.stake_of(identity).as_f64() / self.total_active
        } else {
            0.0
        }
    }

    /// Monotonic counter bumped on every refresh. Zero means never refreshed.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn refreshed_at(&self) -> Option<Timestamp> {
        self.refreshed_at
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &Stake)> {
        self.stakes.iter()
    }
}

/// Periodically refreshed mapping from identity to staked balance.
#[derive(Debug, Default)]
pub struct StakeDirectory {
    current: RwLock<Arc<StakeSnapshot>>,
    version: AtomicU64,
}

impl StakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<StakeSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the whole directory with `stakes` and returns the new snapshot.
    pub fn replace(&self, stakes: HashMap<Identity, Stake>) -> Arc<StakeSnapshot> {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(StakeSnapshot::build(stakes, version));
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        tracing::debug!(
            version,
            identities = next.len(),
            total_active = next.total_active(),
            "Stake snapshot replaced"
        );
        next
    }
}
