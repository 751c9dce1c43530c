//! Stake-proportional admission control.
//!
//! Each caller gets a [`RateBudget`] derived from its share of the total
//! active stake:
//!
//! ```text
//! rpm_limit        = max(1, floor(stake / total_active_stake × system_rpm_capacity))
//! concurrent_limit = max(1, rpm_limit / 2)
//! dynamic_limit    = min(rpm_limit − rpm_used, concurrent_limit)
//! ```
//!
//! `dynamic_limit` is evaluated at admission time so a caller cannot spend a
//! whole minute's budget as one parallel burst.
//!
//! Budgets live in independently locked cells keyed by [`Caller`]. The outer
//! map is only write-locked to insert or prune cells, so callers never block
//! each other while being admitted.
//!
//! Budgets are never persisted: a restart resets every counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::stakes::{StakeDirectory, StakeSnapshot};
use crate::{AdmissionError, Identity, Stake};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per minute shared out across all staked callers.
    pub system_rpm_capacity: u32,
    /// Budget for callers that present no identity.
    pub anonymous_rpm: u32,
    /// Budget for identified callers with no stake on record.
    pub no_stake_rpm: u32,
    /// Length of the consumption window, in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            system_rpm_capacity: 1000,
            anonymous_rpm: 1,
            no_stake_rpm: 1,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ---------------------------------------------------------------------------
// Callers and budgets
// ---------------------------------------------------------------------------

/// Who is asking for admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// No identity was presented. `origin` (e.g. the client address) keys the budget.
    Anonymous { origin: String },
    /// A verified identity.
    Identified(Identity),
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Caller::Anonymous { origin } => write!(f, "anonymous@{origin}"),
            Caller::Identified(identity) => write!(f, "{identity}"),
        }
    }
}

/// Per-caller counters.
#[derive(Debug, Clone)]
pub struct RateBudget {
    pub rpm_limit: u32,
    pub rpm_used: u32,
    pub window_start: Instant,
    pub concurrent_limit: u32,
    pub concurrent_current: u32,
    stake: Stake,
    stake_version: u64,
}

impl RateBudget {
    /// `rpm_limit − rpm_used`, floored at zero.
    pub fn remaining(&self) -> u32 {
        self.rpm_limit.saturating_sub(self.rpm_used)
    }

    /// The concurrency ceiling in force right now.
    pub fn dynamic_limit(&self) -> u32 {
        self.remaining().min(self.concurrent_limit)
    }

    fn apply_limits(&mut self, rpm_limit: u32, stake: Stake, stake_version: u64) {
        self.rpm_limit = rpm_limit;
        self.concurrent_limit = (rpm_limit / 2).max(1);
        self.stake = stake;
        self.stake_version = stake_version;
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_start) >= window {
            self.rpm_used = 0;
            self.window_start = now;
        }
    }

    fn resets_in(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Requests-per-minute view of a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpmStatus {
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub window_seconds: u64,
    pub resets_in_seconds: u64,
}

/// Concurrency view of a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyStatus {
    pub limit: u32,
    pub dynamic_limit: u32,
    pub current: u32,
    pub remaining: u32,
}

/// Snapshot of a caller's budget, as reported to that caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub rpm: RpmStatus,
    pub concurrent: ConcurrencyStatus,
    pub stake_amount: f64,
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

type BudgetCell = Arc<Mutex<RateBudget>>;

fn lock(cell: &BudgetCell) -> MutexGuard<'_, RateBudget> {
    cell.lock().unwrap_or_else(|e| e.into_inner())
}

/// Gatekeeper in front of workflow execution.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    stakes: Arc<StakeDirectory>,
    budgets: RwLock<HashMap<Caller, BudgetCell>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, stakes: Arc<StakeDirectory>) -> Self {
        Self {
            config,
            stakes,
            budgets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admits `caller` now, or explains why not.
    pub fn admit(&self, caller: &Caller) -> Result<Lease, AdmissionError> {
        self.admit_at(caller, Instant::now())
    }

    /// Admits `caller` as of `now`.
    ///
    /// On success `rpm_used` and `concurrent_current` have both been
    /// incremented; the returned [`Lease`] gives the concurrency slot back
    /// when dropped. On failure nothing has changed.
    pub fn admit_at(&self, caller: &Caller, now: Instant) -> Result<Lease, AdmissionError> {
        let snapshot = self.stakes.snapshot();
        let cell = self.cell_for(caller, &snapshot, now);
        let mut budget = lock(&cell);
        self.refresh(caller, &mut budget, &snapshot, now);

        if budget.rpm_used >= budget.rpm_limit {
            tracing::info!(
                caller = %caller,
                limit = budget.rpm_limit,
                used = budget.rpm_used,
                "Admission rejected: rpm budget exhausted"
            );
            return Err(AdmissionError::RpmExceeded {
                limit: budget.rpm_limit,
                used: budget.rpm_used,
                retry_after: budget.resets_in(now, self.config.window()),
            });
        }

        let dynamic_limit = budget.dynamic_limit();
        if budget.concurrent_current >= dynamic_limit {
            tracing::info!(
                caller = %caller,
                dynamic_limit,
                current = budget.concurrent_current,
                "Admission rejected: concurrency ceiling reached"
            );
            return Err(AdmissionError::ConcurrencyExceeded {
                limit: dynamic_limit,
                current: budget.concurrent_current,
            });
        }

        budget.rpm_used += 1;
        budget.concurrent_current += 1;
        drop(budget);

        Ok(Lease {
            cell,
            caller: caller.clone(),
        })
    }

    /// Reports `caller`'s budget without consuming any of it.
    pub fn status(&self, caller: &Caller) -> RateLimitStatus {
        self.status_at(caller, Instant::now())
    }

    pub fn status_at(&self, caller: &Caller, now: Instant) -> RateLimitStatus {
        let snapshot = self.stakes.snapshot();
        let existing = self
            .budgets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(caller)
            .cloned();
        let mut budget = match existing {
            Some(cell) => lock(&cell).clone(),
            None => self.fresh_budget(caller, &snapshot, now),
        };
        self.refresh(caller, &mut budget, &snapshot, now);

        let dynamic_limit = budget.dynamic_limit();
        RateLimitStatus {
            rpm: RpmStatus {
                limit: budget.rpm_limit,
                used: budget.rpm_used,
                remaining: budget.remaining(),
                window_seconds: self.config.window_secs,
                resets_in_seconds: budget.resets_in(now, self.config.window()).as_secs(),
            },
            concurrent: ConcurrencyStatus {
                limit: budget.concurrent_limit,
                dynamic_limit,
                current: budget.concurrent_current,
                remaining: dynamic_limit.saturating_sub(budget.concurrent_current),
            },
            stake_amount: budget.stake.as_f64(),
        }
    }

    /// Drops budgets with nothing in flight whose window has expired.
    ///
    /// Such a budget is indistinguishable from a freshly created one, so
    /// removing it changes no admission decision.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let window = self.config.window();
        let mut budgets = self.budgets.write().unwrap_or_else(|e| e.into_inner());
        let before = budgets.len();
        budgets.retain(|_, cell| {
            let b = lock(cell);
            b.concurrent_current > 0 || now.saturating_duration_since(b.window_start) < window
        });
        before - budgets.len()
    }

    /// Number of callers currently holding a budget cell.
    pub fn tracked_callers(&self) -> usize {
        self.budgets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    // -----------------------------------------------------------------------

    fn cell_for(&self, caller: &Caller, snapshot: &StakeSnapshot, now: Instant) -> BudgetCell {
        if let Some(cell) = self
            .budgets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(caller)
        {
            return cell.clone();
        }
        self.budgets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(caller.clone())
            .or_insert_with(|| Arc::new(Mutex::new(self.fresh_budget(caller, snapshot, now))))
            .clone()
    }

    fn fresh_budget(&self, caller: &Caller, snapshot: &StakeSnapshot, now: Instant) -> RateBudget {
        let (rpm_limit, stake) = self.limit_for(caller, snapshot);
        let mut budget = RateBudget {
            rpm_limit,
            rpm_used: 0,
            window_start: now,
            concurrent_limit: 1,
            concurrent_current: 0,
            stake,
            stake_version: snapshot.version(),
        };
        budget.apply_limits(rpm_limit, stake, snapshot.version());
        budget
    }

    /// Recomputes limits when the stake snapshot changed and rolls the window.
    fn refresh(&self, caller: &Caller, budget: &mut RateBudget, snapshot: &StakeSnapshot, now: Instant) {
        if budget.stake_version != snapshot.version() {
            let (rpm_limit, stake) = self.limit_for(caller, snapshot);
            budget.apply_limits(rpm_limit, stake, snapshot.version());
        }
        budget.roll_window(now, self.config.window());
    }

    fn limit_for(&self, caller: &Caller, snapshot: &StakeSnapshot) -> (u32, Stake) {
        match caller {
            Caller::Anonymous { .. } => (self.config.anonymous_rpm.max(1), Stake::zero()),
            Caller::Identified(identity) => {
                let stake = snapshot.stake_of(identity);
                if stake.is_zero() || snapshot.total_active() <= 0.0 {
                    return (self.config.no_stake_rpm.max(1), stake);
                }
                let share = snapshot.fraction_of(identity) * f64::from(self.config.system_rpm_capacity);
                // f64 → u32 casts saturate, so an oversized share cannot wrap.
                ((share.floor() as u32).max(1), stake)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Proof of admission. Holds one concurrency slot until dropped.
///
/// Dropping the lease decrements `concurrent_current` only; consumed rpm is
/// never handed back.
#[derive(Debug)]
pub struct Lease {
    cell: BudgetCell,
    caller: Caller,
}

impl Lease {
    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut budget = lock(&self.cell);
        budget.concurrent_current = budget.concurrent_current.saturating_sub(1);
    }
}
