//! Final worker weights.
//!
//! ```text
//! effective_trust = 0                 if performance < 50
//!                 = trust             otherwise
//! final_weight    = 0.40 × performance + 0.10 × effective_trust + 0.50 × usage
//! ```
//!
//! A worker with no evaluations has `performance = 0`, which also zeroes its
//! trust: stake alone earns a new worker nothing.
//!
//! [`WeightBoard`] publishes complete snapshots by swapping an `Arc`, so
//! consumers never see a mix of old and new weights.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::scoring::{ScoreStore, UsageTracker};
use crate::stakes::StakeSnapshot;
use crate::{Identity, Percentage, Timestamp};

pub const PERFORMANCE_WEIGHT: f64 = 0.40;
pub const TRUST_WEIGHT: f64 = 0.10;
pub const USAGE_WEIGHT: f64 = 0.50;

/// Performance below this zeroes the trust component.
pub const TRUST_THRESHOLD: f64 = 50.0;

/// Every input and output of one worker's weight computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub performance_score: Percentage,
    pub trust_score: Percentage,
    pub effective_trust: Percentage,
    pub usage_score: Percentage,
    pub final_weight: Percentage,
}

impl WeightRecord {
    /// Applies the threshold rule and the weighted sum.
    pub fn compute(performance: Percentage, trust: Percentage, usage: Percentage) -> Self {
        let effective_trust = if performance.as_f64() < TRUST_THRESHOLD {
            Percentage::zero()
        } else {
            trust
        };
        let final_weight = Percentage::saturating(
            PERFORMANCE_WEIGHT * performance.as_f64()
                + TRUST_WEIGHT * effective_trust.as_f64()
                + USAGE_WEIGHT * usage.as_f64(),
        );
        Self {
            performance_score: performance,
            trust_score: trust,
            effective_trust,
            usage_score: usage,
            final_weight,
        }
    }
}

/// Weights of every known worker, computed together.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub computed_at: Option<Timestamp>,
    pub records: BTreeMap<Identity, WeightRecord>,
}

impl WeightSnapshot {
    /// `{identity -> final_weight}` for export.
    pub fn final_weights(&self) -> BTreeMap<Identity, f64> {
        self.records
            .iter()
            .map(|(worker, record)| (worker.clone(), record.final_weight.as_f64()))
            .collect()
    }
}

/// Combines evaluation scores, delegated stake, and usage into weights.
#[derive(Debug, Default)]
pub struct WeightEngine;

impl WeightEngine {
    pub fn new() -> Self {
        Self
    }

    /// Computes a full snapshot for `known_workers` plus every worker the
    /// score store has seen.
    ///
    /// Trust is `delegated_stake / max_delegated_stake × 100`; usage is the
    /// worker's EMA rate relative to the busiest worker.
    pub fn recompute(
        &self,
        known_workers: &[Identity],
        scores: &ScoreStore,
        trust_stakes: &StakeSnapshot,
        usage: &UsageTracker,
        at: Timestamp,
    ) -> WeightSnapshot {
        let workers: BTreeSet<Identity> = known_workers
            .iter()
            .cloned()
            .chain(scores.workers())
            .collect();
        let usage_scores: HashMap<Identity, Percentage> = usage.usage_scores_at(at);
        let max_stake = trust_stakes.max_stake();

        let records = workers
            .into_iter()
            .map(|worker| {
                let performance = scores.performance_score(&worker);
                let trust = Percentage::ratio(trust_stakes.stake_of(&worker).as_f64(), max_stake);
                let usage_score = usage_scores
                    .get(&worker)
                    .copied()
                    .unwrap_or_else(Percentage::zero);
                let record = WeightRecord::compute(performance, trust, usage_score);
                (worker, record)
            })
            .collect();

        WeightSnapshot {
            computed_at: Some(at),
            records,
        }
    }
}

/// Latest published weights.
#[derive(Debug, Default)]
pub struct WeightBoard {
    current: RwLock<Arc<WeightSnapshot>>,
}

impl WeightBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<WeightSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the published snapshot in one step.
    pub fn publish(&self, snapshot: WeightSnapshot) -> Arc<WeightSnapshot> {
        let next = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stakes::StakeDirectory;
    use crate::{EvaluationOutcome, QuestionId, Stake, TrafficKind};
    use std::time::Duration;

    fn pct(v: f64) -> Percentage {
        Percentage::new(v).unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn low_performance_zeroes_trust_regardless_of_magnitude() {
        let record = WeightRecord::compute(pct(49.99), pct(100.0), pct(0.0));
        assert_eq!(record.effective_trust.as_f64(), 0.0);
        assert_eq!(record.trust_score.as_f64(), 100.0);
        assert!((record.final_weight.as_f64() - 0.4 * 49.99).abs() < 1e-9);
    }

    #[test]
    fn threshold_is_inclusive_at_fifty() {
        let record = WeightRecord::compute(pct(50.0), pct(80.0), pct(10.0));
        assert_eq!(record.effective_trust.as_f64(), 80.0);
        assert!((record.final_weight.as_f64() - (20.0 + 8.0 + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn weight_is_bounded_and_monotonic_in_each_input() {
        let grid = [0.0, 10.0, 49.0, 50.0, 75.0, 100.0];
        for &p in &grid {
            for &t in &grid {
                for &u in &grid {
                    let w = WeightRecord::compute(pct(p), pct(t), pct(u)).final_weight.as_f64();
                    assert!((0.0..=100.0).contains(&w));
                    for &step in &grid {
                        if step <= p {
                            continue;
                        }
                        let higher = WeightRecord::compute(pct(step), pct(t), pct(u));
                        assert!(higher.final_weight.as_f64() >= w);
                    }
                    for &step in &grid {
                        if step <= u {
                            continue;
                        }
                        let higher = WeightRecord::compute(pct(p), pct(t), pct(step));
                        assert!(higher.final_weight.as_f64() >= w);
                    }
                    for &step in &grid {
                        if step <= t {
                            continue;
                        }
                        let higher = WeightRecord::compute(pct(p), pct(step), pct(u))
                            .final_weight
                            .as_f64();
                        if p < 50.0 {
                            assert_eq!(higher, w);
                        } else {
                            assert!(higher > w);
                        }
                    }
                }
            }
        }
        assert_eq!(
            WeightRecord::compute(pct(100.0), pct(100.0), pct(100.0))
                .final_weight
                .as_f64(),
            100.0
        );
    }

    #[test]
    fn recompute_covers_known_and_evaluated_workers() {
        let scores = ScoreStore::new(10);
        let usage = UsageTracker::new(Duration::from_secs(600));
        let trust = StakeDirectory::new();
        let (good, fresh, veteran) = (id("good"), id("fresh"), id("veteran"));

        for n in 0..4 {
            scores.record(&good, QuestionId::new(format!("q{n}")).unwrap(), EvaluationOutcome::Correct);
        }
        scores.record(&veteran, QuestionId::new("q9").unwrap(), EvaluationOutcome::Incorrect);
        trust.replace(HashMap::from([
            (good.clone(), Stake::new(50.0).unwrap()),
            (fresh.clone(), Stake::new(100.0).unwrap()),
        ]));
        let now = Timestamp::now();
        usage.observe_at(&good, TrafficKind::Organic, true, Duration::ZERO, now);

        let snapshot = WeightEngine::new().recompute(
            &[good.clone(), fresh.clone()],
            &scores,
            &trust.snapshot(),
            &usage,
            now,
        );

        assert_eq!(snapshot.records.len(), 3);
        let g = &snapshot.records[&good];
        assert_eq!(g.performance_score.as_f64(), 100.0);
        assert_eq!(g.trust_score.as_f64(), 50.0);
        assert_eq!(g.usage_score.as_f64(), 100.0);
        assert!((g.final_weight.as_f64() - (40.0 + 5.0 + 50.0)).abs() < 1e-9);

        let f = &snapshot.records[&fresh];
        assert_eq!(f.trust_score.as_f64(), 100.0);
        assert_eq!(f.effective_trust.as_f64(), 0.0);
        assert_eq!(f.final_weight.as_f64(), 0.0);

        assert_eq!(snapshot.final_weights()[&veteran], 0.0);
    }

    #[test]
    fn board_swaps_whole_snapshots() {
        let board = WeightBoard::new();
        let before = board.current();
        assert!(before.records.is_empty());
        let mut next = WeightSnapshot::default();
        next.records.insert(
            id("w"),
            WeightRecord::compute(pct(100.0), pct(0.0), pct(0.0)),
        );
        board.publish(next);
        assert!(before.records.is_empty());
        assert_eq!(board.current().records.len(), 1);
    }
}
