//! Rolling-window correctness scores and EMA usage rates per worker.
//!
//! Both stores keep one independently locked cell per worker, so recording a
//! result for one worker never waits on another. Both can export and import a
//! serialisable snapshot; persistence itself is a port
//! ([`crate::ports::ScoreRepository`]).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EvaluationOutcome, Identity, Percentage, QuestionId, TrafficKind, Timestamp};

/// Evaluations kept per worker unless configured otherwise.
pub const DEFAULT_WINDOW_SIZE: usize = 120;

/// Time constant of the usage-rate EMA unless configured otherwise.
pub const DEFAULT_USAGE_TIME_CONSTANT: Duration = Duration::from_secs(10 * 60);

fn lock<T>(cell: &Mutex<T>) -> MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Evaluation window
// ---------------------------------------------------------------------------

/// One graded answer from one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub worker: Identity,
    pub question_id: QuestionId,
    pub outcome: EvaluationOutcome,
    pub timestamp: Timestamp,
}

/// Fixed-capacity ring buffer of a worker's most recent evaluations.
#[derive(Debug, Clone)]
struct EvaluationWindow {
    capacity: usize,
    records: VecDeque<EvaluationRecord>,
}

impl EvaluationWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, record: EvaluationRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Recomputed from the buffer on every call; never maintained incrementally.
    fn performance(&self) -> Percentage {
        let correct = self
            .records
            .iter()
            .filter(|r| r.outcome == EvaluationOutcome::Correct)
            .count();
        Percentage::ratio(correct as f64, self.records.len() as f64)
    }
}

/// Persisted per-worker rolling windows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub window_size: usize,
    pub windows: BTreeMap<Identity, Vec<EvaluationRecord>>,
}

/// Rolling windows of evaluation outcomes, one per worker.
#[derive(Debug)]
pub struct ScoreStore {
    window_size: usize,
    windows: RwLock<HashMap<Identity, Arc<Mutex<EvaluationWindow>>>>,
}

impl ScoreStore {
    /// Creates an empty store. A `window_size` of zero is treated as one.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Appends an outcome for `worker`, evicting the oldest when the window is full.
    pub fn record(&self, worker: &Identity, question_id: QuestionId, outcome: EvaluationOutcome) {
        self.push(EvaluationRecord {
            worker: worker.clone(),
            question_id,
            outcome,
            timestamp: Timestamp::now(),
        });
    }

    /// Appends a pre-built record.
    pub fn push(&self, record: EvaluationRecord) {
        let cell = self.cell_for(&record.worker);
        lock(&cell).push(record);
    }

    /// `100 × correct / total` over the worker's current window; zero when empty.
    pub fn performance_score(&self, worker: &Identity) -> Percentage {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .map(|cell| lock(cell).performance())
            .unwrap_or_else(Percentage::zero)
    }

    /// Number of evaluations currently in `worker`'s window.
    pub fn evaluations(&self, worker: &Identity) -> usize {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .map(|cell| lock(cell).records.len())
            .unwrap_or(0)
    }

    /// Every worker with at least one recorded evaluation.
    pub fn workers(&self) -> Vec<Identity> {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> ScoreSnapshot {
        let windows = self.windows.read().unwrap_or_else(|e| e.into_inner());
        ScoreSnapshot {
            window_size: self.window_size,
            windows: windows
                .iter()
                .map(|(worker, cell)| (worker.clone(), lock(cell).records.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Replaces the store's contents with `snapshot`.
    ///
    /// If the snapshot was taken with a larger window, only the newest
    /// `window_size` records per worker are kept.
    pub fn restore(&self, snapshot: ScoreSnapshot) {
        let mut restored = HashMap::with_capacity(snapshot.windows.len());
        for (worker, records) in snapshot.windows {
            let mut window = EvaluationWindow::new(self.window_size);
            for record in records {
                window.push(record);
            }
            restored.insert(worker, Arc::new(Mutex::new(window)));
        }
        *self.windows.write().unwrap_or_else(|e| e.into_inner()) = restored;
    }

    fn cell_for(&self, worker: &Identity) -> Arc<Mutex<EvaluationWindow>> {
        if let Some(cell) = self
            .windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
        {
            return cell.clone();
        }
        self.windows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker.clone())
            .or_insert_with(|| Arc::new(Mutex::new(EvaluationWindow::new(self.window_size))))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Per-worker organic traffic counters.
///
/// `ema_rpm` is a time-weighted exponential moving average of the request
/// rate: each request adds `1 / tau` after the previous value has decayed by
/// `exp(-dt / tau)`, so the value tracks requests per minute and keeps
/// decaying between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub ema_rpm: f64,
    pub last_update: Timestamp,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
}

impl UsageCounter {
    fn new(at: Timestamp) -> Self {
        Self {
            ema_rpm: 0.0,
            last_update: at,
            total: 0,
            successful: 0,
            failed: 0,
            average_latency_ms: 0.0,
        }
    }

    fn decayed_rate(&self, at: Timestamp, tau_minutes: f64) -> f64 {
        let dt_minutes = at.seconds_since(self.last_update) / 60.0;
        self.ema_rpm * (-dt_minutes / tau_minutes).exp()
    }

    fn observe(&mut self, at: Timestamp, success: bool, latency: Duration, tau_minutes: f64) {
        self.ema_rpm = self.decayed_rate(at, tau_minutes) + 1.0 / tau_minutes;
        if at > self.last_update {
            self.last_update = at;
        }
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.total as f64;
    }
}

/// Persisted usage counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub counters: BTreeMap<Identity, UsageCounter>,
}

/// EMA request-rate tracking for organic (non-evaluation) traffic.
#[derive(Debug)]
pub struct UsageTracker {
    tau_minutes: f64,
    counters: RwLock<HashMap<Identity, Arc<Mutex<UsageCounter>>>>,
}

impl UsageTracker {
    /// `time_constant` controls how quickly old traffic is forgotten.
    pub fn new(time_constant: Duration) -> Self {
        let tau_minutes = (time_constant.as_secs_f64() / 60.0).max(1.0 / 60.0);
        Self {
            tau_minutes,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Records one completed request. Evaluation traffic is ignored.
    pub fn observe(&self, worker: &Identity, kind: TrafficKind, success: bool, latency: Duration) {
        self.observe_at(worker, kind, success, latency, Timestamp::now());
    }

    pub fn observe_at(
        &self,
        worker: &Identity,
        kind: TrafficKind,
        success: bool,
        latency: Duration,
        at: Timestamp,
    ) {
        if kind == TrafficKind::Evaluation {
            return;
        }
        let cell = self.cell_for(worker, at);
        lock(&cell).observe(at, success, latency, self.tau_minutes);
    }

    /// The worker's request rate as of `at`, decayed since its last request.
    pub fn rate_at(&self, worker: &Identity, at: Timestamp) -> f64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .map(|cell| lock(cell).decayed_rate(at, self.tau_minutes))
            .unwrap_or(0.0)
    }

    /// `rate(worker) / max(rate over workers) × 100` for every tracked worker.
    pub fn usage_scores_at(&self, at: Timestamp) -> HashMap<Identity, Percentage> {
        let rates: Vec<(Identity, f64)> = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(worker, cell)| (worker.clone(), lock(cell).decayed_rate(at, self.tau_minutes)))
            .collect();
        let max = rates.iter().map(|(_, r)| *r).fold(0.0, f64::max);
        rates
            .into_iter()
            .map(|(worker, rate)| (worker, Percentage::ratio(rate, max)))
            .collect()
    }

    pub fn counter(&self, worker: &Identity) -> Option<UsageCounter> {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .map(|cell| lock(cell).clone())
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            counters: self
                .counters
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(worker, cell)| (worker.clone(), lock(cell).clone()))
                .collect(),
        }
    }

    pub fn restore(&self, snapshot: UsageSnapshot) {
        let restored = snapshot
            .counters
            .into_iter()
            .map(|(worker, counter)| (worker, Arc::new(Mutex::new(counter))))
            .collect();
        *self.counters.write().unwrap_or_else(|e| e.into_inner()) = restored;
    }

    fn cell_for(&self, worker: &Identity, at: Timestamp) -> Arc<Mutex<UsageCounter>> {
        if let Some(cell) = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
        {
            return cell.clone();
        }
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UsageCounter::new(at))))
            .clone()
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new(DEFAULT_USAGE_TIME_CONSTANT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn q(n: usize) -> QuestionId {
        QuestionId::new(format!("q{n}")).unwrap()
    }

    fn at(secs: i64) -> Timestamp {
        Timestamp::from_utc(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    #[test]
    fn empty_window_scores_zero() {
        let store = ScoreStore::new(DEFAULT_WINDOW_SIZE);
        assert_eq!(store.performance_score(&id("w")).as_f64(), 0.0);
    }

    #[test]
    fn score_is_share_of_correct_answers() {
        let store = ScoreStore::new(10);
        let w = id("w");
        store.record(&w, q(1), EvaluationOutcome::Correct);
        store.record(&w, q(2), EvaluationOutcome::Incorrect);
        store.record(&w, q(3), EvaluationOutcome::Timeout);
        store.record(&w, q(4), EvaluationOutcome::Correct);
        assert_eq!(store.performance_score(&w).as_f64(), 50.0);
    }

    #[test]
    fn evaluation_121_evicts_evaluation_1() {
        let store = ScoreStore::new(120);
        let w = id("w");
        // #1 is the only incorrect answer.
        store.record(&w, q(1), EvaluationOutcome::Incorrect);
        for n in 2..=120 {
            store.record(&w, q(n), EvaluationOutcome::Correct);
        }
        assert_eq!(store.evaluations(&w), 120);
        assert!((store.performance_score(&w).as_f64() - 100.0 * 119.0 / 120.0).abs() < 1e-9);

        store.record(&w, q(121), EvaluationOutcome::Correct);
        assert_eq!(store.evaluations(&w), 120);
        assert_eq!(store.performance_score(&w).as_f64(), 100.0);

        let snapshot = store.snapshot();
        let ids: Vec<&str> = snapshot.windows[&w].iter().map(|r| r.question_id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"q2"));
        assert_eq!(ids.last(), Some(&"q121"));
    }

    #[test]
    fn restore_keeps_newest_records_when_window_shrank() {
        let big = ScoreStore::new(5);
        let w = id("w");
        for n in 1..=5 {
            let outcome = if n <= 3 {
                EvaluationOutcome::Incorrect
            } else {
                EvaluationOutcome::Correct
            };
            big.record(&w, q(n), outcome);
        }
        let small = ScoreStore::new(2);
        small.restore(big.snapshot());
        assert_eq!(small.evaluations(&w), 2);
        assert_eq!(small.performance_score(&w).as_f64(), 100.0);
    }

    #[test]
    fn evaluation_traffic_never_counts_as_usage() {
        let usage = UsageTracker::default();
        let w = id("w");
        usage.observe_at(&w, TrafficKind::Evaluation, true, Duration::from_millis(5), at(0));
        assert!(usage.counter(&w).is_none());
        usage.observe_at(&w, TrafficKind::Organic, false, Duration::from_millis(40), at(0));
        let counter = usage.counter(&w).unwrap();
        assert_eq!((counter.total, counter.successful, counter.failed), (1, 0, 1));
        assert_eq!(counter.average_latency_ms, 40.0);
    }

    #[test]
    fn ema_rate_converges_to_steady_request_rate_and_decays() {
        let usage = UsageTracker::new(Duration::from_secs(60));
        let w = id("w");
        // Six requests per minute for an hour.
        for i in 0..360 {
            usage.observe_at(&w, TrafficKind::Organic, true, Duration::ZERO, at(i * 10));
        }
        let steady = usage.rate_at(&w, at(3590));
        assert!((steady - 6.0).abs() < 1.0, "steady rate {steady}");

        let later = usage.rate_at(&w, at(3590 + 600));
        assert!(later < steady * 0.01);
    }

    #[test]
    fn usage_scores_normalise_to_busiest_worker() {
        let usage = UsageTracker::default();
        let (busy, quiet) = (id("busy"), id("quiet"));
        for _ in 0..4 {
            usage.observe_at(&busy, TrafficKind::Organic, true, Duration::ZERO, at(0));
        }
        usage.observe_at(&quiet, TrafficKind::Organic, true, Duration::ZERO, at(0));
        let scores = usage.usage_scores_at(at(0));
        assert_eq!(scores[&busy].as_f64(), 100.0);
        assert!((scores[&quiet].as_f64() - 25.0).abs() < 1e-9);
    }
}
