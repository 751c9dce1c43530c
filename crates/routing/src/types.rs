//! Shared value types for the routing domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (e.g. percentages are in `[0.0, 100.0]`,
//! stakes are finite and non-negative) and participate in domain computations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stake
// ---------------------------------------------------------------------------

/// A staked balance associated with an [`crate::Identity`].
///
/// Only ever used as an input to proportional formulas (rate budgets, trust
/// normalisation); the unit is whatever the ledger reports.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Stake(f64);

impl Stake {
    /// Creates a [`Stake`], returning `None` if `value` is negative, infinite, or NaN.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value >= 0.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// A stake of exactly zero.
    pub fn zero() -> Self {
        Self(0.0)
    }

    /// Returns the underlying `f64` value.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Returns `true` if this stake is zero.
    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }
}

impl std::fmt::Display for Stake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Score types
// ---------------------------------------------------------------------------

/// A score in the range `[0.0, 100.0]`.
///
/// Used for performance, trust, usage, and final weights.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Percentage(f64);

impl Percentage {
    /// Creates a [`Percentage`], returning `None` if `value` is outside `[0.0, 100.0]`.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=100.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Creates a [`Percentage`], clamping out-of-range values and mapping NaN to zero.
    pub fn saturating(value: f64) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 100.0))
        }
    }

    /// `part / whole × 100`, or zero when `whole` is not positive.
    pub fn ratio(part: f64, whole: f64) -> Self {
        if whole > 0.0 {
            Self::saturating(part / whole * 100.0)
        } else {
            Self(0.0)
        }
    }

    /// Zero percent.
    pub fn zero() -> Self {
        Self(0.0)
    }

    /// Returns the score as an `f64` in `[0.0, 100.0]`.
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}%", self.0)
    }
}

// ---------------------------------------------------------------------------
// Worker capabilities
// ---------------------------------------------------------------------------

/// The closed set of functions a worker can be asked to perform.
///
/// Unknown capability strings are rejected when a workflow is validated;
/// nothing downstream ever dispatches on a free-form string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Answer a task, optionally using conversation history and preferences.
    Complete,
    /// Improve previous outputs.
    Refine,
    /// Critique previous outputs.
    Feedback,
    /// Fold human feedback into the worker's preference store.
    HumanFeedback,
    /// Search the internet for the given queries.
    InternetSearch,
    /// Summarise previous outputs.
    Summary,
    /// Merge several previous outputs into one.
    Aggregate,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 7] = [
        Capability::Complete,
        Capability::Refine,
        Capability::Feedback,
        Capability::HumanFeedback,
        Capability::InternetSearch,
        Capability::Summary,
        Capability::Aggregate,
    ];

    /// Wire name, also used as the worker endpoint path.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Complete => "complete",
            Capability::Refine => "refine",
            Capability::Feedback => "feedback",
            Capability::HumanFeedback => "human_feedback",
            Capability::InternetSearch => "internet_search",
            Capability::Summary => "summary",
            Capability::Aggregate => "aggregate",
        }
    }

    /// Parses a wire name. Returns `None` for anything outside the enumeration.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Checks a worker reply against the component output schema shared by
    /// every capability: an object with an `output` object whose
    /// `immediate_response` is a string.
    pub fn check_response(self, reply: &serde_json::Value) -> Result<(), String> {
        let output = reply
            .get("output")
            .ok_or_else(|| format!("{} reply has no 'output' field", self.as_str()))?;
        if !output.is_object() {
            return Err(format!("{} reply 'output' is not an object", self.as_str()));
        }
        match output.get("immediate_response") {
            Some(serde_json::Value::String(_)) => Ok(()),
            _ => Err(format!(
                "{} reply 'output.immediate_response' is missing or not a string",
                self.as_str()
            )),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Result of asking one worker one synthetic question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Correct,
    Incorrect,
    Timeout,
    Error,
}

/// Whether an observed worker request came from real callers or from the
/// evaluation loop. Only [`TrafficKind::Organic`] traffic feeds usage scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficKind {
    Organic,
    Evaluation,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Seconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        let millis = (self.0 - earlier.0).num_milliseconds();
        (millis.max(0) as f64) / 1000.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capability_names_round_trip_through_parse() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("translate"), None);
    }

    #[test]
    fn check_response_requires_immediate_response() {
        let ok = json!({"output": {"immediate_response": "hi", "notebook": "no update"}});
        assert!(Capability::Complete.check_response(&ok).is_ok());

        let missing = json!({"response": "hi"});
        assert!(Capability::Complete.check_response(&missing).is_err());

        let wrong_type = json!({"output": {"immediate_response": 3}});
        assert!(Capability::Summary.check_response(&wrong_type).is_err());
    }

    #[test]
    fn percentage_ratio_handles_zero_denominator() {
        assert_eq!(Percentage::ratio(5.0, 0.0).as_f64(), 0.0);
        assert_eq!(Percentage::ratio(1.0, 4.0).as_f64(), 25.0);
        assert_eq!(Percentage::saturating(140.0).as_f64(), 100.0);
    }

    #[test]
    fn stake_rejects_negative_values() {
        assert!(Stake::new(-1.0).is_none());
        assert!(Stake::new(f64::NAN).is_none());
        assert!(Stake::new(0.0).is_some_and(|s| s.is_zero()));
    }
}
