//! Port traits implemented by infrastructure crates.
//!
//! This crate defines *what* it needs from the outside world; the
//! `worker-client`, `state-store`, and `listener` crates define *how*.
//! Every async port is object-safe via `async_trait` and is held as
//! `Arc<dyn Port>` by the orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scoring::{ScoreSnapshot, UsageSnapshot};
use crate::weights::WeightSnapshot;
use crate::{
    Capability, CollaboratorError, Identity, InvocationError, PersistenceError, QuestionId, Stake,
    Timestamp, TrafficKind,
};

// ---------------------------------------------------------------------------
// Worker invocation
// ---------------------------------------------------------------------------

/// One call to one worker capability.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub worker: Identity,
    pub capability: Capability,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    /// Caller-supplied credential, forwarded unchanged.
    pub credential: Option<String>,
    pub traffic: TrafficKind,
}

/// Uniform adapter over external worker capabilities.
///
/// Implementations perform no retries and no caching. A reply that does not
/// match the capability's schema must be reported as
/// [`InvocationError::MalformedResponse`].
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<serde_json::Value, InvocationError>;
}

// ---------------------------------------------------------------------------
// Stake, signatures, weight export
// ---------------------------------------------------------------------------

/// Source of staked balances (ledger lookup).
#[async_trait]
pub trait StakeSource: Send + Sync {
    /// Fetches the complete current mapping. Partial results are an error.
    async fn fetch_stakes(&self) -> Result<HashMap<Identity, Stake>, CollaboratorError>;
}

/// Opaque signature check over a caller's identity.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, identity: &Identity, message: &[u8], signature: &str) -> bool;
}

/// Downstream consumer of published weights.
#[async_trait]
pub trait WeightSink: Send + Sync {
    async fn submit(&self, snapshot: &WeightSnapshot) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Score and usage state as written to disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedScores {
    pub saved_at: Option<Timestamp>,
    pub scores: ScoreSnapshot,
    pub usage: UsageSnapshot,
}

/// Crash-recovery storage for evaluation windows and usage counters.
#[async_trait]
pub trait ScoreRepository: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    async fn load_scores(&self) -> Result<Option<PersistedScores>, PersistenceError>;
    async fn save_scores(&self, state: &PersistedScores) -> Result<(), PersistenceError>;
}

/// Crash-recovery storage for the last published weights.
#[async_trait]
pub trait WeightRepository: Send + Sync {
    async fn load_weights(&self) -> Result<Option<WeightSnapshot>, PersistenceError>;
    async fn save_weights(&self, snapshot: &WeightSnapshot) -> Result<(), PersistenceError>;
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A synthetic question with a known answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationQuestion {
    pub id: QuestionId,
    #[serde(default = "default_capability")]
    pub capability: Capability,
    pub task: String,
    pub input: String,
    pub expected_answer: String,
}

fn default_capability() -> Capability {
    Capability::Complete
}

/// Supplies evaluation questions.
#[async_trait]
pub trait QuestionBank: Send + Sync {
    /// The question for the next evaluation round, or `None` if the bank is empty.
    async fn next_question(&self) -> Result<Option<EvaluationQuestion>, CollaboratorError>;
}

/// Decides whether a worker's reply answers a question correctly.
pub trait Grader: Send + Sync {
    fn is_correct(&self, question: &EvaluationQuestion, reply: &serde_json::Value) -> bool;
}

/// Correct when the reply's `output.immediate_response` contains the expected
/// answer, ignoring case and surrounding whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainsAnswerGrader;

impl Grader for ContainsAnswerGrader {
    fn is_correct(&self, question: &EvaluationQuestion, reply: &serde_json::Value) -> bool {
        let expected = question.expected_answer.trim().to_lowercase();
        if expected.is_empty() {
            return false;
        }
        reply
            .pointer("/output/immediate_response")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|answer| answer.to_lowercase().contains(&expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(expected: &str) -> EvaluationQuestion {
        EvaluationQuestion {
            id: QuestionId::new("q1").unwrap(),
            capability: Capability::Complete,
            task: "arithmetic".into(),
            input: "What is 6 x 7?".into(),
            expected_answer: expected.into(),
        }
    }

    #[test]
    fn grader_matches_case_insensitively() {
        let reply = json!({"output": {"immediate_response": "The answer is Forty-Two."}});
        assert!(ContainsAnswerGrader.is_correct(&question(" forty-two "), &reply));
        assert!(!ContainsAnswerGrader.is_correct(&question("41"), &reply));
    }

    #[test]
    fn grader_rejects_empty_expectations_and_missing_output() {
        let reply = json!({"output": {"immediate_response": "anything"}});
        assert!(!ContainsAnswerGrader.is_correct(&question("  "), &reply));
        assert!(!ContainsAnswerGrader.is_correct(&question("42"), &json!({"response": "42"})));
    }

    #[test]
    fn question_capability_defaults_to_complete() {
        let q: EvaluationQuestion = serde_json::from_value(json!({
            "id": "q7", "task": "t", "input": "i", "expected_answer": "a"
        }))
        .unwrap();
        assert_eq!(q.capability, Capability::Complete);
    }
}
