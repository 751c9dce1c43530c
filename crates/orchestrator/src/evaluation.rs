//! Continuous evaluation of workers.
//!
//! Each round draws one question from the [`QuestionBank`], sends it to every
//! known worker concurrently, grades the replies, and records one outcome per
//! worker in the [`ScoreStore`]. Calls are never retried, so every outcome
//! reflects a single attempt within the configured timeout.
//!
//! Evaluation calls are tagged [`TrafficKind::Evaluation`] and are never
//! reported to the usage tracker. After every round the score and usage state
//! is persisted through the [`ScoreRepository`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use routing::{
    EvaluationOutcome, EvaluationQuestion, Grader, Identity, InvocationError, InvocationRequest,
    PersistedScores, PersistenceError, QuestionBank, ScoreRepository, ScoreStore, Timestamp,
    TrafficKind, UsageTracker, WorkerInvoker,
};

use crate::periodic::{run_periodic, ShutdownRx};

/// Tunables for [`Evaluator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Seconds between rounds.
    pub interval_secs: u64,
    /// Per-call deadline, in seconds.
    pub call_timeout_secs: u64,
    /// Number of most recent outcomes kept per worker.
    pub window_size: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            call_timeout_secs: 30,
            window_size: routing::scoring::DEFAULT_WINDOW_SIZE,
        }
    }
}

impl EvaluationConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Configured workers plus every worker with recorded evaluations, sorted.
pub fn known_workers(configured: &[Identity], scores: &ScoreStore) -> Vec<Identity> {
    configured
        .iter()
        .cloned()
        .chain(scores.workers())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Maps one call's result to an outcome.
pub fn classify(
    grader: &dyn Grader,
    question: &EvaluationQuestion,
    reply: &Result<Value, InvocationError>,
) -> EvaluationOutcome {
    match reply {
        Ok(reply) if grader.is_correct(question, reply) => EvaluationOutcome::Correct,
        Ok(_) => EvaluationOutcome::Incorrect,
        Err(InvocationError::Timeout(_)) => EvaluationOutcome::Timeout,
        Err(_) => EvaluationOutcome::Error,
    }
}

/// Summary of one evaluation round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub evaluated: usize,
    pub correct: usize,
}

/// Drives evaluation rounds.
pub struct Evaluator {
    invoker: Arc<dyn WorkerInvoker>,
    bank: Arc<dyn QuestionBank>,
    grader: Arc<dyn Grader>,
    scores: Arc<ScoreStore>,
    usage: Arc<UsageTracker>,
    repository: Arc<dyn ScoreRepository>,
    configured_workers: Vec<Identity>,
    call_timeout: Duration,
    credential: Option<String>,
}

impl Evaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<dyn WorkerInvoker>,
        bank: Arc<dyn QuestionBank>,
        grader: Arc<dyn Grader>,
        scores: Arc<ScoreStore>,
        usage: Arc<UsageTracker>,
        repository: Arc<dyn ScoreRepository>,
        configured_workers: Vec<Identity>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            invoker,
            bank,
            grader,
            scores,
            usage,
            repository,
            configured_workers,
            call_timeout,
            credential: None,
        }
    }

    /// Credential presented to workers on evaluation calls.
    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    /// Runs one round and persists the resulting state.
    ///
    /// A round with no question available, or no known workers, records nothing.
    pub async fn run_round(&self) -> RoundReport {
        let question = match self.bank.next_question().await {
            Ok(Some(question)) => question,
            Ok(None) => {
                debug!("Question bank is empty; skipping round");
                return RoundReport::default();
            }
            Err(err) => {
                warn!(error = %err, "Could not fetch evaluation question");
                return RoundReport::default();
            }
        };
        let workers = known_workers(&self.configured_workers, &self.scores);
        if workers.is_empty() {
            debug!("No known workers to evaluate");
            return RoundReport::default();
        }

        let span = info_span!("evaluation_round", question_id = %question.id, workers = workers.len());
        let report = self.evaluate(&question, workers).instrument(span).await;

        if let Err(err) = self.persist().await {
            warn!(error = %err, "Failed to persist score state");
        }
        report
    }

    async fn evaluate(&self, question: &EvaluationQuestion, workers: Vec<Identity>) -> RoundReport {
        let payload = json!({
            "cid": format!("evaluation-{}", question.id),
            "task": question.task,
            "input": [{ "user_query": question.input }],
            "context": [],
            "previous_outputs": [],
            "use_conversation_history": false,
            "use_playbook": false,
        });

        let mut calls = JoinSet::new();
        for worker in workers {
            let request = InvocationRequest {
                worker: worker.clone(),
                capability: question.capability,
                payload: payload.clone(),
                timeout: self.call_timeout,
                credential: self.credential.clone(),
                traffic: TrafficKind::Evaluation,
            };
            let invoker = self.invoker.clone();
            let limit = self.call_timeout;
            calls.spawn(async move {
                let reply = match timeout(limit, invoker.invoke(request)).await {
                    Ok(reply) => reply,
                    Err(_) => Err(InvocationError::timeout(limit)),
                };
                (worker, reply)
            });
        }

        let mut report = RoundReport::default();
        while let Some(joined) = calls.join_next().await {
            let (worker, reply) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "Evaluation task ended abnormally");
                    continue;
                }
            };
            let outcome = classify(self.grader.as_ref(), question, &reply);
            debug!(%worker, ?outcome, "Evaluation graded");
            self.scores.record(&worker, question.id.clone(), outcome);
            report.evaluated += 1;
            if outcome == EvaluationOutcome::Correct {
                report.correct += 1;
            }
        }

        info!(
            evaluated = report.evaluated,
            correct = report.correct,
            "Evaluation round complete"
        );
        report
    }

    /// Writes the current score and usage state.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let state = PersistedScores {
            saved_at: Some(Timestamp::now()),
            scores: self.scores.snapshot(),
            usage: self.usage.snapshot(),
        };
        self.repository.save_scores(&state).await
    }

    /// Runs a round every `interval` until shutdown.
    pub async fn run(self, interval: Duration, shutdown: ShutdownRx) {
        let evaluator = &self;
        run_periodic("evaluation", interval, shutdown, || async move {
            evaluator.run_round().await;
        })
        .await;
    }
}

/// Reloads persisted score and usage state, if any.
///
/// Returns `true` when state was found and restored.
///
/// # Errors
///
/// Propagates load failures; corrupt state is never silently discarded.
pub async fn restore_scores(
    repository: &dyn ScoreRepository,
    scores: &ScoreStore,
    usage: &UsageTracker,
) -> Result<bool, PersistenceError> {
    let Some(state) = repository.load_scores().await? else {
        info!("No persisted score state; starting with empty windows");
        return Ok(false);
    };
    let workers = state.scores.windows.len();
    scores.restore(state.scores);
    usage.restore(state.usage);
    info!(
        workers,
        saved_at = ?state.saved_at,
        "Restored persisted score state"
    );
    Ok(true)
}
