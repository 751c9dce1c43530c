//! Request entry point.
//!
//! A submission passes four gates in a fixed order:
//!
//! 1. signature verification, when an identity is presented;
//! 2. graph validation;
//! 3. admission by the [`RateLimiter`];
//! 4. execution by the [`DagExecutor`].
//!
//! Malformed graphs are rejected before admission and never consume budget.
//! The admission [`Lease`](routing::Lease) is held for the duration of the
//! run and released when it is dropped, on every exit path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use routing::workflow::{validate, RawWorkflow};
use routing::{
    AdmissionError, Caller, ConversationId, Identity, RateLimiter, SignatureVerifier,
    SwitchboardError,
};

use crate::executor::{DagExecutor, WorkflowRunResult};

/// A workflow submission as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSubmission {
    pub workflow: RawWorkflow,
    pub cid: ConversationId,
    /// Hex-encoded caller identity. Absent for anonymous callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Signature over the canonical JSON encoding of `workflow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl WorkflowSubmission {
    /// The bytes a caller signs: `workflow` serialised as compact JSON, with
    /// fields in declaration order.
    pub fn signing_message(&self) -> Vec<u8> {
        serde_json::to_vec(&self.workflow).unwrap_or_default()
    }
}

/// Verifies, validates, admits, and executes workflow submissions.
pub struct Gateway {
    verifier: Arc<dyn SignatureVerifier>,
    limiter: Arc<RateLimiter>,
    executor: Arc<DagExecutor>,
}

impl Gateway {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        limiter: Arc<RateLimiter>,
        executor: Arc<DagExecutor>,
    ) -> Self {
        Self {
            verifier,
            limiter,
            executor,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Resolves who is calling. Anonymous callers are keyed by `origin`.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::InvalidSignature`] if an identity is presented without
    /// a signature that verifies.
    pub fn authenticate(
        &self,
        submission: &WorkflowSubmission,
        origin: &str,
    ) -> Result<Caller, AdmissionError> {
        let Some(identity) = &submission.identity else {
            return Ok(Caller::Anonymous {
                origin: origin.to_owned(),
            });
        };
        let verified = submission.signature.as_deref().is_some_and(|signature| {
            self.verifier
                .verify(identity, &submission.signing_message(), signature)
        });
        if verified {
            Ok(Caller::Identified(identity.clone()))
        } else {
            warn!(%identity, "Rejected submission with invalid signature");
            Err(AdmissionError::InvalidSignature {
                identity: identity.to_string(),
            })
        }
    }

    /// Runs one submission end to end.
    ///
    /// `origin` identifies anonymous callers; `credential` is forwarded to
    /// every worker the workflow calls.
    ///
    /// # Errors
    ///
    /// - [`SwitchboardError::Admission`] for bad signatures and exhausted budgets
    /// - [`SwitchboardError::Validation`] for malformed graphs
    ///
    /// Node-level failures are not errors: they are reported inside the
    /// returned [`WorkflowRunResult`].
    #[instrument(
        skip(self, submission, credential),
        fields(workflow_id = %submission.workflow.workflow_id, cid = %submission.cid)
    )]
    pub async fn submit(
        &self,
        submission: WorkflowSubmission,
        origin: &str,
        credential: Option<&str>,
    ) -> Result<WorkflowRunResult, SwitchboardError> {
        let caller = self.authenticate(&submission, origin)?;
        let graph = validate(&submission.workflow).inspect_err(|err| {
            debug!(error = %err, "Workflow failed validation");
        })?;
        let lease = self.limiter.admit(&caller).inspect_err(|err| {
            info!(%caller, error = %err, "Submission not admitted");
        })?;

        let result = self
            .executor
            .execute(&graph, &submission.cid, credential)
            .await;
        drop(lease);
        Ok(result)
    }
}
