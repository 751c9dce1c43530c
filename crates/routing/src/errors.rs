//! Error taxonomy and retry-policy types for the routing domain.
//!
//! Each stage of request handling has its own error type:
//!
//! | Type | Raised by | Effect |
//! |------|-----------|--------|
//! | [`ValidationError`] | graph validation | request rejected before execution |
//! | [`AdmissionError`] | rate limiter / signature check | request rejected before execution |
//! | [`InvocationError`] | worker calls | recorded on the node, dependents skipped |
//! | [`PersistenceError`] | state repositories | logged; in-memory state stays authoritative |
//!
//! [`SwitchboardError`] wraps the ones that can end a request or halt startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Nothing inside the core retries automatically. This value is surfaced to
/// callers (e.g. as a `Retry-After` header) so they can decide for themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means the caller
        /// applies its own back-off schedule.
        after: Option<Duration>,
    },
    /// Retrying the same request will fail the same way.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reasons a submitted workflow graph is rejected.
///
/// Validation is pure and runs before any execution; these errors are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    /// The workflow has no nodes at all.
    #[error("Workflow contains no nodes")]
    EmptyWorkflow,

    /// The submission carries no workflow id.
    #[error("Workflow id is missing")]
    MissingWorkflowId,

    /// Two nodes share an id.
    #[error("Duplicate node id '{node}'")]
    DuplicateNodeId { node: String },

    /// A node lists a dependency that is not declared in the same graph.
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    /// The dependency relation contains a cycle.
    ///
    /// `nodes` lists every node that could not be placed in a topological order.
    #[error("Workflow contains a cycle through {nodes:?}")]
    CycleDetected { nodes: Vec<String> },

    /// A node is missing required fields or carries invalid ones.
    #[error("Node '{node}' is malformed: {reason}")]
    MalformedNode { node: String, reason: String },

    /// No node is free of dependents, so nothing would be returned.
    #[error("Workflow has no terminal node")]
    NoTerminalNode,
}

// ---------------------------------------------------------------------------
// Worker invocation
// ---------------------------------------------------------------------------

/// Failure of a single worker call.
///
/// Recorded on the failing node and propagated to its dependents as a skip.
/// Never retried within a run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum InvocationError {
    /// Connection-level failure; the worker was never reached.
    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    /// The worker rejected the forwarded credentials.
    #[error("Worker rejected credentials: {0}")]
    AuthRejected(String),

    /// No reply arrived before the deadline.
    #[error("Worker call timed out after {0}")]
    Timeout(String),

    /// The worker replied with content that does not match the capability's schema.
    #[error("Malformed worker response: {0}")]
    MalformedResponse(String),

    /// The worker replied with a well-formed error payload.
    #[error("Worker reported an error: {0}")]
    WorkerReportedError(String),
}

impl InvocationError {
    /// Builds a [`InvocationError::Timeout`] describing `limit`.
    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout(format!("{}ms", limit.as_millis()))
    }

    /// Whether a later, separate attempt could succeed.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) | Self::WorkerReportedError(_) => {
                RetryPolicy::Retryable { after: None }
            }
            Self::AuthRejected(_) | Self::MalformedResponse(_) => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Node-level outcome errors
// ---------------------------------------------------------------------------

/// Why a node did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The node's own worker call failed.
    #[error(transparent)]
    Invocation(InvocationError),

    /// A dependency failed or was skipped, so this node was never invoked.
    #[error("Skipped: dependency '{dependency}' did not succeed ({cause})")]
    UpstreamFailed { dependency: NodeId, cause: String },

    /// The workflow deadline elapsed before this node finished.
    #[error("Skipped: workflow deadline exceeded")]
    WorkflowTimeout,
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Reasons a request is refused before any work starts.
///
/// Admission errors have no side effects on the caller's budget.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionError {
    /// The caller has consumed its requests-per-minute budget for this window.
    #[error("Rate limit exceeded: {used}/{limit} requests this minute")]
    RpmExceeded {
        limit: u32,
        used: u32,
        /// Time until the current window resets.
        retry_after: Duration,
    },

    /// The caller already has as many requests in flight as its dynamic
    /// concurrency ceiling allows.
    #[error("Concurrency limit exceeded: {current}/{limit} requests in flight")]
    ConcurrencyExceeded { limit: u32, current: u32 },

    /// The request carried an identity whose signature did not verify.
    #[error("Signature verification failed for identity '{identity}'")]
    InvalidSignature { identity: String },
}

impl AdmissionError {
    /// Whether and when the caller may try again.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RpmExceeded { retry_after, .. } => RetryPolicy::Retryable {
                after: Some(*retry_after),
            },
            Self::ConcurrencyExceeded { .. } => RetryPolicy::Retryable { after: None },
            Self::InvalidSignature { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Failure to load or save persisted state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Corrupt state in '{path}': {message}")]
    Corrupt { path: String, message: String },
}

// ---------------------------------------------------------------------------
// External collaborators
// ---------------------------------------------------------------------------

/// Failure talking to a stake source, weight sink, or question bank.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The collaborator answered with an error status.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The collaborator answered with content that could not be decoded.
    #[error("Undecodable response: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Top-level errors
// ---------------------------------------------------------------------------

/// Errors that end a request or halt startup.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// The submitted workflow failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request was not admitted.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Persisted state could not be read or written.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The runtime configuration is invalid.
    ///
    /// Produced at load time; the service never starts with an invalid config.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}
