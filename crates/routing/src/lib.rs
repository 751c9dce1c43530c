//! Core routing domain for Switchboard.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and error type used by the request-routing platform, together with
//! the stateful algorithms that need no I/O: workflow validation, stake-based
//! admission, rolling-window scoring, and weight computation. Infrastructure
//! crates implement the port traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`Identity`, `NodeId`, `RunId`, etc.) |
//! | [`types`] | Shared value types (`Stake`, `Percentage`, `Capability`, etc.) |
//! | [`errors`] | Error taxonomy and retry policy |
//! | [`workflow`] | Raw and validated workflow graphs, topological levels |
//! | [`stakes`] | Copy-on-write stake directory |
//! | [`admission`] | Stake-proportional rate limiter and leases |
//! | [`scoring`] | Evaluation windows and EMA usage tracking |
//! | [`weights`] | Weight formula, engine, and published weight board |
//! | [`ports`] | Traits implemented by infrastructure crates |

pub mod admission;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod scoring;
pub mod stakes;
pub mod types;
pub mod weights;
pub mod workflow;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use admission::{Caller, Lease, RateLimitConfig, RateLimitStatus, RateLimiter};
pub use errors::{
    AdmissionError, CollaboratorError, InvocationError, NodeError, PersistenceError, RetryPolicy,
    SwitchboardError, ValidationError,
};
pub use identifiers::{ConversationId, Identity, NodeId, QuestionId, RunId, WorkflowId};
pub use ports::{
    ContainsAnswerGrader, EvaluationQuestion, Grader, InvocationRequest, PersistedScores,
    QuestionBank, ScoreRepository, SignatureVerifier, StakeSource, WeightRepository, WeightSink,
    WorkerInvoker,
};
pub use scoring::{ScoreStore, UsageTracker};
pub use stakes::{StakeDirectory, StakeSnapshot};
pub use types::{Capability, EvaluationOutcome, Percentage, Stake, Timestamp, TrafficKind};
pub use weights::{WeightBoard, WeightEngine, WeightRecord, WeightSnapshot};
pub use workflow::{validate, Node, NodeKind, RawNode, RawWorkflow, WorkerCall, WorkflowGraph};
