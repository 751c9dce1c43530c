//! Workflow execution, request gateway, and background scoring jobs.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** This crate sequences calls between the domain logic
//! in [`routing`] and the port traits it defines. It contains no domain rules
//! of its own and performs no I/O except through those ports.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`executor`] | `DagExecutor`: level-by-level concurrent workflow runs |
//! | [`gateway`] | `Gateway`: verify, validate, admit, execute |
//! | [`periodic`] | Shutdown signal and the periodic job loop |
//! | [`stake_refresh`] | Stake directory refresh job |
//! | [`evaluation`] | Evaluation rounds and score-state restore |
//! | [`publication`] | Weight recomputation and export job |

pub mod evaluation;
pub mod executor;
pub mod gateway;
pub mod periodic;
pub mod publication;
pub mod stake_refresh;

pub use evaluation::{restore_scores, EvaluationConfig, Evaluator};
pub use executor::{
    DagExecutor, EndNodeOutput, ExecutorConfig, NodeResult, NodeStatus, WorkflowRunResult,
};
pub use gateway::{Gateway, WorkflowSubmission};
pub use periodic::{shutdown_channel, ShutdownRx, ShutdownTx};
pub use publication::{PublicationConfig, WeightPublisher};
pub use stake_refresh::{StakeRefreshConfig, StakeRefresher};
