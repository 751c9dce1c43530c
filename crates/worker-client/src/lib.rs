//! HTTP adapters for Switchboard's outbound collaborators.
//!
//! Implements the [`routing::WorkerInvoker`], [`routing::StakeSource`], and
//! [`routing::WeightSink`] ports over `reqwest`.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** All HTTP transport, request formatting, response parsing,
//! and error classification live here. The orchestrator sees only the port
//! traits.

pub mod invoker;
pub mod ledger;
pub mod registry;

use std::time::Duration;

pub use invoker::{HttpWorkerInvoker, API_KEY_HEADER};
pub use ledger::{HttpStakeSource, HttpWeightSink, StakeListing, WeightExport};
pub use registry::{WorkerEndpoint, WorkerRegistry};

/// Builds the shared HTTP client.
///
/// Per-request deadlines are set on each call; `connect_timeout` bounds only
/// connection establishment.
///
/// # Errors
///
/// Fails if the TLS backend cannot be initialised.
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
        .build()
}
