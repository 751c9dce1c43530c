//! Switchboard's inbound HTTP surface.
//!
//! Exposes workflow submission, rate-limit introspection, the published weight
//! snapshot, and a health probe over `axum`, and ships the Ed25519
//! implementation of [`routing::SignatureVerifier`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport details and status-code mapping live here.
//! All request semantics belong to [`orchestrator::Gateway`].

pub mod server;
pub mod signature;

pub use server::{build_router, serve, ApiError, ListenerState};
pub use signature::Ed25519Verifier;
