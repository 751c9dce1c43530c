//! File-backed persistence for Switchboard.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Implements the [`routing::ScoreRepository`],
//! [`routing::WeightRepository`], and [`routing::QuestionBank`] ports on top of
//! JSON files in a state directory.

pub mod json_file;
pub mod questions;

pub use json_file::{read_json, write_json, JsonFileStore, SCORES_FILE, WEIGHTS_FILE};
pub use questions::FileQuestionBank;
