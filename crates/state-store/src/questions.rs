//! Evaluation questions loaded from a JSON file.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::info;

use routing::{CollaboratorError, EvaluationQuestion, PersistenceError, QuestionBank};

use crate::json_file::read_json;

/// A fixed list of questions, served round-robin.
#[derive(Debug)]
pub struct FileQuestionBank {
    questions: Vec<EvaluationQuestion>,
    cursor: AtomicUsize,
}

impl FileQuestionBank {
    pub fn from_questions(questions: Vec<EvaluationQuestion>) -> Self {
        Self {
            questions,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Loads a JSON array of questions. A missing file yields an empty bank.
    ///
    /// # Errors
    ///
    /// Propagates read and decode failures.
    pub async fn load(path: &Path) -> Result<Self, PersistenceError> {
        let questions: Vec<EvaluationQuestion> = read_json(path).await?.unwrap_or_default();
        info!(path = %path.display(), questions = questions.len(), "Loaded question bank");
        Ok(Self::from_questions(questions))
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[async_trait]
impl QuestionBank for FileQuestionBank {
    async fn next_question(&self) -> Result<Option<EvaluationQuestion>, CollaboratorError> {
        if self.questions.is_empty() {
            return Ok(None);
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % self.questions.len();
        Ok(Some(self.questions[position].clone()))
    }
}
