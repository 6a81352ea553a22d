// src/error.rs
//
// Job-level error taxonomy. Handlers and the engine match on these classes;
// backend failures arrive wrapped in `Other` after the client's retry budget
// is exhausted.

use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed command line. Logged and skipped; never cancels the stream.
    #[error("syntax error: {msg}")]
    Parse { line: String, msg: String },

    /// The referenced object or file does not exist.
    #[error("{0}: no such object or file")]
    NotFound(String),

    /// A conditional flag short-circuited the operation. Counted as an
    /// acceptable failure, not a hard one.
    #[error("{0}")]
    Precondition(String),

    /// The root context was cancelled.
    #[error("operation interrupted")]
    Interrupted,

    /// A wildcard parent whose sub-jobs did not all succeed.
    #[error("not all sub-jobs completed successfully: {done}/{total}")]
    BatchIncomplete { done: u64, total: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Acceptable failures count toward the `+OK?` tally instead of `-ERR`.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, JobError::Precondition(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, JobError::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert!(JobError::Precondition("exists".into()).is_acceptable());
        assert!(!JobError::NotFound("x".into()).is_acceptable());
        assert!(JobError::Interrupted.is_interrupted());
    }
}
