//! Task handler seam and the outcomes a handler can report.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use http::StatusCode;

/// Flat string parameters carried by every task.
pub type TaskParams = BTreeMap<String, String>;

/// What a handler reports for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work committed; remove the task.
    Done,
    /// The awaited operation has not finished; redeliver later.
    Pending,
    /// Malformed parameters. Never retried.
    Rejected(String),
    /// The record the task refers to does not exist. Never retried.
    NotFound(String),
    /// Provider or store failure; retried with backoff.
    Failed(String),
}

impl TaskOutcome {
    /// HTTP status reported when a task is delivered over HTTP.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TaskOutcome::Done => StatusCode::OK,
            TaskOutcome::Pending => StatusCode::REQUEST_TIMEOUT,
            TaskOutcome::Rejected(_) => StatusCode::BAD_REQUEST,
            TaskOutcome::NotFound(_) => StatusCode::NOT_FOUND,
            TaskOutcome::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatcher should deliver the task again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskOutcome::Pending | TaskOutcome::Failed(_))
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Done => f.write_str("done"),
            TaskOutcome::Pending => f.write_str("pending"),
            TaskOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            TaskOutcome::NotFound(what) => write!(f, "not found: {what}"),
            TaskOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>;

/// A named unit of deferred work.
pub trait TaskHandler: Send + Sync {
    fn handle<'a>(&'a self, params: &'a TaskParams) -> TaskFuture<'a>;

    /// Called once after the dispatcher dead-letters one of this handler's
    /// tasks, so the handler can release markers the task was holding.
    fn dead_lettered(&self, _params: &TaskParams, _reason: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_delivery_status_codes() {
        assert_eq!(TaskOutcome::Done.status_code(), StatusCode::OK);
        assert_eq!(TaskOutcome::Pending.status_code().as_u16(), 408);
        assert_eq!(TaskOutcome::Rejected("bad key".into()).status_code().as_u16(), 400);
        assert_eq!(TaskOutcome::NotFound("alpha".into()).status_code().as_u16(), 404);
        assert_eq!(TaskOutcome::Failed("boom".into()).status_code().as_u16(), 500);
    }

    #[test]
    fn only_pending_and_failed_are_retried() {
        assert!(TaskOutcome::Pending.is_retryable());
        assert!(TaskOutcome::Failed("x".into()).is_retryable());
        assert!(!TaskOutcome::Done.is_retryable());
        assert!(!TaskOutcome::Rejected("x".into()).is_retryable());
        assert!(!TaskOutcome::NotFound("x".into()).is_retryable());
    }
}
