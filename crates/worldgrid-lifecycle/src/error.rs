use thiserror::Error;
use worldgrid_core::KeyError;
use worldgrid_provider::ProviderError;
use worldgrid_state::StateError;
use worldgrid_tasks::{TaskError, TaskOutcome};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("world not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("task error: {0}")]
    Task(#[from] TaskError),
}

impl From<KeyError> for LifecycleError {
    fn from(e: KeyError) -> Self {
        LifecycleError::Decode(e.to_string())
    }
}

impl LifecycleError {
    /// How a task handler reports this error to the dispatcher.
    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            LifecycleError::Decode(msg) | LifecycleError::Conflict(msg) => {
                TaskOutcome::Rejected(msg)
            }
            LifecycleError::NotFound(world) => TaskOutcome::NotFound(world),
            other => TaskOutcome::Failed(other.to_string()),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
