use thiserror::Error;
use worldgrid_state::StateError;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("no handler registered for task {0:?}")]
    UnknownRoute(String),
}

pub type TaskResult<T> = Result<T, TaskError>;
