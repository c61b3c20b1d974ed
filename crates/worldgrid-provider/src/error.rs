use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;
