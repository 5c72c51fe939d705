use thiserror::Error;

#[derive(Debug, Error)]
pub enum GptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),
}

pub type Result<T> = std::result::Result<T, GptError>;
