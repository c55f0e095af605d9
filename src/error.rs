use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShrinkrayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Job {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: i64,
        status: String,
        expected: String,
    },

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Encoder failed ({exit_status}): {stderr_tail}")]
    Transcode {
        exit_status: String,
        stderr_tail: String,
    },

    #[error("Encoder detection failed: {0}")]
    Detection(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShrinkrayError>;
