use thiserror::Error;

/// Errors surfaced by the storage layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key {key:?} already holds a different payload")]
    KeyConflict { key: String },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("{0}")]
    Other(String),
}

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("missing blob {0:?}")]
    MissingBlob(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid node blob: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid attribute blob: {0}")]
    Binary(#[from] binrw::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
