//! Core error taxonomy shared by every component.
//!
//! Mirrors the closed kind enumeration in the spec: each variant is a
//! recoverable condition a caller can match on, except `OutOfMemory` which
//! is fatal by design (see `is_fatal`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IkigaiError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("database connection error: {0}")]
    DbConnect(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid event kind: {0}")]
    InvalidKind(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

pub type IkigaiResult<T> = Result<T, IkigaiError>;

impl IkigaiError {
    /// Out-of-memory is the only hard-fatal kind; allocation-failure paths
    /// abort rather than risk inconsistent in-memory/durable state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IkigaiError::OutOfMemory)
    }

    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        IkigaiError::InvalidArg(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        IkigaiError::NotFound(msg.into())
    }
}

impl From<rusqlite::Error> for IkigaiError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => IkigaiError::NotFound(e.to_string()),
            other => IkigaiError::Io(other.to_string()),
        }
    }
}
