//! Typed error/status shape for the geodb RPC facade.
//!
//! `geodb-core::Error` stays an internal, `thiserror`-derived enum; this
//! wraps it for the wire boundary, where every payload crossing tarpc must
//! already be `Serialize`/`Deserialize` — which rules out carrying a
//! `bincode::Error` or `std::io::Error` across directly, so those causes are
//! flattened to their `Display` string here.

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use geodb_core::Error as CoreError;

#[derive(ThisError, Debug, Clone, Serialize, Deserialize)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

/// The five typed statuses every RPC failure maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    InvalidArgument,
    NotFound,
    Unauthenticated,
    Internal,
    Unimplemented,
}

impl Error {
    /// §7: a missing key on `Get` carries `InvalidArgument`, not `NotFound`
    /// — `NotFound` is reserved here for symmetry but this facade never
    /// distinguishes it from a bad argument, matching Delete's behavior.
    pub fn status(&self) -> Status {
        match self {
            Error::Validation(_) | Error::NotFound(_) => Status::InvalidArgument,
            Error::Internal(_) => Status::Internal,
            Error::Unauthenticated => Status::Unauthenticated,
            Error::Unimplemented(_) => Status::Unimplemented,
        }
    }

    pub fn unauthenticated() -> Self {
        Error::Unauthenticated
    }
}

impl From<CoreError> for Error {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => Error::Validation(msg),
            CoreError::NotFound(msg) => Error::NotFound(msg),
            CoreError::Provider(msg) => Error::Internal(msg),
            CoreError::Internal(msg) => Error::Internal(msg),
            CoreError::Codec(err) => Error::Internal(err.to_string()),
            CoreError::Io(err) => Error::Internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
