//! Errors raised while assembling or addressing events.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// `build()` was called before a required field was set.
    #[error("event envelope is missing '{0}'")]
    MissingField(&'static str),

    /// Object keys are `namespace/name`.
    #[error("malformed object key '{0}'")]
    InvalidKey(String),
}
