//! Errors raised while parsing UIDs and identity tokens.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("value cannot be empty")]
    Empty,

    /// A UID carried the prefix of a different object kind.
    #[error("wrong uid prefix: want '{expected}', found '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("uid has no '_' between prefix and body")]
    MissingSeparator,

    #[error("uid body is not a valid ULID: {0}")]
    InvalidUlid(String),

    #[error("identity token has {actual} characters, want {expected}")]
    IdentityLength { expected: usize, actual: usize },

    /// Token contains a character outside the identity alphabet.
    #[error("identity token contains '{0}'")]
    IdentityCharacter(char),
}

impl IdError {
    /// True when the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
