//! # gamefleet-id
//!
//! Identifier types shared by the gamefleet controller crates.
//!
//! ## Design Principles
//!
//! - Object UIDs are system-generated and never reused; names are user-controlled
//! - Every ID has a canonical string form with strict parsing
//! - IDs are typed so a reconcile-pass id can never be passed where an object UID is expected
//! - Instance identity tokens are short, random, and unique among live instances
//!
//! ## ID Format
//!
//! ULID-backed IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `rec_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Instance identity tokens are five characters drawn from a vowel-free
//! alphabet (e.g. `x7k2q`) so they are safe to embed in object names.

mod error;
mod identity;
mod macros;
mod types;

pub use error::IdError;
pub use identity::{InstanceIdentity, IDENTITY_ALPHABET, IDENTITY_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
