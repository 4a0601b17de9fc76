//! Instance identity tokens.
//!
//! Each workload instance carries a short random token that is unique among
//! the instances of its deployment that are alive at creation time. The token
//! becomes the suffix of the instance name and the key of its pre-delete hook.

use std::collections::HashSet;

use rand::Rng;

use crate::IdError;

/// Number of characters in an identity token.
pub const IDENTITY_LEN: usize = 5;

/// Alphabet for identity tokens. Vowels and look-alike digits are left out so
/// tokens never spell words and survive being read aloud.
pub const IDENTITY_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// A fixed-length random identity token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceIdentity(String);

impl InstanceIdentity {
    /// Generates a random token using the supplied generator.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let token = (0..IDENTITY_LEN)
            .map(|_| IDENTITY_ALPHABET[rng.random_range(0..IDENTITY_ALPHABET.len())] as char)
            .collect();
        Self(token)
    }

    /// Generates `count` distinct tokens, none of which appear in `live`.
    ///
    /// The caller passes every identity currently held by a live instance;
    /// candidates colliding with those (or with each other) are redrawn.
    pub fn generate_pool<R: Rng + ?Sized>(
        rng: &mut R,
        count: usize,
        live: &HashSet<String>,
    ) -> Vec<Self> {
        let mut drawn: HashSet<String> = HashSet::with_capacity(count);
        let mut pool = Vec::with_capacity(count);

        while pool.len() < count {
            let candidate = Self::generate_with(rng);
            if live.contains(candidate.as_str()) || drawn.contains(candidate.as_str()) {
                continue;
            }
            drawn.insert(candidate.0.clone());
            pool.push(candidate);
        }

        pool
    }

    /// Parses and validates an existing token.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() != IDENTITY_LEN {
            return Err(IdError::IdentityLength {
                expected: IDENTITY_LEN,
                actual: s.len(),
            });
        }
        if let Some(c) = s.bytes().find(|b| !IDENTITY_ALPHABET.contains(b)) {
            return Err(IdError::IdentityCharacter(c as char));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for InstanceIdentity {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for InstanceIdentity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceIdentity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
