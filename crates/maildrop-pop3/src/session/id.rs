//! Session identifiers.
//!
//! Ids are opaque alphanumeric tokens drawn from the thread-local RNG.

use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Default session id length.
pub const DEFAULT_ID_LENGTH: usize = 16;

/// Shortest id length accepted by the configuration.
pub const MIN_ID_LENGTH: usize = 8;

/// Longest id length accepted by the configuration.
pub const MAX_ID_LENGTH: usize = 128;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an existing token.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Generator for random session ids of a fixed length.
#[derive(Debug, Clone, Copy)]
pub struct IdGenerator {
    length: usize,
}

impl IdGenerator {
    /// Creates a generator producing ids of `length` characters.
    #[must_use]
    pub const fn new(length: usize) -> Self {
        Self { length }
    }

    /// Generates the next id.
    #[must_use]
    pub fn next(&self) -> SessionId {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect();
        SessionId(token)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_LENGTH)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_id_length() {
        let generator = IdGenerator::new(24);
        assert_eq!(generator.next().as_str().len(), 24);
        assert_eq!(IdGenerator::default().next().as_str().len(), DEFAULT_ID_LENGTH);
    }

    #[test]
    fn test_id_alphabet() {
        let id = IdGenerator::default().next();
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_uniqueness() {
        let generator = IdGenerator::default();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..10000 {
            assert!(seen.insert(generator.next()), "duplicate id generated");
        }
    }
}
