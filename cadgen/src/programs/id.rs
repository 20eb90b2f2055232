//! Opaque identifiers for generated programs.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identifier of one generated program and its artifact directory.
///
/// A fresh id is allocated for every execution attempt, successful or not,
/// and never reused. The range is wide enough that collisions are not
/// handled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self(rng.gen_range(1_000_000_000_000u64..9_000_000_000_000u64).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProgramId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgramId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = ProgramId::new();
        let b = ProgramId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn id_is_a_decimal_string_in_range() {
        let id = ProgramId::new();
        let n: u64 = id.as_str().parse().expect("numeric id");
        assert!((1_000_000_000_000..9_000_000_000_000).contains(&n));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ProgramId::from("1234567890123");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""1234567890123""#);
    }
}
