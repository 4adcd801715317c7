// Identifiers
//
// Opaque, globally unique tokens used as the primary key of every
// catalog entity. Identifiers are minted by an `IdGenerator` and are
// never interpreted or combined arithmetically.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque identifier of an item, version or successor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Wrap an identifier read back from a backend or supplied by a caller.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}

/// Source of fresh identifiers.
///
/// Implementations must never hand out the same identifier twice
/// within one backend namespace.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Id;
}

/// Random identifiers of the form `<prefix>.<uuid>`.
#[derive(Debug, Clone)]
pub struct UuidIdGenerator {
    prefix: String,
}

impl UuidIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl IdGenerator for UuidIdGenerator {
    fn new_id(&self) -> Id {
        Id(format!("{}.{}", self.prefix, Uuid::new_v4().simple()))
    }
}

/// Monotonic identifiers of the form `<prefix>.<n>`, starting at 1.
///
/// Only unique for the lifetime of one generator; meant for a single
/// process owning its backend, and for tests.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn new_id(&self) -> Id {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Id(format!("{}.{}", self.prefix, n))
    }
}
