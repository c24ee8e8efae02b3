//! Per-process correlation tokens

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier tying a caller handle, its launcher handle and every
/// packet for one spawned process together
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Token(u64);

impl Token {
    /// Wrap a raw token value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a token that no other call to `next` in this process returns
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value as written on the wire
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Token {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
