//! Shared domain types
//!
//! Key contexts, storage key shapes and crate-wide limits used by the
//! key codec, the write paths and the query layer.

use serde::Serialize;
use std::fmt;

/// Maximum number of keys one script invocation may receive.
///
/// The Lua `unpack` C stack is limited to 8000 slots in stock Redis
/// builds (LUAI_MAXCSTACK); a resolved key list larger than this must be
/// rejected before dispatch.
pub const MAX_SCRIPT_KEYS: usize = 8000;

/// Key context: which kind of data a key addresses.
///
/// The context determines the one-character tag at the front of every
/// key and which expiration/granularity defaults apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    /// Per-event numeric tallies, optionally bucketized by object id
    Counter,
    /// Per-event presence bitmaps indexed by object id
    Tracker,
    /// Materialized intermediate results of bitmap algebra
    Operation,
}

impl Context {
    /// One-character key tag (`c`, `t` or `o`)
    pub fn short(&self) -> char {
        match self {
            Context::Counter => 'c',
            Context::Tracker => 't',
            Context::Operation => 'o',
        }
    }

    /// Long name, used in configuration lookups and log messages
    pub fn long(&self) -> &'static str {
        match self {
            Context::Counter => "counter",
            Context::Tracker => "tracker",
            Context::Operation => "operation",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long())
    }
}

/// A resolved store key.
///
/// Counters with bucketization enabled address a field inside a hash at
/// `key` instead of a standalone key. On the script wire a plain key
/// serializes as a string and a bucketized one as a `[key, field]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StorageKey {
    /// A standalone key
    Plain(String),
    /// A hash key plus the field offset inside it
    Bucketized(String, String),
}

impl StorageKey {
    /// The Redis key part (the hash key for bucketized entries)
    pub fn key(&self) -> &str {
        match self {
            StorageKey::Plain(k) => k,
            StorageKey::Bucketized(k, _) => k,
        }
    }

    /// The hash field, if this entry is bucketized
    pub fn field(&self) -> Option<&str> {
        match self {
            StorageKey::Plain(_) => None,
            StorageKey::Bucketized(_, f) => Some(f),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Plain(k) => write!(f, "{}", k),
            StorageKey::Bucketized(k, field) => write!(f, "{}[{}]", k, field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_tags() {
        assert_eq!(Context::Counter.short(), 'c');
        assert_eq!(Context::Tracker.short(), 't');
        assert_eq!(Context::Operation.short(), 'o');
        assert_eq!(Context::Counter.long(), "counter");
    }

    #[test]
    fn test_storage_key_accessors() {
        let plain = StorageKey::Plain("rl:c:event:2024".into());
        assert_eq!(plain.key(), "rl:c:event:2024");
        assert!(plain.field().is_none());

        let bucketized = StorageKey::Bucketized("rl:c:event:2024:2".into(), "6".into());
        assert_eq!(bucketized.key(), "rl:c:event:2024:2");
        assert_eq!(bucketized.field(), Some("6"));
    }

    #[test]
    fn test_storage_key_wire_shape() {
        // Plain keys serialize as strings, bucketized ones as pairs
        let plain = StorageKey::Plain("a".into());
        assert_eq!(serde_json::to_string(&plain).unwrap(), "\"a\"");

        let bucketized = StorageKey::Bucketized("a".into(), "b".into());
        assert_eq!(serde_json::to_string(&bucketized).unwrap(), "[\"a\",\"b\"]");
    }
}
