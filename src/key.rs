//! Key construction and the reversible numeric encoding
//!
//! Every stored datum lives under a deterministic key:
//!
//! ```text
//! [namespace sep] tag sep event sep timelabel [sep bucket-or-id]
//! ```
//!
//! where `tag` is the one-character context tag, numeric event segments
//! and ids are shrunk through a bijective two-digits-to-one-character
//! encoding, and counter ids are optionally bucketized into hash fields
//! (`id div bucket_size` selects the hash, `id mod bucket_size` the
//! field) to bound the number of distinct keys.

use crate::config::Config;
use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::granularity::{self, GranularityRequest};
use crate::time_frame::{TimeFrame, TimeSpec};
use crate::types::{Context, StorageKey, MAX_SCRIPT_KEYS};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The 100-entry encode table: index is the two-digit group value, the
/// entry is the character it maps to.
const ENCODE_TABLE: [char; 100] = [
    '1', '2', '3', '4', '5', '6', '7', '8', '9', '0', // 00–09
    '-', '=', '!', '@', '#', '$', '%', '^', '&', '*', // 10–19
    '(', ')', '_', '+', 'a', 'b', 'c', 'd', 'e', 'f', // 20–29
    'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', // 30–39
    'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', // 40–49
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', // 50–59
    'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', // 60–69
    'U', 'V', 'W', 'X', 'Y', 'Z', '[', ']', '\\', ';', // 70–79
    ',', '.', '/', '{', '}', '|', '§', '<', '>', '?', // 80–89
    '`', '~', 'ä', 'Ä', 'ü', 'Ü', 'ö', 'Ö', 'é', 'É', // 90–99
];

/// Per-key construction options
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    /// Object id, for counter suffixing / bucketization
    pub id: Option<u64>,
    /// Prepend the configured namespace
    pub namespaced: bool,
}

impl KeyOptions {
    /// Options carrying an object id
    pub fn with_id(id: u64) -> Self {
        Self { id: Some(id), namespaced: false }
    }
}

/// Builds store keys and owns the reversible numeric encoding.
///
/// The encode/decode tables are exact inverses for every group 0–99.
/// If the configured separator collides with a mapped character, that
/// single entry is swapped with `':'` so the separator never appears
/// inside an encoded token.
pub struct KeyCodec {
    config: Arc<Config>,
    encode_table: [char; 100],
    decode_table: HashMap<char, u8>,
}

impl KeyCodec {
    /// Build a codec for the given configuration
    pub fn new(config: Arc<Config>) -> Self {
        let separator = config.separator_char();
        let mut encode_table = ENCODE_TABLE;
        if separator != ':' {
            if let Some(slot) = encode_table.iter_mut().find(|c| **c == separator) {
                *slot = ':';
            }
        }
        let decode_table = encode_table
            .iter()
            .enumerate()
            .map(|(value, c)| (*c, value as u8))
            .collect();
        Self { config, encode_table, decode_table }
    }

    /// Encode a non-negative integer into its compact character form.
    ///
    /// Digits are grouped in pairs from the left (odd lengths get one
    /// leading zero) and each pair maps to one table character.
    pub fn encode(&self, number: u64) -> String {
        let mut digits = number.to_string();
        if digits.len() % 2 != 0 {
            digits.insert(0, '0');
        }
        digits
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                let group = (pair[0] - b'0') * 10 + (pair[1] - b'0');
                self.encode_table[group as usize]
            })
            .collect()
    }

    /// Decode a compact character form back into the integer it encodes
    pub fn decode(&self, encoded: &str) -> Result<u64> {
        let mut digits = String::with_capacity(encoded.chars().count() * 2);
        for c in encoded.chars() {
            let group = self
                .decode_table
                .get(&c)
                .ok_or_else(|| Error::Encoding(format!("unmapped character '{}'", c)))?;
            digits.push_str(&format!("{:02}", group));
        }
        digits
            .parse::<u64>()
            .map_err(|e| Error::Encoding(format!("decoded value overflows: {}", e)))
    }

    /// Prepend the configured namespace unless it is empty or already
    /// present as the first key segment.
    pub fn with_namespace(&self, key: &str) -> String {
        let namespace = &self.config.namespace;
        if namespace.is_empty() {
            return key.to_string();
        }
        let separator = self.config.separator_char();
        if key.split(separator).next() == Some(namespace.as_str()) {
            return key.to_string();
        }
        format!("{}{}{}", namespace, separator, key)
    }

    /// Whether a counter write/read for these options lands in a bucket
    pub fn bucketize(&self, context: Context, id: Option<u64>) -> bool {
        context == Context::Counter && self.config.bucket && id.is_some()
    }

    /// Construct the key for one context/event/granularity/instant.
    ///
    /// Counters with an id get either a bucketized `(key, field)` pair
    /// or the (optionally encoded) id appended; all other contexts get
    /// the plain key.
    pub fn name(
        &self,
        context: Context,
        event: &str,
        granularity: &str,
        instant: DateTime<Utc>,
        options: &KeyOptions,
    ) -> StorageKey {
        let granularity = granularity::validate(
            &self.config,
            context,
            &GranularityRequest::one(granularity),
        )
        .remove(0);
        let pattern = self
            .config
            .granularity(&granularity)
            .map(|g| g.pattern.as_str())
            .unwrap_or("%Y%m%d");
        let separator = self.config.separator_char();

        let event = if self.config.encode.events {
            self.encode_event(event)
        } else {
            event.to_string()
        };
        let mut key = format!(
            "{}{}{}{}{}",
            context.short(),
            separator,
            event,
            separator,
            instant.format(pattern)
        );
        if options.namespaced {
            key = self.with_namespace(&key);
        }

        match options.id {
            Some(id) if self.bucketize(context, options.id) => {
                let (bucket, offset) = (id / self.config.bucket_size, id % self.config.bucket_size);
                let (bucket, offset) = if self.config.encode.ids {
                    (self.encode(bucket), self.encode(offset))
                } else {
                    (bucket.to_string(), offset.to_string())
                };
                StorageKey::Bucketized(format!("{}{}{}", key, separator, bucket), offset)
            }
            Some(id) if context == Context::Counter => {
                let id = if self.config.encode.ids {
                    self.encode(id)
                } else {
                    id.to_string()
                };
                StorageKey::Plain(format!("{}{}{}", key, separator, id))
            }
            _ => StorageKey::Plain(key),
        }
    }

    /// Encode purely numeric, separator-delimited event name segments
    fn encode_event(&self, event: &str) -> String {
        let separator = self.config.separator_char();
        event
            .split(separator)
            .map(|segment| {
                if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                    match segment.parse::<u64>() {
                        Ok(n) => self.encode(n),
                        Err(_) => segment.to_string(),
                    }
                } else {
                    segment.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(&separator.to_string())
    }

    /// All keys of a time frame, in bucket order, plus the resolved
    /// frame itself.
    ///
    /// Errors with [`Error::KeyRangeExceeded`] before any dispatch when
    /// the span/granularity combination produces more keys than one
    /// script invocation accepts.
    pub fn timeframed(
        &self,
        context: Context,
        event: &str,
        time: &TimeSpec,
        granularity: &GranularityRequest,
        id: Option<u64>,
    ) -> Result<(Vec<StorageKey>, TimeFrame)> {
        let frame = TimeFrame::new(&self.config, context, time, granularity)?;
        let options = KeyOptions { id, namespaced: true };
        let mut keys = Vec::new();
        for instant in frame.steps() {
            keys.push(self.name(context, event, &frame.granularity, instant, &options));
            if keys.len() > MAX_SCRIPT_KEYS {
                return Err(Error::KeyRangeExceeded {
                    count: keys.len(),
                    max: MAX_SCRIPT_KEYS,
                });
            }
        }
        Ok((keys, frame))
    }

    /// A fresh operation-context key candidate, namespaced
    pub fn operation_key(&self) -> String {
        let separator = self.config.separator_char();
        self.with_namespace(&format!(
            "{}{}{}",
            Context::Operation.short(),
            separator,
            Uuid::new_v4()
        ))
    }

    /// Allocate a unique temporary namespace key in the store.
    ///
    /// Generates random candidates until one is unused, then creates it
    /// with value `0` and the operation TTL. Concurrent callers race on
    /// distinct random names; an observed collision just regenerates.
    pub async fn unique_namespace(&self, pool: &RedisPool) -> Result<String> {
        let ttl = self.config.operation_expiration;
        loop {
            let candidate = self.operation_key();
            let exists: bool = {
                let key = candidate.clone();
                pool.execute(move |mut conn| {
                    let key = key.clone();
                    async move { redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await }
                })
                .await?
            };
            if exists {
                debug!(key = %candidate, "operation key collision, regenerating");
                continue;
            }
            let key = candidate.clone();
            pool.execute(move |mut conn| {
                let key = key.clone();
                async move {
                    redis::pipe()
                        .set(&key, 0)
                        .ignore()
                        .expire(&key, ttl as i64)
                        .ignore()
                        .query_async::<()>(&mut conn)
                        .await
                }
            })
            .await?;
            return Ok(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn codec() -> KeyCodec {
        KeyCodec::new(Arc::new(Config::default()))
    }

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_documented_mapping() {
        let c = codec();
        // "5" pads to "05", group 5 maps to '6'
        assert_eq!(c.encode(5), "6");
        assert_eq!(c.decode("6").unwrap(), 5);
    }

    #[test]
    fn test_encode_decode_bijection() {
        let c = codec();
        for n in 0..10_000u64 {
            assert_eq!(c.decode(&c.encode(n)).unwrap(), n, "roundtrip failed for {}", n);
        }
    }

    #[test]
    fn test_encode_groups_pairs_from_left() {
        let c = codec();
        // 123 pads to "0123": groups 01, 23 map to '2' and '+'
        assert_eq!(c.encode(123), "2+");
        assert_eq!(c.decode("2+").unwrap(), 123);
    }

    #[test]
    fn test_decode_rejects_unmapped() {
        let c = codec();
        assert!(c.decode("✗").is_err());
    }

    #[test]
    fn test_separator_swap() {
        let mut config = Config::default();
        config.separator = "-".to_string();
        let c = KeyCodec::new(Arc::new(config));
        // Group 10 normally maps to '-'; the swap replaces it with ':'
        assert_eq!(c.encode(10), ":");
        assert_eq!(c.decode(":").unwrap(), 10);
        // No encoded token ever contains the separator
        for n in 0..10_000u64 {
            assert!(!c.encode(n).contains('-'));
        }
    }

    #[test]
    fn test_bucket_arithmetic() {
        let config = Config::default();
        let bucket_size = config.bucket_size;
        for id in (0..10_000_000u64).step_by(99_991) {
            let (bucket, offset) = (id / bucket_size, id % bucket_size);
            assert_eq!(bucket * bucket_size + offset, id);
        }
    }

    #[test]
    fn test_plain_tracker_key() {
        let key = codec().name(Context::Tracker, "visits", "daily", instant(), &KeyOptions::default());
        assert_eq!(key, StorageKey::Plain("t:visits:20240515".to_string()));
    }

    #[test]
    fn test_counter_key_bucketized() {
        // id 1203 with bucket size 1000: bucket 1 → "2", offset 203 → "34"
        let key = codec().name(
            Context::Counter,
            "visits",
            "daily",
            instant(),
            &KeyOptions::with_id(1203),
        );
        assert_eq!(
            key,
            StorageKey::Bucketized("c:visits:20240515:2".to_string(), "34".to_string())
        );
    }

    #[test]
    fn test_counter_key_unbucketized() {
        let mut config = Config::default();
        config.bucket = false;
        let c = KeyCodec::new(Arc::new(config));
        let key = c.name(
            Context::Counter,
            "visits",
            "daily",
            instant(),
            &KeyOptions::with_id(5),
        );
        assert_eq!(key, StorageKey::Plain("c:visits:20240515:6".to_string()));
    }

    #[test]
    fn test_numeric_event_segments_encoded() {
        let key = codec().name(
            Context::Tracker,
            "users:42:login",
            "yearly",
            instant(),
            &KeyOptions::default(),
        );
        // 42 → "s"
        assert_eq!(key, StorageKey::Plain("t:users:s:login:2024".to_string()));
    }

    #[test]
    fn test_namespace_idempotent() {
        let c = codec();
        assert_eq!(c.with_namespace("c:visits:2024"), "rl:c:visits:2024");
        assert_eq!(c.with_namespace("rl:c:visits:2024"), "rl:c:visits:2024");

        let mut config = Config::default();
        config.namespace = String::new();
        let bare = KeyCodec::new(Arc::new(config));
        assert_eq!(bare.with_namespace("c:visits:2024"), "c:visits:2024");
    }

    #[test]
    fn test_timeframed_key_list() {
        let c = codec();
        let spec = TimeSpec::Range(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap(),
        );
        let (keys, frame) = c
            .timeframed(
                Context::Tracker,
                "visits",
                &spec,
                &GranularityRequest::one("daily"),
                None,
            )
            .unwrap();
        assert_eq!(frame.granularity, "daily");
        assert_eq!(
            keys,
            vec![
                StorageKey::Plain("rl:t:visits:20240501".to_string()),
                StorageKey::Plain("rl:t:visits:20240502".to_string()),
                StorageKey::Plain("rl:t:visits:20240503".to_string()),
            ]
        );
    }

    #[test]
    fn test_timeframed_range_ceiling() {
        let c = codec();
        // A year of minutely buckets is far beyond 8000 keys
        let spec = TimeSpec::Range(
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        let err = c.timeframed(
            Context::Tracker,
            "visits",
            &spec,
            &GranularityRequest::one("minutely"),
            None,
        );
        assert!(matches!(err, Err(Error::KeyRangeExceeded { .. })));
    }

    #[test]
    fn test_operation_key_shape() {
        let key = codec().operation_key();
        assert!(key.starts_with("rl:o:"));
        assert_ne!(codec().operation_key(), key);
    }
}
