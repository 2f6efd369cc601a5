//! Counter write path
//!
//! Increments one counter bucket per resolved granularity. With
//! bucketization enabled and an object id present the increment lands
//! in a hash field; otherwise on a plain key. Each increment is batched
//! with a refresh of the key's expiration in one pipeline, saving a
//! round trip without being transactional across clients.

use crate::granularity::{self, GranularityRequest};
use crate::key::KeyOptions;
use crate::types::{Context, StorageKey};
use crate::{Analytics, Result};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Options for one count operation
#[derive(Debug, Clone)]
pub struct CountOptions {
    /// Event name, possibly separator-delimited
    pub event: String,
    /// Object id for per-id tallies
    pub id: Option<u64>,
    /// Bucket instant; defaults to now
    pub at: Option<DateTime<Utc>>,
    /// Granularities to record at
    pub granularity: GranularityRequest,
    /// Per-granularity TTL overrides, in seconds
    pub expirations: HashMap<String, u64>,
}

impl CountOptions {
    /// Count options for an event
    pub fn event(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            id: None,
            at: None,
            granularity: GranularityRequest::Default,
            expirations: HashMap::new(),
        }
    }

    /// Attach an object id
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Record at a past instant instead of now
    pub fn at(mut self, instant: DateTime<Utc>) -> Self {
        self.at = Some(instant);
        self
    }

    /// Restrict the recorded granularities
    pub fn granularity(mut self, request: GranularityRequest) -> Self {
        self.granularity = request;
        self
    }

    /// Override the TTL for one granularity
    pub fn expire(mut self, granularity: impl Into<String>, ttl: u64) -> Self {
        self.expirations.insert(granularity.into(), ttl);
        self
    }
}

/// Increment counter buckets for every resolved granularity.
pub(crate) async fn record(client: &Analytics, options: &CountOptions) -> Result<()> {
    let config = client.config();
    let at = options.at.unwrap_or_else(Utc::now);
    let key_options = KeyOptions { id: options.id, namespaced: true };

    for granularity in granularity::validate(config, Context::Counter, &options.granularity) {
        let key = client
            .codec()
            .name(Context::Counter, &options.event, &granularity, at, &key_options);
        let ttl = options
            .expirations
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| config.expiration(Context::Counter, &granularity));
        debug!(key = %key, granularity = %granularity, "incrementing counter");

        client
            .store(move |mut conn| {
                let key = key.clone();
                async move {
                    let mut pipe = redis::pipe();
                    match &key {
                        StorageKey::Bucketized(key, field) => {
                            pipe.hincr(key, field, 1).ignore().expire(key, ttl as i64).ignore();
                        }
                        StorageKey::Plain(key) => {
                            pipe.incr(key, 1).ignore().expire(key, ttl as i64).ignore();
                        }
                    }
                    pipe.query_async::<()>(&mut conn).await
                }
            })
            .await?;
    }
    Ok(())
}
