//! Tracker write path
//!
//! Sets the presence bit for an object id in one tracker bitmap per
//! resolved granularity. Tracker keys are never bucketized; the id is
//! the bit position. Set-bit and expiration refresh travel in one
//! pipeline, like the counter path.

use crate::granularity::{self, GranularityRequest};
use crate::key::KeyOptions;
use crate::types::Context;
use crate::{Analytics, Result};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Options for one track operation
#[derive(Debug, Clone)]
pub struct TrackOptions {
    /// Event name, possibly separator-delimited
    pub event: String,
    /// Object id; the bit position to set
    pub id: u64,
    /// Bucket instant; defaults to now
    pub at: Option<DateTime<Utc>>,
    /// Granularities to record at
    pub granularity: GranularityRequest,
    /// Per-granularity TTL overrides, in seconds
    pub expirations: HashMap<String, u64>,
}

impl TrackOptions {
    /// Track options for an event and object id
    pub fn event(event: impl Into<String>, id: u64) -> Self {
        Self {
            event: event.into(),
            id,
            at: None,
            granularity: GranularityRequest::Default,
            expirations: HashMap::new(),
        }
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

/// Set the presence bit in every resolved granularity's bitmap.
pub(crate) async fn record(client: &Analytics, options: &TrackOptions) -> Result<()> {
    let config = client.config();
    let at = options.at.unwrap_or_else(Utc::now);
    // Tracker keys carry no id suffix; the id is the bit position
    let key_options = KeyOptions { id: None, namespaced: true };

    for granularity in granularity::validate(config, Context::Tracker, &options.granularity) {
        let key = client
            .codec()
            .name(Context::Tracker, &options.event, &granularity, at, &key_options);
        let ttl = options
            .expirations
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| config.expiration(Context::Tracker, &granularity));
        let id = options.id;
        debug!(key = %key, id, granularity = %granularity, "setting presence bit");

        let name = key.key().to_string();
        client
            .store(move |mut conn| {
                let name = name.clone();
                async move {
                    redis::pipe()
                        .setbit(&name, id as usize, true)
                        .ignore()
                        .expire(&name, ttl as i64)
                        .ignore()
                        .query_async::<()>(&mut conn)
                        .await
                }
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = TrackOptions::event("logins", 7)
            .granularity(GranularityRequest::span("daily", "monthly"))
            .expire("monthly", 60);

        assert_eq!(options.event, "logins");
        assert_eq!(options.id, 7);
        assert_eq!(
            options.granularity,
            GranularityRequest::span("daily", "monthly")
        );
        assert_eq!(options.expirations.get("monthly"), Some(&60));
    }
}
