//! Time-bucketed event analytics on Redis.
//!
//! Events are written two ways. Counters tally how often something
//! happened per time bucket, optionally per object id. Trackers set
//! one bit per object id in a per-bucket bitmap, so distinct presence
//! over any span of buckets is a bitmap union. Both sides bucket by
//! configurable granularities, from minutely to yearly, and every key
//! carries a TTL so old buckets fall out on their own.
//!
//! Reads are lazy [`Query`] values. A query resolves an event plus a
//! time specification into the covered bucket keys, then computes
//! sums, distinct counts, per-bucket plots or id presence through one
//! server-side script call per result. Queries compose into boolean
//! algebra trees with [`QueryNode::and`], [`QueryNode::or`],
//! [`QueryNode::xor`], [`QueryNode::not`] and [`QueryNode::minus`];
//! intermediate bitmaps live under temporary keys that expire by TTL
//! and can be deleted eagerly with `dispose`.
//!
//! ```no_run
//! use redistat::{Analytics, Config, CountOptions, TimeSpec, TrackOptions};
//!
//! # async fn demo() -> redistat::Result<()> {
//! let client = Analytics::connect(Config::default()).await?;
//!
//! client.count(&CountOptions::event("visits").id(42)).await?;
//! client.track(&TrackOptions::event("visits", 42)).await?;
//!
//! let visits = client.analyze("visits", TimeSpec::keyword("this_week"));
//! let total = visits.counts(&client).await?;
//! let unique = visits.tracks(&client).await?;
//! println!("{total} visits, {unique} visitors");
//! visits.dispose(&client).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod counter;
pub mod error;
pub mod granularity;
pub mod key;
pub mod query;
pub mod script;
pub mod time_frame;
pub mod tracker;
pub mod types;

pub use config::{Config, ExpirationConfig, GranularityConfig};
pub use connection::PoolMetricsSnapshot;
pub use counter::CountOptions;
pub use error::{Error, Result};
pub use granularity::GranularityRequest;
pub use query::{Operation, Plot, Query, QueryNode, QueryOptions, ResetScope, SetOperator};
pub use time_frame::{TimeFrame, TimeKeyword, TimeSpec};
pub use tracker::TrackOptions;
pub use types::{Context, StorageKey, MAX_SCRIPT_KEYS};

use connection::RedisPool;
use key::KeyCodec;
use redis::aio::MultiplexedConnection;
use script::{ScriptDispatch, ScriptKind, ScriptParams};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Client handle: configuration, connection pool, key codec and the
/// script dispatcher. Cheap to share behind an `Arc`.
pub struct Analytics {
    config: Arc<Config>,
    pool: Arc<RedisPool>,
    codec: KeyCodec,
    scripts: ScriptDispatch,
}

impl Analytics {
    /// Validate the configuration and connect to the store
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let config = Arc::new(config);
        let pool = Arc::new(
            RedisPool::new(&config.url, config.pool_size, config.pool_timeout()).await?,
        );
        let codec = KeyCodec::new(config.clone());
        Ok(Self {
            config,
            pool,
            codec,
            scripts: ScriptDispatch::new(),
        })
    }

    /// Record a counter event at every requested granularity
    pub async fn count(&self, options: &CountOptions) -> Result<()> {
        counter::record(self, options).await
    }

    /// Record id presence at every requested granularity
    pub async fn track(&self, options: &TrackOptions) -> Result<()> {
        tracker::record(self, options).await
    }

    /// A lazy query over one event and time specification
    pub fn analyze(&self, event: impl Into<String>, time: TimeSpec) -> Query {
        self.analyze_with(event, time, QueryOptions::default())
    }

    /// [`Analytics::analyze`] with an id filter or granularity request
    pub fn analyze_with(
        &self,
        event: impl Into<String>,
        time: TimeSpec,
        options: QueryOptions,
    ) -> Query {
        Query::new(event.into(), time, options, self.config.auto_clean)
    }

    /// Round-trip the store connection
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    /// Counters for commands, failures, retries and reconnects
    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics()
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Run a write against the pool.
    ///
    /// Under `silent`, store-level failures are logged and replaced
    /// with the type's default so callers see an empty result instead
    /// of an error. Key-resolution and configuration errors are never
    /// swallowed.
    pub(crate) async fn store<F, Fut, T>(&self, f: F) -> Result<T>
    where
        T: Default,
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = std::result::Result<T, redis::RedisError>>,
    {
        match self.pool.execute(f).await {
            Ok(value) => Ok(value),
            Err(e) if self.config.silent && e.is_store_error() => {
                warn!(error = %e, "store error suppressed");
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatch one script call, honoring the `silent` policy
    pub(crate) async fn script(
        &self,
        kind: ScriptKind,
        keys: &[StorageKey],
        params: &ScriptParams,
    ) -> Result<redis::Value> {
        match self.scripts.invoke(&self.pool, kind, keys, params).await {
            Ok(value) => Ok(value),
            Err(e) if self.config.silent && e.is_store_error() => {
                warn!(error = %e, kind = kind.tag(), "script error suppressed");
                Ok(redis::Value::Nil)
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate a temporary operation key.
    ///
    /// Under `silent` a store failure falls back to a fresh random
    /// candidate without creating it; the caller's writes bring the
    /// key into existence on first use.
    pub(crate) async fn unique_namespace(&self) -> Result<String> {
        match self.codec.unique_namespace(&self.pool).await {
            Ok(key) => Ok(key),
            Err(e) if self.config.silent && e.is_store_error() => {
                warn!(error = %e, "namespace allocation failed, using uncreated candidate");
                Ok(self.codec.operation_key())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn bitcount(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.store(move |mut conn| {
            let key = key.clone();
            async move { redis::cmd("BITCOUNT").arg(&key).query_async(&mut conn).await }
        })
        .await
    }

    pub(crate) async fn getbit(&self, key: &str, id: u64) -> Result<bool> {
        let key = key.to_string();
        self.store(move |mut conn| {
            let key = key.clone();
            async move {
                redis::cmd("GETBIT")
                    .arg(&key)
                    .arg(id)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }

    pub(crate) async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys = keys.to_vec();
        self.store(move |mut conn| {
            let keys = keys.clone();
            async move {
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<i64>(&mut conn)
                    .await
            }
        })
        .await
        .map(|_| ())
    }
}
