//! Lazy analytics queries
//!
//! A [`Query`] binds an event and a time specification to lazily
//! computed results: counter sums, presence bitmaps, bit counts and
//! per-bucket plots. Every result is computed at most once and cached
//! on the node until explicitly reset. Presence bitmaps materialize in
//! the store under temporary namespace keys owned by the node that
//! created them.
//!
//! Queries combine into boolean-algebra trees through the constructors
//! on [`QueryNode`]: `and`, `or` (`plus`), `xor`, `not` and `minus`.
//! Internal nodes are [`Operation`]s; operands are shared (`Arc`), not
//! copied, so one query may feed several trees.

pub mod operation;

pub use operation::{Operation, SetOperator};

use crate::granularity::GranularityRequest;
use crate::script::{ScriptKind, ScriptParams};
use crate::time_frame::{parse_label, TimeFrame, TimeSpec};
use crate::types::{Context, StorageKey};
use crate::{Analytics, Result};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-bucket plot: instant of each bucket to its count
pub type Plot = BTreeMap<DateTime<Utc>, i64>;

/// Options for a query leaf
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Object id filter; enables `exists` and id-scoped counts
    pub id: Option<u64>,
    /// Granularity request for key resolution
    pub granularity: GranularityRequest,
}

impl QueryOptions {
    /// Options with an object id filter
    pub fn with_id(id: u64) -> Self {
        Self { id: Some(id), ..Default::default() }
    }

    /// Options with a granularity request
    pub fn with_granularity(granularity: GranularityRequest) -> Self {
        Self { granularity, ..Default::default() }
    }

    /// Set the object id filter
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the granularity request
    pub fn granularity(mut self, granularity: GranularityRequest) -> Self {
        self.granularity = granularity;
        self
    }
}

/// What to clear on reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// The cached counter sum
    Counts,
    /// The cached counter plot
    PlotCounts,
    /// The cached tracker plot
    PlotTracks,
    /// The realized counter key list
    CounterKeys,
    /// The realized tracker key list
    TrackerKeys,
    /// The cached bit count, plus the materialized bitmap
    Tracks,
    /// The cached id presence, plus the materialized bitmap
    Exists,
    /// Every counter-side cache
    Counter,
    /// Every tracker-side cache, plus the materialized bitmap
    Tracker,
    /// Recursively reset every descendant, then this node
    Tree,
    /// Everything this node caches and owns
    All,
}

#[derive(Default)]
struct QueryCache {
    counts: Option<i64>,
    tracks: Option<u64>,
    exists: Option<bool>,
    track_bits: Option<String>,
    plot_counts: Option<Plot>,
    plot_tracks: Option<Plot>,
    counter: Option<(Vec<StorageKey>, TimeFrame)>,
    tracker: Option<(Vec<StorageKey>, TimeFrame)>,
    namespaces: Vec<String>,
}

/// A leaf query over one event and time frame
pub struct Query {
    event: String,
    time: TimeSpec,
    options: QueryOptions,
    auto_clean: bool,
    cache: Mutex<QueryCache>,
}

impl Query {
    pub(crate) fn new(event: String, time: TimeSpec, options: QueryOptions, auto_clean: bool) -> Self {
        Self {
            event,
            time,
            options,
            auto_clean,
            cache: Mutex::new(QueryCache::default()),
        }
    }

    /// Wrap this query as a shareable algebra-tree leaf
    pub fn into_node(self) -> Arc<QueryNode> {
        Arc::new(QueryNode::Leaf(self))
    }

    /// The event this query covers
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Sum of counter values over the time frame.
    ///
    /// Errors with `KeyRangeExceeded` before dispatch when the frame
    /// resolves to more keys than one script call accepts.
    pub async fn counts(&self, client: &Analytics) -> Result<i64> {
        let mut cache = self.cache.lock().await;
        if let Some(counts) = cache.counts {
            return Ok(counts);
        }
        self.realize_counter(&mut cache, client)?;
        let (keys, _) = cache.counter.as_ref().expect("counter keys just realized");
        let params = ScriptParams::Counts { bucketized: client.config().bucket };
        let value = client.script(ScriptKind::Counts, keys, &params).await?;
        let total = sum_counts(&value);
        cache.counts = Some(total);
        Ok(total)
    }

    /// Key of the materialized presence bitmap covering the frame.
    ///
    /// Unions every per-bucket tracker bitmap into one temporary
    /// namespace key owned by this query.
    pub async fn track_bits(&self, client: &Analytics) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(key) = &cache.track_bits {
            return Ok(key.clone());
        }
        self.realize_tracker(&mut cache, client)?;
        let dest = client.unique_namespace().await?;
        let (keys, _) = cache.tracker.as_ref().expect("tracker keys just realized");
        let params = ScriptParams::Operation {
            operator: SetOperator::Or.tag().to_string(),
            dest: dest.clone(),
        };
        client.script(ScriptKind::Operation, keys, &params).await?;
        cache.namespaces.push(dest.clone());
        cache.track_bits = Some(dest.clone());
        Ok(dest)
    }

    /// Number of distinct ids present over the frame
    pub async fn tracks(&self, client: &Analytics) -> Result<u64> {
        {
            let cache = self.cache.lock().await;
            if let Some(tracks) = cache.tracks {
                return Ok(tracks);
            }
        }
        let key = self.track_bits(client).await?;
        let count = client.bitcount(&key).await?;
        let mut cache = self.cache.lock().await;
        cache.tracks = Some(count);
        Ok(count)
    }

    /// Whether this query's id filter was present in the frame.
    ///
    /// `None` when the query carries no id filter.
    pub async fn exists(&self, client: &Analytics) -> Result<Option<bool>> {
        let id = match self.options.id {
            Some(id) => id,
            None => return Ok(None),
        };
        {
            let cache = self.cache.lock().await;
            if let Some(exists) = cache.exists {
                return Ok(Some(exists));
            }
        }
        let present = self.exists_bit(client, id).await?;
        let mut cache = self.cache.lock().await;
        cache.exists = Some(present);
        Ok(Some(present))
    }

    /// Bit-test an arbitrary id against the materialized bitmap
    pub async fn exists_bit(&self, client: &Analytics, id: u64) -> Result<bool> {
        let key = self.track_bits(client).await?;
        client.getbit(&key, id).await
    }

    /// Per-bucket counter values keyed by bucket instant.
    ///
    /// `None` when the script response cannot be parsed.
    pub async fn plot_counts(&self, client: &Analytics) -> Result<Option<Plot>> {
        let mut cache = self.cache.lock().await;
        if let Some(plot) = &cache.plot_counts {
            return Ok(Some(plot.clone()));
        }
        self.realize_counter(&mut cache, client)?;
        let (keys, frame) = cache.counter.as_ref().expect("counter keys just realized");
        let params = ScriptParams::Counts { bucketized: client.config().bucket };
        let value = client.script(ScriptKind::PlotCounts, keys, &params).await?;

        // Counter keys carry an id or bucket suffix after the label
        let suffixed = self.options.id.is_some();
        let plot = match parse_plot(client, &value, frame, suffixed) {
            Some(plot) => plot,
            None => return Ok(None),
        };
        cache.plot_counts = Some(plot.clone());
        Ok(Some(plot))
    }

    /// Per-bucket presence counts keyed by bucket instant.
    ///
    /// `None` when the script response cannot be parsed.
    pub async fn plot_tracks(&self, client: &Analytics) -> Result<Option<Plot>> {
        let mut cache = self.cache.lock().await;
        if let Some(plot) = &cache.plot_tracks {
            return Ok(Some(plot.clone()));
        }
        self.realize_tracker(&mut cache, client)?;
        let (keys, frame) = cache.tracker.as_ref().expect("tracker keys just realized");
        let value = client
            .script(ScriptKind::PlotTracks, keys, &ScriptParams::Empty)
            .await?;

        let plot = match parse_plot(client, &value, frame, false) {
            Some(plot) => plot,
            None => return Ok(None),
        };
        cache.plot_tracks = Some(plot.clone());
        Ok(Some(plot))
    }

    /// Clear cached results; `All` also deletes every temporary key
    /// this query owns.
    pub async fn reset(&self, client: &Analytics, scope: ResetScope) -> Result<()> {
        let mut cache = self.cache.lock().await;
        match scope {
            ResetScope::Counts => cache.counts = None,
            ResetScope::PlotCounts => cache.plot_counts = None,
            ResetScope::PlotTracks => cache.plot_tracks = None,
            ResetScope::CounterKeys => cache.counter = None,
            ResetScope::TrackerKeys => cache.tracker = None,
            ResetScope::Tracks => {
                cache.tracks = None;
                release_track_bits(&mut cache, client).await?;
            }
            ResetScope::Exists => {
                cache.exists = None;
                release_track_bits(&mut cache, client).await?;
            }
            ResetScope::Counter => {
                cache.counts = None;
                cache.plot_counts = None;
                cache.counter = None;
            }
            ResetScope::Tracker => {
                cache.tracks = None;
                cache.exists = None;
                cache.plot_tracks = None;
                cache.tracker = None;
                release_track_bits(&mut cache, client).await?;
            }
            ResetScope::Tree | ResetScope::All => {
                let namespaces = std::mem::take(&mut cache.namespaces);
                *cache = QueryCache::default();
                if !namespaces.is_empty() {
                    client.del(&namespaces).await?;
                }
            }
        }
        Ok(())
    }

    /// Delete every temporary key this query owns.
    ///
    /// Call before discarding the node; undisposed keys linger until
    /// their TTL expires.
    pub async fn dispose(&self, client: &Analytics) -> Result<()> {
        self.reset(client, ResetScope::All).await
    }

    /// A query is always a leaf
    pub fn is_leaf(&self) -> bool {
        true
    }

    fn realize_counter(&self, cache: &mut QueryCache, client: &Analytics) -> Result<()> {
        if cache.counter.is_none() {
            cache.counter = Some(client.codec().timeframed(
                Context::Counter,
                &self.event,
                &self.time,
                &self.options.granularity,
                self.options.id,
            )?);
        }
        Ok(())
    }

    fn realize_tracker(&self, cache: &mut QueryCache, client: &Analytics) -> Result<()> {
        if cache.tracker.is_none() {
            cache.tracker = Some(client.codec().timeframed(
                Context::Tracker,
                &self.event,
                &self.time,
                &self.options.granularity,
                None,
            )?);
        }
        Ok(())
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if !self.auto_clean {
            return;
        }
        if let Ok(cache) = self.cache.try_lock() {
            if !cache.namespaces.is_empty() {
                warn!(
                    event = %self.event,
                    keys = cache.namespaces.len(),
                    "query dropped with undisposed temporary keys; they expire by TTL"
                );
            }
        }
    }
}

/// Delete the materialized bitmap key and forget it
async fn release_track_bits(cache: &mut QueryCache, client: &Analytics) -> Result<()> {
    if let Some(key) = cache.track_bits.take() {
        cache.namespaces.retain(|ns| ns != &key);
        client.del(std::slice::from_ref(&key)).await?;
    }
    Ok(())
}

/// A node in the boolean algebra tree: a leaf query or an operation
pub enum QueryNode {
    /// A leaf query
    Leaf(Query),
    /// An internal combination node
    Operation(Operation),
}

impl QueryNode {
    /// Intersection of all children
    ///
    /// # Panics
    /// When `children` is empty.
    pub fn and(children: Vec<Arc<QueryNode>>) -> Arc<QueryNode> {
        Arc::new(QueryNode::Operation(Operation::new(SetOperator::And, children)))
    }

    /// Union of all children
    ///
    /// # Panics
    /// When `children` is empty.
    pub fn or(children: Vec<Arc<QueryNode>>) -> Arc<QueryNode> {
        Arc::new(QueryNode::Operation(Operation::new(SetOperator::Or, children)))
    }

    /// Alias for [`QueryNode::or`]
    pub fn plus(children: Vec<Arc<QueryNode>>) -> Arc<QueryNode> {
        Self::or(children)
    }

    /// Symmetric difference of all children
    ///
    /// # Panics
    /// When `children` is empty.
    pub fn xor(children: Vec<Arc<QueryNode>>) -> Arc<QueryNode> {
        Arc::new(QueryNode::Operation(Operation::new(SetOperator::Xor, children)))
    }

    /// Complement of one child, over its own bit length
    pub fn not(child: Arc<QueryNode>) -> Arc<QueryNode> {
        Arc::new(QueryNode::Operation(Operation::new(SetOperator::Not, vec![child])))
    }

    /// Set difference, left minus right
    pub fn minus(left: Arc<QueryNode>, right: Arc<QueryNode>) -> Arc<QueryNode> {
        Arc::new(QueryNode::Operation(Operation::new(
            SetOperator::Minus,
            vec![left, right],
        )))
    }

    /// Key of this node's materialized bitmap, computing it on first use
    pub fn track_bits<'a>(&'a self, client: &'a Analytics) -> BoxFuture<'a, Result<String>> {
        match self {
            QueryNode::Leaf(query) => Box::pin(query.track_bits(client)),
            QueryNode::Operation(op) => Box::pin(op.track_bits(client)),
        }
    }

    /// Number of ids present in this node's bitmap
    pub fn tracks<'a>(&'a self, client: &'a Analytics) -> BoxFuture<'a, Result<u64>> {
        match self {
            QueryNode::Leaf(query) => Box::pin(query.tracks(client)),
            QueryNode::Operation(op) => Box::pin(op.tracks(client)),
        }
    }

    /// Bit-test an id against this node's bitmap.
    ///
    /// Leaf id filters stay independent per leaf; they are not
    /// intersected into sibling evaluations.
    pub fn exists<'a>(&'a self, client: &'a Analytics, id: u64) -> BoxFuture<'a, Result<bool>> {
        match self {
            QueryNode::Leaf(query) => Box::pin(query.exists_bit(client, id)),
            QueryNode::Operation(op) => Box::pin(op.exists(client, id)),
        }
    }

    /// Reset cached state; see [`Query::reset`] and [`Operation::reset`]
    pub fn reset<'a>(
        &'a self,
        client: &'a Analytics,
        scope: ResetScope,
    ) -> BoxFuture<'a, Result<()>> {
        match self {
            QueryNode::Leaf(query) => Box::pin(query.reset(client, scope)),
            QueryNode::Operation(op) => Box::pin(op.reset(client, scope)),
        }
    }

    /// Delete every temporary key this node owns
    pub fn dispose<'a>(&'a self, client: &'a Analytics) -> BoxFuture<'a, Result<()>> {
        self.reset(client, ResetScope::All)
    }

    /// Whether evaluation can stop at this node without recursing.
    ///
    /// True for leaves, and for operations whose result is already
    /// materialized.
    pub async fn is_leaf(&self) -> bool {
        match self {
            QueryNode::Leaf(_) => true,
            QueryNode::Operation(op) => op.is_materialized().await,
        }
    }
}

/// Sum a `counts` script response; lists are summed element-wise
fn sum_counts(value: &redis::Value) -> i64 {
    match value {
        redis::Value::Int(n) => *n,
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().unwrap_or(0),
        redis::Value::Array(items) => items.iter().map(sum_counts).sum(),
        _ => 0,
    }
}

/// Parse a JSON plot response and re-key it by bucket instant.
///
/// The instant is derived by re-parsing each key's time label with the
/// frame's granularity pattern; entries whose label does not parse are
/// skipped. Returns `None` when the response itself is unparseable.
fn parse_plot(
    client: &Analytics,
    value: &redis::Value,
    frame: &TimeFrame,
    suffixed: bool,
) -> Option<Plot> {
    let bytes = match value {
        redis::Value::BulkString(bytes) => bytes,
        _ => return None,
    };
    let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(bytes).ok()?;

    let separator = client.config().separator_char();
    let mut plot = Plot::new();
    for (key, count) in raw {
        let segments: Vec<&str> = key.split(separator).collect();
        // The label sits before any id/bucket suffix
        let offset = if suffixed { 2 } else { 1 };
        let label = match segments.len().checked_sub(offset).and_then(|i| segments.get(i)) {
            Some(label) => *label,
            None => {
                debug!(key = %key, "plot key too short, skipping");
                continue;
            }
        };
        match parse_label(frame.pattern(), label) {
            Some(instant) => {
                plot.insert(instant, coerce_count(&count));
            }
            None => debug!(key = %key, label = %label, "unparseable plot label, skipping"),
        }
    }
    Some(plot)
}

fn coerce_count(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_counts_shapes() {
        assert_eq!(sum_counts(&redis::Value::Int(7)), 7);
        assert_eq!(
            sum_counts(&redis::Value::BulkString(b"12".to_vec())),
            12
        );
        let list = redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::Int(2),
            redis::Value::BulkString(b"3".to_vec()),
        ]);
        assert_eq!(sum_counts(&list), 6);
        assert_eq!(sum_counts(&redis::Value::Nil), 0);
    }

    #[test]
    fn test_coerce_count() {
        assert_eq!(coerce_count(&serde_json::json!(5)), 5);
        assert_eq!(coerce_count(&serde_json::json!("17")), 17);
        assert_eq!(coerce_count(&serde_json::json!(null)), 0);
    }

    #[test]
    fn test_query_options_builder() {
        let options = QueryOptions::default()
            .id(9)
            .granularity(GranularityRequest::one("hourly"));
        assert_eq!(options.id, Some(9));
        assert_eq!(options.granularity, GranularityRequest::one("hourly"));
    }
}
