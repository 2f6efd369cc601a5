//! Server-side aggregation script dispatch
//!
//! All read-path aggregation goes through one Lua script executed
//! atomically by the store. Arguments travel as three msgpack blobs
//! (operation kind, key list, options map) so the script can decode
//! heterogeneous types safely; bucketized counter keys arrive as
//! `[key, field]` pairs.
//!
//! The script is loaded once per endpoint and invoked by SHA
//! thereafter. If the store forgets the script (restart, SCRIPT FLUSH),
//! the cached SHA is dropped, the source is re-submitted and the call
//! is retried exactly once.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::types::StorageKey;

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use tracing::{debug, warn};

/// The aggregation script body.
///
/// # Arguments (msgpack-encoded)
/// - `ARGV[1]`: operation kind: `counts`, `plot_counts`, `plot_tracks`
///   or `operation`
/// - `ARGV[2]`: key list; bucketized counter entries are `[key, field]`
/// - `ARGV[3]`: options map: `{bucketized}` for the count kinds,
///   `{operator, dest}` for `operation`, `{}` otherwise
///
/// # Returns
/// - `counts`: array of per-key integers
/// - `plot_counts` / `plot_tracks`: JSON object mapping key → count
/// - `operation`: status reply after combining into `dest` via BITOP;
///   MINUS is `A AND NOT B` through a transient `<dest>:not` key, with
///   the complement padded to A's byte length
const AGGREGATE_LUA: &str = r#"
local kind = cmsgpack.unpack(ARGV[1])
local keys = cmsgpack.unpack(ARGV[2])
local opts = cmsgpack.unpack(ARGV[3])

local function counter_value(entry, bucketized)
    local raw
    if bucketized and type(entry) == 'table' then
        raw = redis.call('HGET', entry[1], entry[2])
    else
        raw = redis.call('GET', entry)
    end
    if raw == false or raw == nil then
        return 0
    end
    return tonumber(raw) or 0
end

if kind == 'counts' then
    local result = {}
    for i, entry in ipairs(keys) do
        result[i] = counter_value(entry, opts.bucketized)
    end
    return result

elseif kind == 'plot_counts' then
    local result = {}
    for _, entry in ipairs(keys) do
        local name = entry
        if type(entry) == 'table' then
            name = entry[1]
        end
        result[name] = counter_value(entry, opts.bucketized)
    end
    return cjson.encode(result)

elseif kind == 'plot_tracks' then
    local result = {}
    for _, name in ipairs(keys) do
        result[name] = redis.call('BITCOUNT', name)
    end
    return cjson.encode(result)

elseif kind == 'operation' then
    if opts.operator == 'MINUS' then
        -- A AND NOT B. NOT's result is only as long as its operand and
        -- AND zero-pads the shorter side, so B is padded out to A's
        -- byte length first or every A-bit past B's length would clear.
        local tmp = opts.dest .. ':not'
        redis.call('BITOP', 'OR', tmp, keys[2])
        local left_len = redis.call('STRLEN', keys[1])
        if left_len > 0 and redis.call('STRLEN', tmp) < left_len then
            redis.call('SETBIT', tmp, left_len * 8 - 1, 0)
        end
        redis.call('BITOP', 'NOT', tmp, tmp)
        redis.call('BITOP', 'AND', opts.dest, keys[1], tmp)
        redis.call('DEL', tmp)
    else
        redis.call('BITOP', opts.operator, opts.dest, unpack(keys))
    end
    return redis.status_reply('OK')
end

return redis.error_reply('unknown operation kind')
"#;

/// Named aggregation operations the script understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Per-key counter values
    Counts,
    /// Counter values keyed by bucket key, JSON-encoded
    PlotCounts,
    /// Tracker bit counts keyed by bucket key, JSON-encoded
    PlotTracks,
    /// Bitmap combination into a destination key
    Operation,
}

impl ScriptKind {
    /// The literal tag shipped to the script
    pub fn tag(self) -> &'static str {
        match self {
            ScriptKind::Counts => "counts",
            ScriptKind::PlotCounts => "plot_counts",
            ScriptKind::PlotTracks => "plot_tracks",
            ScriptKind::Operation => "operation",
        }
    }
}

/// Options map for one invocation, shaped per kind
#[derive(Debug, Clone)]
pub enum ScriptParams {
    /// `{bucketized}`, for `counts` and `plot_counts`
    Counts {
        /// Whether counter entries are `[key, field]` pairs
        bucketized: bool,
    },
    /// `{}`, for `plot_tracks`
    Empty,
    /// `{operator, dest}`, for `operation`
    Operation {
        /// Set operator: AND, OR, XOR, NOT or MINUS
        operator: String,
        /// Destination key for the combined bitmap
        dest: String,
    },
}

#[derive(Serialize)]
struct CountsWire {
    bucketized: bool,
}

#[derive(Serialize)]
struct OperationWire<'a> {
    operator: &'a str,
    dest: &'a str,
}

impl ScriptParams {
    fn to_msgpack(&self) -> Result<Vec<u8>> {
        let blob = match self {
            ScriptParams::Counts { bucketized } => {
                rmp_serde::to_vec_named(&CountsWire { bucketized: *bucketized })?
            }
            ScriptParams::Empty => rmp_serde::to_vec_named(&BTreeMap::<String, String>::new())?,
            ScriptParams::Operation { operator, dest } => {
                rmp_serde::to_vec_named(&OperationWire { operator, dest })?
            }
        };
        Ok(blob)
    }
}

/// Per-endpoint cache of the loaded script's SHA, plus the dispatcher
pub struct ScriptDispatch {
    shas: RwLock<HashMap<String, String>>,
}

impl ScriptDispatch {
    /// Create a dispatcher with an empty SHA cache
    pub fn new() -> Self {
        Self { shas: RwLock::new(HashMap::new()) }
    }

    /// The embedded script source
    pub fn source() -> &'static str {
        AGGREGATE_LUA
    }

    /// Invoke one aggregation operation over a key list.
    ///
    /// Loads the script on first use per endpoint; a NOSCRIPT failure
    /// clears the cached SHA and retries exactly once.
    pub async fn invoke(
        &self,
        pool: &RedisPool,
        kind: ScriptKind,
        keys: &[StorageKey],
        params: &ScriptParams,
    ) -> Result<redis::Value> {
        let kind_blob = rmp_serde::to_vec(kind.tag())?;
        let keys_blob = rmp_serde::to_vec(keys)?;
        let params_blob = params.to_msgpack()?;

        let mut reloaded = false;
        loop {
            let sha = self.sha(pool).await?;
            let result = {
                let (sha, kind_blob, keys_blob, params_blob) = (
                    sha.clone(),
                    kind_blob.clone(),
                    keys_blob.clone(),
                    params_blob.clone(),
                );
                pool.execute(move |mut conn| {
                    let (sha, kind_blob, keys_blob, params_blob) = (
                        sha.clone(),
                        kind_blob.clone(),
                        keys_blob.clone(),
                        params_blob.clone(),
                    );
                    async move {
                        redis::cmd("EVALSHA")
                            .arg(&sha)
                            .arg(0)
                            .arg(&kind_blob)
                            .arg(&keys_blob)
                            .arg(&params_blob)
                            .query_async::<redis::Value>(&mut conn)
                            .await
                    }
                })
                .await
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_noscript(&e) && !reloaded => {
                    warn!(kind = kind.tag(), "script unknown to endpoint, reloading");
                    self.shas.write().remove(pool.url());
                    reloaded = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cached SHA for this endpoint, loading the script when absent
    async fn sha(&self, pool: &RedisPool) -> Result<String> {
        if let Some(sha) = self.shas.read().get(pool.url()) {
            return Ok(sha.clone());
        }
        let sha: String = pool
            .execute(|mut conn| async move {
                redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(AGGREGATE_LUA)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        debug!(sha = %sha, "aggregation script loaded");
        self.shas.write().insert(pool.url().to_string(), sha.clone());
        Ok(sha)
    }
}

impl Default for ScriptDispatch {
    fn default() -> Self {
        Self::new()
    }
}

fn is_noscript(e: &Error) -> bool {
    matches!(e, Error::Script(msg) if msg.contains("NOSCRIPT"))
}
