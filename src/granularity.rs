//! Granularity catalog resolution
//!
//! The configuration carries a fixed, ordered table of granularities
//! (finest first). User requests, whether one name, a list, or an
//! inclusive span by catalog position, are validated against that
//! table; unknown
//! names are dropped silently and an empty result falls back to the
//! context default, then to the finest granularity.

use crate::config::Config;
use crate::types::Context;

/// A granularity request, resolved against the catalog ordering
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GranularityRequest {
    /// Use the context's configured default span
    #[default]
    Default,
    /// A single named granularity
    One(String),
    /// An explicit list, kept in request order
    Many(Vec<String>),
    /// An inclusive span from one catalog position to another
    Span(String, String),
}

impl GranularityRequest {
    /// A single named granularity
    pub fn one(name: impl Into<String>) -> Self {
        GranularityRequest::One(name.into())
    }

    /// An inclusive span by catalog position
    pub fn span(first: impl Into<String>, last: impl Into<String>) -> Self {
        GranularityRequest::Span(first.into(), last.into())
    }
}

/// Resolve a request to a non-empty, ordered list of granularity names.
pub fn validate(config: &Config, context: Context, request: &GranularityRequest) -> Vec<String> {
    check(config, request).unwrap_or_else(|| default(config, context))
}

/// The context's default granularities; never empty.
pub fn default(config: &Config, context: Context) -> Vec<String> {
    let (first, last) = config.default_span(context).clone();
    check(config, &GranularityRequest::Span(first, last)).unwrap_or_else(|| {
        // The catalog is validated non-empty; the finest granularity is
        // the last resort
        vec![config.granularities[0].name.clone()]
    })
}

/// Filter a request against the catalog; None when nothing survives.
fn check(config: &Config, request: &GranularityRequest) -> Option<Vec<String>> {
    let names = config.granularity_names();
    let checked: Vec<String> = match request {
        GranularityRequest::Default => Vec::new(),
        GranularityRequest::One(name) => {
            if names.contains(&name.as_str()) {
                vec![name.clone()]
            } else {
                Vec::new()
            }
        }
        GranularityRequest::Many(list) => list
            .iter()
            .filter(|n| names.contains(&n.as_str()))
            .cloned()
            .collect(),
        GranularityRequest::Span(first, last) => {
            let start = names.iter().position(|n| n == first);
            let end = names.iter().position(|n| n == last);
            match (start, end) {
                (Some(s), Some(e)) if s <= e => {
                    names[s..=e].iter().map(|n| n.to_string()).collect()
                }
                _ => Vec::new(),
            }
        }
    };
    if checked.is_empty() {
        None
    } else {
        Some(checked)
    }
}
