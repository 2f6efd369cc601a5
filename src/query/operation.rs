//! Internal algebra-tree nodes
//!
//! An [`Operation`] combines child bitmaps with one bitwise set
//! operator. Children materialize first, post-order, then a single
//! script call combines their bitmap keys into a fresh temporary
//! namespace key owned by this node.

use crate::query::{QueryNode, ResetScope};
use crate::script::{ScriptKind, ScriptParams};
use crate::types::StorageKey;
use crate::{Analytics, Result};

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Bitwise set operator applied to child bitmaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    /// Intersection, n-ary
    And,
    /// Union, n-ary
    Or,
    /// Symmetric difference, n-ary
    Xor,
    /// Complement over the operand's own bit length, unary
    Not,
    /// Difference `A AND NOT B`, binary
    Minus,
}

impl SetOperator {
    /// Wire tag understood by the combination script
    pub fn tag(self) -> &'static str {
        match self {
            SetOperator::And => "AND",
            SetOperator::Or => "OR",
            SetOperator::Xor => "XOR",
            SetOperator::Not => "NOT",
            SetOperator::Minus => "MINUS",
        }
    }
}

#[derive(Default)]
struct OperationCache {
    track_bits: Option<String>,
    tracks: Option<u64>,
    namespaces: Vec<String>,
}

/// An internal combination node over shared children
pub struct Operation {
    operator: SetOperator,
    children: Vec<Arc<QueryNode>>,
    cache: Mutex<OperationCache>,
}

impl Operation {
    /// # Panics
    /// When the operand count does not match the operator's arity:
    /// `Not` takes exactly one child, `Minus` exactly two, the rest at
    /// least one.
    pub(crate) fn new(operator: SetOperator, children: Vec<Arc<QueryNode>>) -> Self {
        match operator {
            SetOperator::Not => assert_eq!(
                children.len(),
                1,
                "NOT takes exactly one operand, got {}",
                children.len()
            ),
            SetOperator::Minus => assert_eq!(
                children.len(),
                2,
                "MINUS takes exactly two operands, got {}",
                children.len()
            ),
            _ => assert!(
                !children.is_empty(),
                "{} takes at least one operand",
                operator.tag()
            ),
        }
        Self {
            operator,
            children,
            cache: Mutex::new(OperationCache::default()),
        }
    }

    /// The operator at this node
    pub fn operator(&self) -> SetOperator {
        self.operator
    }

    /// The child nodes, in operand order
    pub fn children(&self) -> &[Arc<QueryNode>] {
        &self.children
    }

    /// Key of this node's materialized bitmap.
    ///
    /// Materializes every child first, then combines their bitmap keys
    /// with this node's operator into a temporary key. Computed once;
    /// later calls return the cached key.
    pub async fn track_bits(&self, client: &Analytics) -> Result<String> {
        {
            let cache = self.cache.lock().await;
            if let Some(key) = &cache.track_bits {
                return Ok(key.clone());
            }
        }

        let mut operands = Vec::with_capacity(self.children.len());
        for child in &self.children {
            operands.push(StorageKey::Plain(child.track_bits(client).await?));
        }

        let dest = client.unique_namespace().await?;
        let params = ScriptParams::Operation {
            operator: self.operator.tag().to_string(),
            dest: dest.clone(),
        };
        client
            .script(ScriptKind::Operation, &operands, &params)
            .await?;

        let mut cache = self.cache.lock().await;
        cache.namespaces.push(dest.clone());
        cache.track_bits = Some(dest.clone());
        Ok(dest)
    }

    /// Number of ids set in this node's bitmap
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

    /// Bit-test an id against this node's bitmap.
    ///
    /// Child id filters play no part here; the test runs against the
    /// combined bitmap alone.
    pub async fn exists(&self, client: &Analytics, id: u64) -> Result<bool> {
        let key = self.track_bits(client).await?;
        client.getbit(&key, id).await
    }

    /// Clear cached state.
    ///
    /// `Tree` resets every descendant first, then this node. Every
    /// other scope touches this node alone; each owned temporary key
    /// is deleted along with the caches that reference it.
    pub async fn reset(&self, client: &Analytics, scope: ResetScope) -> Result<()> {
        if scope == ResetScope::Tree {
            for child in &self.children {
                child.reset(client, ResetScope::Tree).await?;
            }
        }
        let mut cache = self.cache.lock().await;
        let namespaces = std::mem::take(&mut cache.namespaces);
        *cache = OperationCache::default();
        drop(cache);
        if !namespaces.is_empty() {
            client.del(&namespaces).await?;
        }
        Ok(())
    }

    /// Delete every temporary key this node owns.
    ///
    /// Children are left untouched; dispose them separately, or reset
    /// with [`ResetScope::Tree`] to sweep the whole tree.
    pub async fn dispose(&self, client: &Analytics) -> Result<()> {
        self.reset(client, ResetScope::All).await
    }

    /// Whether this node's result is already materialized
    pub async fn is_materialized(&self) -> bool {
        self.cache.lock().await.track_bits.is_some()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if let Ok(cache) = self.cache.try_lock() {
            if !cache.namespaces.is_empty() {
                warn!(
                    operator = self.operator.tag(),
                    keys = cache.namespaces.len(),
                    "operation dropped with undisposed temporary keys; they expire by TTL"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Query, QueryOptions};
    use crate::time_frame::TimeSpec;

    fn leaf(event: &str) -> Arc<QueryNode> {
        Query::new(
            event.to_string(),
            TimeSpec::keyword("today"),
            QueryOptions::default(),
            false,
        )
        .into_node()
    }

    #[test]
    fn test_operator_tags() {
        assert_eq!(SetOperator::And.tag(), "AND");
        assert_eq!(SetOperator::Minus.tag(), "MINUS");
    }

    #[test]
    fn test_arity_accepted() {
        Operation::new(SetOperator::Not, vec![leaf("a")]);
        Operation::new(SetOperator::Minus, vec![leaf("a"), leaf("b")]);
        Operation::new(SetOperator::And, vec![leaf("a"), leaf("b"), leaf("c")]);
        Operation::new(SetOperator::Or, vec![leaf("a")]);
    }

    #[test]
    #[should_panic(expected = "NOT takes exactly one operand")]
    fn test_not_rejects_two_operands() {
        Operation::new(SetOperator::Not, vec![leaf("a"), leaf("b")]);
    }

    #[test]
    #[should_panic(expected = "MINUS takes exactly two operands")]
    fn test_minus_rejects_one_operand() {
        Operation::new(SetOperator::Minus, vec![leaf("a")]);
    }

    #[test]
    #[should_panic(expected = "AND takes at least one operand")]
    fn test_and_rejects_empty() {
        Operation::new(SetOperator::And, vec![]);
    }

    #[test]
    fn test_shared_operand_across_trees() {
        let shared = leaf("signup");
        let left = QueryNode::and(vec![shared.clone(), leaf("visit")]);
        let right = QueryNode::minus(shared.clone(), leaf("churn"));
        assert_eq!(Arc::strong_count(&shared), 3);
        match (left.as_ref(), right.as_ref()) {
            (QueryNode::Operation(a), QueryNode::Operation(b)) => {
                assert!(Arc::ptr_eq(&a.children()[0], &b.children()[0]));
            }
            _ => unreachable!(),
        }
    }
}
