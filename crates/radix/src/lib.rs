//! In-memory compressed prefix tree over byte-string keys.
//!
//! Keys are compared byte-wise and traversal always yields them in strict
//! ascending order, which is what lets the persistence layer pack a tree
//! into ordered, sliceable files. The tree itself is pure data with no
//! intrinsic failure modes; errors only arise from caller callbacks.
//!
//! In serialized form two in-band markers separate structure from data:
//! [`GROUP`] opens a shared-prefix subtree and [`RECORD`] marks a value.
//! In memory no markers are needed; each node holds a children map (edges
//! labeled by byte strings, no two sharing a first byte) and an optional
//! value slot.

use core::ops::ControlFlow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Group marker: "the following subtree shares the prefix spelled by the
/// path from the root". Appears only in serialized trees.
pub const GROUP: u8 = 0x1D;

/// Record marker: "the value under this path is stored here". Appears only
/// in serialized trees.
pub const RECORD: u8 = 0x1E;

/// Key filter used by [`RadixTree::range`]: exact match, prefix, or an
/// interval inclusive on both present endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter<'a> {
    Exact(&'a [u8]),
    Prefix(&'a [u8]),
    Range {
        lo: Option<&'a [u8]>,
        hi: Option<&'a [u8]>,
    },
}

impl Filter<'_> {
    /// Whether a complete key satisfies the filter.
    #[must_use]
    pub fn matches(&self, key: &[u8]) -> bool {
        match *self {
            Self::Exact(k) => key == k,
            Self::Prefix(p) => key.starts_with(p),
            Self::Range { lo, hi } => {
                lo.map_or(true, |lo| key >= lo) && hi.map_or(true, |hi| key <= hi)
            }
        }
    }

    /// Whether any key extending `stem` could still match. Used to prune
    /// whole subtrees during range traversal.
    #[must_use]
    fn reachable(&self, stem: &[u8]) -> bool {
        match *self {
            Self::Exact(k) => k.starts_with(stem),
            Self::Prefix(p) => stem.starts_with(p) || p.starts_with(stem),
            Self::Range { lo, hi } => {
                // Everything under `stem` sorts >= stem, so a subtree is dead
                // once its stem exceeds the upper bound...
                if hi.is_some_and(|hi| stem > hi && !stem.starts_with(hi)) {
                    return false;
                }
                // ...and once every extension sorts below the lower bound.
                if lo.is_some_and(|lo| stem < lo && !lo.starts_with(stem)) {
                    return false;
                }
                true
            }
        }
    }
}

#[derive(Clone, Debug)]
struct Edge<V> {
    label: Vec<u8>,
    node: RadixNode<V>,
}

#[derive(Clone, Debug)]
struct RadixNode<V> {
    /// Keyed by the first byte of each edge label; no two edges out of the
    /// same node share one, so byte order over first bytes is key order.
    children: BTreeMap<u8, Edge<V>>,
    value: Option<V>,
}

impl<V> Default for RadixNode<V> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            value: None,
        }
    }
}

impl<V> RadixNode<V> {
    fn leaf(value: V) -> Self {
        Self {
            children: BTreeMap::new(),
            value: Some(value),
        }
    }
}

/// Compressed prefix tree mapping byte strings to values.
#[derive(Clone, Debug)]
pub struct RadixTree<V> {
    root: RadixNode<V>,
    len: usize,
}

impl<V> Default for RadixTree<V> {
    fn default() -> Self {
        Self {
            root: RadixNode::default(),
            len: 0,
        }
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl<V> RadixTree<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace. Returns the previous value when replacing.
    pub fn set(&mut self, key: &[u8], value: V) -> Option<V> {
        let old = Self::set_rec(&mut self.root, key, value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    fn set_rec(node: &mut RadixNode<V>, key: &[u8], value: V) -> Option<V> {
        let Some(&first) = key.first() else {
            return node.value.replace(value);
        };

        let edge = match node.children.entry(first) {
            Entry::Vacant(slot) => {
                let _ = slot.insert(Edge {
                    label: key.to_vec(),
                    node: RadixNode::leaf(value),
                });
                return None;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        let shared = common_prefix(&edge.label, key);
        if shared == edge.label.len() {
            // Edge label fully consumed; descend with the remaining key.
            return Self::set_rec(&mut edge.node, &key[shared..], value);
        }

        // The edge must split at `shared`: the existing subtree nests under
        // a new interior node, alongside (or as the holder of) the new key.
        let lower_label = edge.label.split_off(shared);
        let lower_node = core::mem::take(&mut edge.node);

        let mut split = RadixNode::default();
        let _ = split.children.insert(
            lower_label[0],
            Edge {
                label: lower_label,
                node: lower_node,
            },
        );

        if shared == key.len() {
            split.value = Some(value);
        } else {
            let rest = key[shared..].to_vec();
            let _ = split.children.insert(
                rest[0],
                Edge {
                    label: rest,
                    node: RadixNode::leaf(value),
                },
            );
        }

        edge.node = split;
        None
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut node = &self.root;
        let mut rest = key;
        loop {
            if rest.is_empty() {
                return node.value.as_ref();
            }
            let edge = node.children.get(&rest[0])?;
            if !rest.starts_with(&edge.label) {
                return None;
            }
            rest = &rest[edge.label.len()..];
            node = &edge.node;
        }
    }

    /// Full in-order traversal. The callback may stop the walk early by
    /// returning [`ControlFlow::Break`]; the carried value is handed back.
    pub fn map<'v, T>(&'v self, mut f: impl FnMut(&[u8], &'v V) -> ControlFlow<T>) -> Option<T> {
        let mut stem = Vec::new();
        match Self::walk(&self.root, &mut stem, None, &mut f) {
            ControlFlow::Break(value) => Some(value),
            ControlFlow::Continue(()) => None,
        }
    }

    /// In-order traversal restricted to keys matching `filter`, with
    /// subtree pruning. Early exit as in [`RadixTree::map`].
    pub fn range<'v, T>(
        &'v self,
        filter: &Filter<'_>,
        mut f: impl FnMut(&[u8], &'v V) -> ControlFlow<T>,
    ) -> Option<T> {
        let mut stem = Vec::new();
        match Self::walk(&self.root, &mut stem, Some(filter), &mut f) {
            ControlFlow::Break(value) => Some(value),
            ControlFlow::Continue(()) => None,
        }
    }

    fn walk<'v, T>(
        node: &'v RadixNode<V>,
        stem: &mut Vec<u8>,
        filter: Option<&Filter<'_>>,
        f: &mut impl FnMut(&[u8], &'v V) -> ControlFlow<T>,
    ) -> ControlFlow<T> {
        if let Some(value) = &node.value {
            if filter.map_or(true, |filter| filter.matches(stem)) {
                f(stem, value)?;
            }
        }
        for edge in node.children.values() {
            stem.extend_from_slice(&edge.label);
            let live = filter.map_or(true, |filter| filter.reachable(stem));
            let flow = if live {
                Self::walk(&edge.node, stem, filter, f)
            } else {
                ControlFlow::Continue(())
            };
            stem.truncate(stem.len() - edge.label.len());
            flow?;
        }
        ControlFlow::Continue(())
    }

    /// All entries in ascending key order. Convenience over [`Self::map`]
    /// for callers that want owned keys.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, &V)> {
        let mut out = Vec::with_capacity(self.len);
        let _ = self.map(|key, value| {
            out.push((key.to_vec(), value));
            ControlFlow::<()>::Continue(())
        });
        out
    }
}

impl<V: Clone> RadixTree<V> {
    /// Merge every entry of `other` into `self`, `other` winning on
    /// conflicting keys.
    pub fn absorb(&mut self, other: &Self) {
        let _ = other.map(|key, value| {
            let _ = self.set(key, value.clone());
            ControlFlow::<()>::Continue(())
        });
    }
}

impl<V> FromIterator<(Vec<u8>, V)> for RadixTree<V> {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, V)>>(iter: I) -> Self {
        let mut tree = Self::new();
        for (key, value) in iter {
            let _ = tree.set(&key, value);
        }
        tree
    }
}
