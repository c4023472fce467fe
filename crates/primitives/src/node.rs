use std::collections::btree_map::{self, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::soul::Soul;
use crate::value::Value;
use crate::State;

/// The key under which a state indexes the signature map: the state
/// number rendered the way it travels in JSON.
#[must_use]
pub fn state_key(state: State) -> String {
    state.to_string()
}

/// The `_` metadata record of a node: its soul, the per-field logical
/// clocks (`>`), and the optional signature map (`s`) keyed by the
/// stringified state a signed write was made at.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NodeMeta {
    #[serde(rename = "#")]
    pub soul: Soul,

    #[serde(rename = ">", default)]
    pub states: BTreeMap<String, State>,

    #[serde(rename = "s", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sigs: BTreeMap<String, String>,
}

impl NodeMeta {
    #[must_use]
    pub fn new(soul: Soul) -> Self {
        Self {
            soul,
            states: BTreeMap::new(),
            sigs: BTreeMap::new(),
        }
    }

    /// The largest state across all fields, the node's eviction key.
    #[must_use]
    pub fn max_state(&self) -> Option<State> {
        self.states.values().copied().reduce(State::max)
    }
}

/// A graph node: field values plus metadata.
///
/// A field named in `_.>` but absent from the field map is the tombstone
/// sentinel form; readers surface it as [`Value::Null`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Node {
    /// Absent on malformed inbound nodes; such nodes are skipped by merge.
    #[serde(rename = "_", default, skip_serializing_if = "Option::is_none")]
    meta: Option<NodeMeta>,

    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

impl Node {
    #[must_use]
    pub fn new(soul: Soul) -> Self {
        Self {
            meta: Some(NodeMeta::new(soul)),
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn meta(&self) -> Option<&NodeMeta> {
        self.meta.as_ref()
    }

    pub fn meta_mut(&mut self) -> Option<&mut NodeMeta> {
        self.meta.as_mut()
    }

    /// Set a field value and its state in one step.
    pub fn set(&mut self, field: impl Into<String>, value: Value, state: State) {
        let field = field.into();
        if let Some(meta) = &mut self.meta {
            let _ = meta.states.insert(field.clone(), state);
        }
        let _ = self.fields.insert(field, value);
    }

    /// Set a field value without touching the state map. Reply subgraphs
    /// use this for their null-valued "not found" form.
    pub fn set_value(&mut self, field: impl Into<String>, value: Value) {
        let _ = self.fields.insert(field.into(), value);
    }

    /// Attach the signature for a write made at `state` (user-owned
    /// souls). Two fields written at the same state share the one slot.
    pub fn sign(&mut self, state: State, sig: String) {
        if let Some(meta) = &mut self.meta {
            let _ = meta.sigs.insert(state_key(state), sig);
        }
    }

    #[must_use]
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn state(&self, field: &str) -> Option<State> {
        self.meta.as_ref()?.states.get(field).copied()
    }

    /// The signature attached for a write at `state`, if any.
    #[must_use]
    pub fn sig(&self, state: State) -> Option<&str> {
        self.meta
            .as_ref()?
            .sigs
            .get(state_key(state).as_str())
            .map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Field names carrying a state, whether or not a value is present.
    /// Tombstone-sentinel fields appear here with no value.
    pub fn stated_fields(&self) -> impl Iterator<Item = &String> {
        self.meta.iter().flat_map(|meta| meta.states.keys())
    }

    pub fn remove_field(&mut self, field: &str) {
        let _ = self.fields.remove(field);
        let state = self
            .meta
            .as_mut()
            .and_then(|meta| meta.states.remove(field));
        if let Some(state) = state {
            self.prune_sig(state);
        }
    }

    /// Drop the signature slot for `state` once no field holds that state
    /// anymore. Keeps replicas byte-equal when writes are superseded.
    pub fn prune_sig(&mut self, state: State) {
        if let Some(meta) = &mut self.meta {
            if !meta.states.values().any(|held| *held == state) {
                let _ = meta.sigs.remove(state_key(state).as_str());
            }
        }
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self
                .meta
                .as_ref()
                .map_or(true, |meta| meta.states.is_empty())
    }
}

/// A soul-keyed set of nodes: the unit of transfer, merge and storage.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Graph(BTreeMap<Soul, Node>);

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph holding one node.
    #[must_use]
    pub fn single(soul: Soul, node: Node) -> Self {
        let mut graph = Self::new();
        let _ = graph.0.insert(soul, node);
        graph
    }

    pub fn insert(&mut self, soul: Soul, node: Node) -> Option<Node> {
        self.0.insert(soul, node)
    }

    #[must_use]
    pub fn get(&self, soul: &Soul) -> Option<&Node> {
        self.0.get(soul)
    }

    pub fn get_mut(&mut self, soul: &Soul) -> Option<&mut Node> {
        self.0.get_mut(soul)
    }

    /// The node for `soul`, created empty if absent.
    pub fn entry(&mut self, soul: &Soul) -> &mut Node {
        self.0
            .entry(soul.clone())
            .or_insert_with(|| Node::new(soul.clone()))
    }

    pub fn remove(&mut self, soul: &Soul) -> Option<Node> {
        self.0.remove(soul)
    }

    #[must_use]
    pub fn contains(&self, soul: &Soul) -> bool {
        self.0.contains_key(soul)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Soul, Node> {
        self.0.iter()
    }

    pub fn souls(&self) -> impl Iterator<Item = &Soul> {
        self.0.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first soul in key order, the routing target of a PUT.
    #[must_use]
    pub fn first_soul(&self) -> Option<&Soul> {
        self.0.keys().next()
    }
}

impl IntoIterator for Graph {
    type Item = (Soul, Node);
    type IntoIter = btree_map::IntoIter<Soul, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Graph {
    type Item = (&'a Soul, &'a Node);
    type IntoIter = btree_map::Iter<'a, Soul, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(Soul, Node)> for Graph {
    fn from_iter<I: IntoIterator<Item = (Soul, Node)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_round_trip() -> eyre::Result<()> {
        let mut node = Node::new(Soul::from("mark"));
        node.set("name", Value::from("Mark"), 1.0);
        node.set("boss", Value::Relation(Soul::from("amber")), 2.0);

        let json = serde_json::to_string(&node)?;
        let decoded: Node = serde_json::from_str(&json)?;
        assert_eq!(decoded, node);

        let meta = decoded.meta().expect("metadata should survive the trip");
        assert_eq!(meta.soul, Soul::from("mark"));
        assert_eq!(meta.states.get("name"), Some(&1.0));
        assert_eq!(meta.max_state(), Some(2.0));
        Ok(())
    }

    #[test]
    fn node_without_metadata_decodes() -> eyre::Result<()> {
        let decoded: Node = serde_json::from_str("{\"name\":\"Mark\"}")?;
        assert!(decoded.meta().is_none());
        assert_eq!(decoded.value("name"), Some(&Value::from("Mark")));
        Ok(())
    }

    #[test]
    fn wire_shape_matches_protocol() -> eyre::Result<()> {
        let json = r##"{"_":{"#":"mark",">":{"name":1}},"name":"Mark"}"##;
        let node: Node = serde_json::from_str(json)?;
        assert_eq!(node.state("name"), Some(1.0));
        assert_eq!(node.value("name"), Some(&Value::from("Mark")));

        let graph: Graph = serde_json::from_str(&format!("{{\"mark\":{json}}}"))?;
        assert!(graph.contains(&Soul::from("mark")));
        Ok(())
    }

    #[test]
    fn signatures_are_keyed_by_state() {
        let mut node = Node::new(Soul::from("~somepub"));
        node.set("a", Value::from("x"), 1.0);
        node.set("b", Value::from("y"), 1.0);
        node.sign(1.0, "sig1".to_owned());

        assert_eq!(node.sig(1.0), Some("sig1"));
        assert!(node.sig(2.0).is_none());

        // Wire shape: `_.s` maps the stringified state to the signature.
        let json = serde_json::to_value(&node).expect("node serializes");
        assert_eq!(json["_"]["s"]["1"], "sig1");

        // The slot survives while any field still holds the state.
        node.remove_field("a");
        assert_eq!(node.sig(1.0), Some("sig1"));
        node.remove_field("b");
        assert!(node.sig(1.0).is_none());
    }

    #[test]
    fn tombstone_sentinel_fields_are_stated_but_valueless() {
        let mut node = Node::new(Soul::from("s"));
        node.set("alive", Value::from("yes"), 1.0);
        if let Some(meta) = node.meta_mut() {
            let _ = meta.states.insert("gone".to_owned(), 5.0);
        }

        let stated: Vec<_> = node.stated_fields().cloned().collect();
        assert_eq!(stated, vec!["alive".to_owned(), "gone".to_owned()]);
        assert!(node.value("gone").is_none());
    }
}
