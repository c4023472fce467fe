use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::trace;

use mesh_primitives::{FieldSelector, Graph, Node, Soul, Value};

/// Handle for removing a subscription.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    selector: FieldSelector,
    sender: mpsc::UnboundedSender<Graph>,
}

/// Per-soul, per-field callback registry.
///
/// Fired only with fields the merge engine actually accepted, after
/// persistence. A soul with any live subscription also marks this peer as
/// willing to store inbound writes for it (the subscription filter) and
/// shields it from graph eviction.
#[derive(Debug, Default)]
pub struct Listeners {
    next_id: u64,
    by_soul: HashMap<Soul, Vec<Subscription>>,
}

impl Listeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback channel for a soul (and optionally a field
    /// subset).
    pub fn on(
        &mut self,
        soul: Soul,
        selector: FieldSelector,
        sender: mpsc::UnboundedSender<Graph>,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.by_soul.entry(soul).or_default().push(Subscription {
            id,
            selector,
            sender,
        });
        id
    }

    /// Remove one subscription, or every subscription on the soul.
    pub fn off(&mut self, soul: &Soul, id: Option<SubscriptionId>) {
        match id {
            Some(id) => {
                if let Some(subs) = self.by_soul.get_mut(soul) {
                    subs.retain(|sub| sub.id != id);
                    if subs.is_empty() {
                        let _ = self.by_soul.remove(soul);
                    }
                }
            }
            None => {
                let _ = self.by_soul.remove(soul);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, soul: &Soul) -> bool {
        self.by_soul.contains_key(soul)
    }

    /// Souls with live subscriptions, for the eviction keep-set.
    #[must_use]
    pub fn souls(&self) -> HashSet<Soul> {
        self.by_soul.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_soul.is_empty()
    }

    /// Deliver an accepted subgraph to every matching subscription,
    /// dropping subscriptions whose receiver has gone away.
    pub fn fire(&mut self, accepted: &Graph) {
        for (soul, node) in accepted {
            let Some(subs) = self.by_soul.get_mut(soul) else {
                continue;
            };

            subs.retain(|sub| {
                let Some(update) = restrict(soul, node, &sub.selector) else {
                    return true;
                };
                trace!(%soul, "firing listener");
                sub.sender.send(update).is_ok()
            });
            if subs.is_empty() {
                let _ = self.by_soul.remove(soul);
            }
        }
    }
}

/// The sub-node a selector sees, or `None` when no accepted field
/// matches.
fn restrict(soul: &Soul, node: &Node, selector: &FieldSelector) -> Option<Graph> {
    let mut out = Node::new(soul.clone());
    for field in node.stated_fields() {
        if !selector.matches(field) {
            continue;
        }
        let Some(state) = node.state(field) else {
            continue;
        };
        let value = node.value(field).cloned().unwrap_or(Value::Null);
        out.set(field.clone(), value, state);
    }
    if out.is_empty() {
        return None;
    }
    Some(Graph::single(soul.clone(), out))
}
