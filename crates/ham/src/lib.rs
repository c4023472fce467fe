//! HAM, the conflict-resolution engine.
//!
//! Every field of every node carries a logical clock (its *state*). Merge
//! is per field: the newer state wins, older states are historical and
//! rejected, and equal states fall back to a deterministic lexical
//! comparison of the value encodings so every honest peer picks the same
//! winner. Writes dated in the future are deferred until their moment
//! (up to a 24 hour horizon, past which they are dropped), user-owned
//! souls are validated on the way in, and the in-memory graph is bounded
//! by evicting the souls with the smallest newest state.
//!
//! [`mix`] is a pure function over explicit inputs (change, graph, clock,
//! options); the surrounding node feeds it wall-clock time and replays
//! the deferred graph when its moment arrives. Ill-shaped changes are
//! unrepresentable in the typed [`Graph`], so merging has no validation
//! failure mode; the only silent skips are the documented rejections.

use std::collections::HashSet;

use tracing::{debug, trace};

use mesh_crypto::Verifier;
use mesh_primitives::{Graph, Node, Soul, SoulKind, State, Value};

pub mod query;

pub use query::get;

/// Upper bound on the in-memory graph, in souls.
pub const MAX_GRAPH_SIZE: usize = 10_000;

/// Writes dated further than this past `now` are dropped outright.
pub const MAX_FUTURE_DRIFT_MS: f64 = 86_400_000.0;

/// Outcome of the pairwise per-field rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Merge {
    /// The incoming write is older than what we hold; reject it.
    Historical,
    /// Same state, same value; nothing to do.
    Unchanged,
    /// The incoming write wins.
    Accept,
}

/// The pairwise HAM rule for one field, given the incoming and current
/// `(state, value)` pairs.
#[must_use]
pub fn merge(
    incoming_state: State,
    current_state: State,
    incoming: &Value,
    current: &Value,
) -> Merge {
    if incoming_state > current_state {
        return Merge::Accept;
    }
    if incoming_state < current_state {
        return Merge::Historical;
    }
    if incoming == current {
        return Merge::Unchanged;
    }
    // Equal clocks, different values: the lexically larger encoding wins
    // on every peer.
    if incoming.lexical() > current.lexical() {
        Merge::Accept
    } else {
        Merge::Historical
    }
}

/// Inputs that vary per [`mix`] call.
#[derive(Clone, Debug)]
pub struct MixOptions<'a> {
    /// The current wall clock in milliseconds.
    pub now: State,
    /// Secure mode: writes to unsigned public souls are rejected.
    pub secure: bool,
    /// Soul cap for the in-memory graph.
    pub max_graph: usize,
    /// Souls exempt from eviction while any non-exempt soul remains
    /// (typically those with live subscriptions).
    pub keep: &'a HashSet<Soul>,
}

impl<'a> MixOptions<'a> {
    #[must_use]
    pub fn new(now: State, keep: &'a HashSet<Soul>) -> Self {
        Self {
            now,
            secure: false,
            max_graph: MAX_GRAPH_SIZE,
            keep,
        }
    }
}

/// What a [`mix`] call did.
#[derive(Debug, Default)]
pub struct MixOutcome {
    /// The subgraph actually accepted, to be persisted and announced.
    pub accepted: Graph,
    /// Future-dated fields to retry once their moment arrives.
    pub deferred: Graph,
    /// Milliseconds until the earliest deferred field is due.
    pub wait_ms: Option<f64>,
    /// Souls evicted to keep the graph under its cap.
    pub evicted: Vec<Soul>,
}

impl MixOutcome {
    fn defer(&mut self, soul: &Soul, field: &str, node: &Node, delay_ms: f64) {
        if let Some(state) = node.state(field) {
            let sig = node.sig(state).map(str::to_owned);
            let value = node.value(field).cloned().unwrap_or(Value::Null);
            let target = self.deferred.entry(soul);
            target.set(field, value, state);
            if let Some(sig) = sig {
                target.sign(state, sig);
            }
        }
        self.wait_ms = Some(self.wait_ms.map_or(delay_ms, |w| w.min(delay_ms)));
    }
}

/// Merge a change-graph into the working graph.
///
/// Accepted fields are applied to `graph` and staged in the returned
/// [`MixOutcome::accepted`] subgraph; historical and losing writes vanish
/// silently; future-dated writes land in [`MixOutcome::deferred`]. When
/// the graph outgrows its cap, the souls whose newest state is oldest are
/// evicted (the store is unaffected).
pub fn mix(change: &Graph, graph: &mut Graph, verifier: &dyn Verifier, opts: &MixOptions<'_>) -> MixOutcome {
    let mut outcome = MixOutcome::default();

    for (soul, node) in change {
        let Some(meta) = node.meta() else {
            debug!(%soul, "node without metadata skipped");
            continue;
        };
        if meta.soul != *soul {
            debug!(%soul, claimed = %meta.soul, "metadata soul mismatch, node skipped");
            continue;
        }

        match soul.kind() {
            SoulKind::Public => {
                if opts.secure {
                    debug!(%soul, "unsigned public soul rejected in secure mode");
                    continue;
                }
            }
            SoulKind::User { pub_key } => {
                // A user node that names its own key must name it truthfully.
                if let Some(Value::String(claimed)) = node.value("pub") {
                    if claimed != pub_key {
                        debug!(%soul, claimed, "pub field does not match soul, node rejected");
                        continue;
                    }
                }
            }
            SoulKind::Alias { .. } => {}
        }

        let fields: Vec<String> = node.stated_fields().cloned().collect();
        for field in fields {
            let Some(state) = node.state(&field) else {
                continue;
            };
            let value = node.value(&field).cloned().unwrap_or(Value::Null);

            match soul.kind() {
                SoulKind::User { pub_key } => {
                    // Mutating a user-owned soul always takes a verifiable
                    // signature for the write's state, secure mode or not.
                    let Some(sig) = node.sig(state) else {
                        debug!(%soul, field, state, "no signature for state on user soul, field skipped");
                        continue;
                    };
                    if !verifier.verify(pub_key, &value, state, sig) {
                        debug!(%soul, field, state, "signature failed verification, field skipped");
                        continue;
                    }
                }
                SoulKind::Alias { .. } => {
                    // Every alias field must point at the soul it names.
                    let points_at = value.relation().map(Soul::as_str);
                    if points_at != Some(field.as_str()) {
                        debug!(%soul, field, "alias field does not self-reference, skipped");
                        continue;
                    }
                }
                SoulKind::Public => {}
            }

            if state > opts.now + MAX_FUTURE_DRIFT_MS {
                debug!(%soul, field, state, "write too far in the future, dropped");
                continue;
            }
            if state > opts.now {
                trace!(%soul, field, state, "future write deferred");
                outcome.defer(soul, &field, node, state - opts.now);
                continue;
            }

            let current = graph.get(soul).and_then(|held| {
                held.state(&field)
                    .map(|s| (s, held.value(&field).cloned().unwrap_or(Value::Null)))
            });
            let decision = match &current {
                Some((current_state, current_value)) => {
                    merge(state, *current_state, &value, current_value)
                }
                None => Merge::Accept,
            };

            match decision {
                Merge::Historical | Merge::Unchanged => {}
                Merge::Accept => {
                    let sig = node.sig(state).map(str::to_owned);
                    let held = graph.entry(soul);
                    held.set(field.as_str(), value.clone(), state);
                    // The superseded state's signature slot must not
                    // linger, or replicas that never saw the old write
                    // would diverge.
                    if let Some((prev_state, _)) = current {
                        if prev_state != state {
                            held.prune_sig(prev_state);
                        }
                    }
                    if let Some(sig) = &sig {
                        held.sign(state, sig.clone());
                    }
                    let staged = outcome.accepted.entry(soul);
                    staged.set(field.as_str(), value, state);
                    if let Some(sig) = sig {
                        staged.sign(state, sig);
                    }
                }
            }
        }
    }

    outcome.evicted = bound(graph, opts.max_graph, opts.keep);
    outcome
}

/// Evict the souls with the smallest newest state until the graph fits
/// `max` souls. Souls in `keep` survive while anything else can go.
pub fn bound(graph: &mut Graph, max: usize, keep: &HashSet<Soul>) -> Vec<Soul> {
    if graph.len() <= max {
        return Vec::new();
    }

    let mut candidates: Vec<(State, Soul)> = graph
        .iter()
        .map(|(soul, node)| {
            let newest = node
                .meta()
                .and_then(mesh_primitives::NodeMeta::max_state)
                .unwrap_or(0.0);
            (newest, soul.clone())
        })
        .collect();
    // Oldest first; ties broken by soul byte order for determinism.
    candidates.sort_by(|(sa, ka), (sb, kb)| {
        sa.partial_cmp(sb)
            .unwrap_or(core::cmp::Ordering::Equal)
            .then_with(|| ka.cmp(kb))
    });

    let mut evicted = Vec::new();
    for (_, soul) in candidates {
        if graph.len() <= max {
            break;
        }
        if keep.contains(&soul) {
            continue;
        }
        let _ = graph.remove(&soul);
        evicted.push(soul);
    }

    if !evicted.is_empty() {
        debug!(count = evicted.len(), "graph bounded, souls evicted");
    }
    evicted
}


#[cfg(test)]
mod tests_convergence;
