//! Local graph query: resolve a lex against the in-memory graph.

use mesh_primitives::{Graph, Lex, Node, Value};

/// Resolve `lex` against `graph`.
///
/// Returns the matching subgraph with its state map restricted to the
/// selected fields, or `None` when the graph lacks the requested soul or
/// field. With `fast` set, a present soul answers even when none of the
/// requested fields are held yet, so callers can show partial data while
/// the rest arrives.
#[must_use]
pub fn get(lex: &Lex, graph: &Graph, fast: bool) -> Option<Graph> {
    let node = graph.get(&lex.soul)?;

    let mut out = Node::new(lex.soul.clone());
    for field in node.stated_fields() {
        if !lex.field.matches(field) {
            continue;
        }
        let Some(state) = node.state(field) else {
            continue;
        };
        // Stated-but-valueless fields are tombstones and read as null.
        let value = node.value(field).cloned().unwrap_or(Value::Null);
        out.set(field.clone(), value, state);
    }

    if out.is_empty() && !fast {
        return None;
    }
    Some(Graph::single(lex.soul.clone(), out))
}
