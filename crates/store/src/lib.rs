//! Soul-to-file mapping.
//!
//! Translates graph-shaped wire data onto radisk keys. Each field of a
//! node lives at `<soul> ENQ <field>` with its state stored alongside the
//! value; the `_` metadata record is implicit (the soul is the key prefix,
//! the state map is reassembled from the cells). The state-keyed `_.s`
//! signature map of user-owned souls is kept in parallel
//! `<soul> ENQ <state> ACK s` cells so signed data can be served back out
//! verifiably.

use thiserror::Error;
use tracing::debug;

use mesh_primitives::{state_key, FieldSelector, Graph, Lex, Node, Soul, State, Value};
use mesh_radisk::{Cell, Radisk, RadiskError, RadiskOptions, RadiskStats};
use mesh_radix::Filter;

/// Separator between soul and field in a radisk key.
pub const ENQ: u8 = 0x05;

/// Suffix marking a signature cell.
const SIG_SUFFIX: &[u8] = &[0x06, b's'];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Radisk(#[from] RadiskError),
}

/// Options for [`Store::get`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    /// When set, fields of user-owned souls that carry no stored
    /// signature are withheld from the result.
    pub secure: bool,
}

/// Thin adapter between the wire data model and the radisk.
#[derive(Debug)]
pub struct Store {
    radisk: Radisk,
}

impl Store {
    pub async fn open(opts: RadiskOptions) -> Result<Self, StoreError> {
        Ok(Self {
            radisk: Radisk::open(opts).await?,
        })
    }

    #[must_use]
    pub fn stats(&self) -> RadiskStats {
        self.radisk.stats()
    }

    /// When staged writes should be flushed; `None` when clean.
    #[must_use]
    pub fn flush_deadline(&self) -> Option<std::time::Instant> {
        self.radisk.flush_deadline()
    }

    pub async fn flush(&mut self) -> Result<(), StoreError> {
        Ok(self.radisk.flush().await?)
    }

    /// Assemble the subgraph matching `lex`, or `None` when the store has
    /// nothing for it.
    pub async fn get(&mut self, lex: &Lex, opts: GetOptions) -> Result<Option<Graph>, StoreError> {
        let base = key_base(&lex.soul);

        // An exact-field lex needs only two point reads.
        if let FieldSelector::Exact(field) = &lex.field {
            let key = field_key(&lex.soul, field);
            let Some(cell) = self.radisk.read(&key).await? else {
                return Ok(None);
            };
            let sig = match cell.state {
                Some(state) => self.read_sig(&lex.soul, state).await?,
                None => None,
            };
            return Ok(self.assemble(lex, vec![(field.clone(), cell, sig)], opts));
        }

        let hits = self.radisk.range(&Filter::Prefix(&base)).await?;
        let mut fields = Vec::new();
        let mut sigs = std::collections::BTreeMap::new();
        for (key, cell) in hits {
            let rest = &key[base.len()..];
            if let Some(state) = rest.strip_suffix(SIG_SUFFIX) {
                if let (Ok(state), Value::String(sig)) =
                    (String::from_utf8(state.to_vec()), cell.value)
                {
                    let _ = sigs.insert(state, sig);
                }
                continue;
            }
            let Ok(field) = String::from_utf8(rest.to_vec()) else {
                continue;
            };
            if lex.field.matches(&field) {
                fields.push((field, cell, None));
            }
        }
        // Signatures are keyed by the state a write was made at.
        for (_, cell, sig) in &mut fields {
            if let Some(state) = cell.state {
                *sig = sigs.get(state_key(state).as_str()).cloned();
            }
        }

        Ok(self.assemble(lex, fields, opts))
    }

    fn assemble(
        &self,
        lex: &Lex,
        fields: Vec<(String, Cell, Option<String>)>,
        opts: GetOptions,
    ) -> Option<Graph> {
        let user_owned = lex.soul.is_user_owned();
        let mut node = Node::new(lex.soul.clone());
        for (field, cell, sig) in fields {
            if opts.secure && user_owned && sig.is_none() {
                debug!(soul = %lex.soul, field, "withholding unsigned field in secure read");
                continue;
            }
            let state = cell.state.unwrap_or(0.0);
            node.set(field, cell.value, state);
            if let Some(sig) = sig {
                node.sign(state, sig);
            }
        }
        if node.is_empty() {
            return None;
        }
        Some(Graph::single(lex.soul.clone(), node))
    }

    async fn read_sig(&mut self, soul: &Soul, state: State) -> Result<Option<String>, StoreError> {
        let key = sig_key(soul, state);
        Ok(self.radisk.read(&key).await?.and_then(|cell| match cell.value {
            Value::String(sig) => Some(sig),
            _ => None,
        }))
    }

    /// Persist every field (and every state's signature) of every node in
    /// the graph. Writes are batched by the radisk; flushing follows its
    /// timer.
    pub async fn put(&mut self, graph: &Graph) -> Result<(), StoreError> {
        for (soul, node) in graph {
            let Some(meta) = node.meta() else {
                continue;
            };
            for (field, state) in &meta.states {
                let key = field_key(soul, field);
                // A stated field with no value is the tombstone sentinel.
                let value = node.value(field).cloned().unwrap_or(Value::Null);
                self.radisk
                    .write(&key, Cell::stated(value, *state))
                    .await?;
            }
            for (state, sig) in &meta.sigs {
                let mut key = key_base(soul);
                key.extend_from_slice(state.as_bytes());
                key.extend_from_slice(SIG_SUFFIX);
                self.radisk
                    .write(&key, Cell::new(Value::String(sig.clone()), None))
                    .await?;
            }
        }
        Ok(())
    }
}

fn key_base(soul: &Soul) -> Vec<u8> {
    let mut base = soul.as_str().as_bytes().to_vec();
    base.push(ENQ);
    base
}

fn field_key(soul: &Soul, field: &str) -> Vec<u8> {
    let mut key = key_base(soul);
    key.extend_from_slice(field.as_bytes());
    key
}

fn sig_key(soul: &Soul, state: State) -> Vec<u8> {
    let mut key = key_base(soul);
    key.extend_from_slice(state_key(state).as_bytes());
    key.extend_from_slice(SIG_SUFFIX);
    key
}

#[cfg(test)]
mod tests;
