//! Core data model for the mesh graph.
//!
//! Everything on the wire and on disk is expressed in terms of the types
//! defined here:
//!
//! - [`Soul`]: the globally unique ID of a node in the graph.
//! - [`Value`]: a scalar field value or a [`Relation`](Value::Relation)
//!   edge pointing at another soul.
//! - [`Node`]: a field map plus its `_` metadata record (per-field logical
//!   clocks, optional per-field signatures).
//! - [`Graph`]: a soul-keyed collection of nodes, the unit of transfer.
//! - [`Lex`]: a query selecting a node and a field, prefix or range of
//!   fields.
//! - [`WireMessage`]: the JSON envelope exchanged between peers.
//!
//! This crate is pure data: no I/O, no clocks, no crypto.

pub mod lex;
pub mod message;
pub mod node;
pub mod soul;
pub mod value;

pub use lex::{FieldSelector, Lex};
pub use message::{DecodeError, Hello, MessageId, WireMessage};
pub use node::{state_key, Graph, Node, NodeMeta};
pub use soul::{Soul, SoulKind};
pub use value::Value;

/// Per-field logical clock. Wall-clock milliseconds by convention; ordering
/// is numeric with ties broken by the lexical encoding of the values.
pub type State = f64;
