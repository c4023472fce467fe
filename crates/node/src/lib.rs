//! The mesh wire driver: a peer-to-peer, offline-first graph database
//! node.
//!
//! A [`Mesh`] instance binds the conflict-resolution engine, the radix
//! file store, the wire protocol and the XOR overlay routing table into
//! one unit:
//!
//! ```text
//! application
//!      │  get / put / on / off        (Command over a channel)
//!      ▼
//! ┌──────────────────────────────────────────────┐
//! │ driver task (sole owner of all mutable state)│
//! │   graph ── HAM merge ── store (radisk files) │
//! │   dup · rate limiter · listeners · queue     │
//! │   finger table ── outbound routing           │
//! └──────────────────────────────────────────────┘
//!      ▲  TransportEvent                │ frames
//!      └────────── transports ──────────┘
//! ```
//!
//! Inbound frames are deduplicated, rate-limited, parsed and dispatched
//! as GET (answered from the graph, else the store) or PUT (subscription
//! filtered, merged, persisted, forwarded). Local `put`s travel the same
//! path. Outbound messages drain through a paced FIFO and are routed to
//! the XOR-closest known peers, falling back to broadcast.

use core::time::Duration;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use mesh_crypto::Keypair;
use mesh_primitives::{Graph, Lex, Soul};
use mesh_store::Store;

pub mod commands;
pub mod config;
pub mod dup;
pub mod error;
pub mod listeners;
pub mod rate_limit;
pub mod transport;

mod driver;

pub use commands::{GetResult, MeshStats, WireStats};
pub use config::MeshConfig;
pub use error::WireError;
pub use listeners::SubscriptionId;
pub use transport::{ConnectionId, Transport, TransportError, TransportEvent};

use commands::Command;
use driver::Driver;

/// A live subscription: the id to cancel with plus the update stream.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub updates: mpsc::UnboundedReceiver<Graph>,
}

/// Handle to one mesh instance.
///
/// Cheap to clone; all methods forward to the driver task and await its
/// answer. Dropping every handle shuts the driver down.
#[derive(Clone, Debug)]
pub struct Mesh {
    commands: mpsc::UnboundedSender<Command>,
}

impl Mesh {
    /// Open the store and spawn the driver task.
    ///
    /// `events` is the receiving half of the channel the `transports`
    /// report into; the caller keeps the sending half (and hands it to
    /// any transport it wires up later).
    pub async fn spawn(
        config: MeshConfig,
        transports: Vec<Arc<dyn Transport>>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        identity: Option<Keypair>,
    ) -> Result<(Self, JoinHandle<()>), WireError> {
        let store = Store::open(config.radisk_options()).await?;
        let driver = Driver::new(config, store, transports, identity);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(commands_rx, events));

        Ok((Self { commands: commands_tx }, task))
    }

    /// Resolve a lex: the in-memory graph answers synchronously, the
    /// store and the network answer as they come, and silence answers as
    /// a null-valued subgraph after the configured `wait`.
    ///
    /// This returns the first answer; use [`Mesh::get_stream`] to observe
    /// the later ones too.
    pub async fn get(&self, lex: Lex) -> GetResult {
        let mut replies = self.get_stream(lex, None);
        replies.recv().await.unwrap_or(Err(WireError::Closed))
    }

    /// Like [`Mesh::get`] with an explicit timeout.
    pub async fn get_with_wait(&self, lex: Lex, wait: Duration) -> GetResult {
        let mut replies = self.get_stream(lex, Some(wait));
        replies.recv().await.unwrap_or(Err(WireError::Closed))
    }

    /// All answers to one GET: disk, then network, then (absent both) the
    /// timeout null.
    #[must_use]
    pub fn get_stream(
        &self,
        lex: Lex,
        wait: Option<Duration>,
    ) -> mpsc::UnboundedReceiver<GetResult> {
        let (reply, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Get { lex, wait, reply });
        rx
    }

    /// Merge a change-graph locally, persist it and announce it to the
    /// network. Historical writes vanish silently; an accepted write to a
    /// user-owned soul that spoofs an existing key errors.
    pub async fn put(&self, graph: Graph) -> Result<(), WireError> {
        let (outcome, rx) = oneshot::channel();
        self.commands
            .send(Command::Put { graph, outcome })
            .map_err(|_| WireError::Closed)?;
        rx.await.map_err(|_| WireError::Closed)?
    }

    /// Subscribe to accepted writes matching `lex`. With `fetch`, the
    /// subscription is primed with whatever data already exists.
    pub async fn on(&self, lex: Lex, fetch: bool) -> Result<Subscription, WireError> {
        let (sender, updates) = mpsc::unbounded_channel();
        let (outcome, rx) = oneshot::channel();
        self.commands
            .send(Command::On {
                lex,
                fetch,
                sender,
                outcome,
            })
            .map_err(|_| WireError::Closed)?;
        let id = rx.await.map_err(|_| WireError::Closed)?;
        Ok(Subscription { id, updates })
    }

    /// Remove one subscription on the soul, or all of them.
    pub async fn off(&self, soul: Soul, id: Option<SubscriptionId>) -> Result<(), WireError> {
        let (outcome, rx) = oneshot::channel();
        self.commands
            .send(Command::Off { soul, id, outcome })
            .map_err(|_| WireError::Closed)?;
        rx.await.map_err(|_| WireError::Closed)
    }

    /// A point-in-time snapshot of the instance counters.
    pub async fn stats(&self) -> Result<MeshStats, WireError> {
        let (outcome, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { outcome })
            .map_err(|_| WireError::Closed)?;
        rx.await.map_err(|_| WireError::Closed)
    }

    /// Flush the store, close the transports and stop the driver.
    pub async fn shutdown(&self) -> Result<(), WireError> {
        let (outcome, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { outcome })
            .map_err(|_| WireError::Closed)?;
        rx.await.map_err(|_| WireError::Closed)?
    }
}
