//! Commands sent from the [`Mesh`](crate::Mesh) handle to the driver
//! task.
//!
//! Each variant carries its request payload plus the channel the driver
//! answers on, so the public API stays a set of plain async methods while
//! all mutable state lives with the driver.

use core::time::Duration;

use tokio::sync::{mpsc, oneshot};

use mesh_primitives::{Graph, Lex, Soul};
use mesh_radisk::RadiskStats;
use mesh_routing::FingerTableStats;

use crate::dup::DupStats;
use crate::error::WireError;
use crate::listeners::SubscriptionId;

/// One answer to a GET. The reply channel may yield up to two of these
/// (disk, then network) before the entry times out.
pub type GetResult = Result<Graph, WireError>;

#[derive(Debug)]
pub enum Command {
    Get {
        lex: Lex,
        /// Overrides the configured `wait` timeout.
        wait: Option<Duration>,
        reply: mpsc::UnboundedSender<GetResult>,
    },
    Put {
        graph: Graph,
        outcome: oneshot::Sender<Result<(), WireError>>,
    },
    On {
        lex: Lex,
        /// Also issue a GET so the listener fires with existing data.
        fetch: bool,
        sender: mpsc::UnboundedSender<Graph>,
        outcome: oneshot::Sender<SubscriptionId>,
    },
    Off {
        soul: Soul,
        id: Option<SubscriptionId>,
        outcome: oneshot::Sender<()>,
    },
    Stats {
        outcome: oneshot::Sender<MeshStats>,
    },
    Shutdown {
        outcome: oneshot::Sender<Result<(), WireError>>,
    },
}

/// Wire-level counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub forwarded: u64,
    pub dropped_dup: u64,
    pub dropped_oversize: u64,
    pub dropped_malformed: u64,
    pub throttled: u64,
}

/// A point-in-time snapshot of one mesh instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshStats {
    pub wire: WireStats,
    pub dup: DupStats,
    pub store: RadiskStats,
    pub finger: FingerTableStats,
    pub graph_souls: usize,
    pub pending_gets: usize,
    pub outbox: usize,
}
