use thiserror::Error;

use mesh_primitives::Soul;
use mesh_store::StoreError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("peer reported: {0}")]
    Remote(String),

    #[error("no peers to route the message to")]
    NoPeers,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("soul {soul} already belongs to a different key")]
    PubMismatch { soul: Soul },

    #[error("transport connection closed")]
    ConnectionClosed,

    #[error("mesh instance is shut down")]
    Closed,
}
