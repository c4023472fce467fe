//! Transport contract.
//!
//! The wire layer treats a transport as an abstract bidirectional framed
//! channel: frames are UTF-8 strings, connections are numeric delivery
//! handles, and lifecycle flows back through a [`TransportEvent`] channel
//! handed to the transport at construction. Real adapters (WebSocket,
//! WebRTC) live outside this repository; the in-memory implementation in
//! [`memory`] backs the multi-node tests.

use async_trait::async_trait;
use thiserror::Error;

/// Delivery handle for one live connection. Only meaningful to the
/// transport that issued it; peer identity comes from the HELLO
/// handshake, not from this number.
pub type ConnectionId = u64;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection {0} is not open")]
    NotConnected(ConnectionId),
    #[error("transport send failed: {0}")]
    Send(String),
}

/// Lifecycle and traffic events a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { conn: ConnectionId },
    Message { conn: ConnectionId, frame: String },
    Disconnected { conn: ConnectionId },
}

/// A bidirectional framed byte-stream factory.
///
/// Implementations must deliver frames for the same connection in send
/// order and emit [`TransportEvent::Disconnected`] exactly once per
/// closed connection.
#[async_trait]
pub trait Transport: Send + Sync + core::fmt::Debug {
    /// Deliver one frame to the remote end of `conn`.
    async fn send(&self, conn: ConnectionId, frame: String) -> Result<(), TransportError>;

    /// Deliver one frame to every live connection, minus `exclude`.
    async fn broadcast(&self, frame: String, exclude: Option<ConnectionId>);

    /// Close one connection.
    async fn disconnect(&self, conn: ConnectionId);

    /// Live connection handles, in no particular order.
    fn connections(&self) -> Vec<ConnectionId>;
}

pub mod memory {
    //! Channel-backed in-process transport for tests and simulations.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ConnectionId, Transport, TransportError, TransportEvent};

    static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

    #[derive(Debug)]
    struct Link {
        /// Event channel of the remote driver.
        remote_events: mpsc::UnboundedSender<TransportEvent>,
        /// Our connection as the remote side numbers it.
        remote_conn: ConnectionId,
    }

    /// One endpoint of any number of in-memory links.
    #[derive(Clone, Debug)]
    pub struct MemoryTransport {
        events: mpsc::UnboundedSender<TransportEvent>,
        links: Arc<Mutex<HashMap<ConnectionId, Link>>>,
    }

    impl MemoryTransport {
        /// A transport reporting into the given driver event channel.
        #[must_use]
        pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
            Self {
                events,
                links: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn install(&self, conn: ConnectionId, link: Link) {
            let _ = self
                .links
                .lock()
                .expect("memory transport lock poisoned")
                .insert(conn, link);
            let _ = self.events.send(TransportEvent::Connected { conn });
        }
    }

    /// Wire two endpoints together, emitting `Connected` on both sides.
    /// Returns the connection ids `(on_a, on_b)`.
    pub fn link(a: &MemoryTransport, b: &MemoryTransport) -> (ConnectionId, ConnectionId) {
        let conn_on_a = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
        let conn_on_b = NEXT_CONN.fetch_add(1, Ordering::Relaxed);

        a.install(
            conn_on_a,
            Link {
                remote_events: b.events.clone(),
                remote_conn: conn_on_b,
            },
        );
        b.install(
            conn_on_b,
            Link {
                remote_events: a.events.clone(),
                remote_conn: conn_on_a,
            },
        );

        (conn_on_a, conn_on_b)
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, conn: ConnectionId, frame: String) -> Result<(), TransportError> {
            let (remote_events, remote_conn) = {
                let links = self.links.lock().expect("memory transport lock poisoned");
                let link = links.get(&conn).ok_or(TransportError::NotConnected(conn))?;
                (link.remote_events.clone(), link.remote_conn)
            };

            remote_events
                .send(TransportEvent::Message {
                    conn: remote_conn,
                    frame,
                })
                .map_err(|err| TransportError::Send(err.to_string()))
        }

        async fn broadcast(&self, frame: String, exclude: Option<ConnectionId>) {
            let targets: Vec<ConnectionId> = self
                .links
                .lock()
                .expect("memory transport lock poisoned")
                .keys()
                .copied()
                .filter(|conn| Some(*conn) != exclude)
                .collect();
            for conn in targets {
                let _ = self.send(conn, frame.clone()).await;
            }
        }

        async fn disconnect(&self, conn: ConnectionId) {
            let link = self
                .links
                .lock()
                .expect("memory transport lock poisoned")
                .remove(&conn);
            if let Some(link) = link {
                let _ = link.remote_events.send(TransportEvent::Disconnected {
                    conn: link.remote_conn,
                });
                let _ = self.events.send(TransportEvent::Disconnected { conn });
            }
        }

        fn connections(&self) -> Vec<ConnectionId> {
            self.links
                .lock()
                .expect("memory transport lock poisoned")
                .keys()
                .copied()
                .collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn linked_endpoints_exchange_frames() {
            let (events_a, mut rx_a) = mpsc::unbounded_channel();
            let (events_b, mut rx_b) = mpsc::unbounded_channel();
            let a = MemoryTransport::new(events_a);
            let b = MemoryTransport::new(events_b);

            let (conn_on_a, conn_on_b) = link(&a, &b);

            // Both sides observe the connection.
            assert!(matches!(
                rx_a.recv().await,
                Some(TransportEvent::Connected { conn }) if conn == conn_on_a
            ));
            assert!(matches!(
                rx_b.recv().await,
                Some(TransportEvent::Connected { conn }) if conn == conn_on_b
            ));

            a.send(conn_on_a, "hello".to_owned())
                .await
                .expect("link is up");
            match rx_b.recv().await {
                Some(TransportEvent::Message { conn, frame }) => {
                    assert_eq!(conn, conn_on_b);
                    assert_eq!(frame, "hello");
                }
                other => panic!("expected a message, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn disconnect_notifies_both_sides() {
            let (events_a, mut rx_a) = mpsc::unbounded_channel();
            let (events_b, mut rx_b) = mpsc::unbounded_channel();
            let a = MemoryTransport::new(events_a);
            let b = MemoryTransport::new(events_b);
            let (conn_on_a, conn_on_b) = link(&a, &b);
            let _ = rx_a.recv().await;
            let _ = rx_b.recv().await;

            a.disconnect(conn_on_a).await;

            assert!(matches!(
                rx_a.recv().await,
                Some(TransportEvent::Disconnected { conn }) if conn == conn_on_a
            ));
            assert!(matches!(
                rx_b.recv().await,
                Some(TransportEvent::Disconnected { conn }) if conn == conn_on_b
            ));
            assert!(a.send(conn_on_a, "late".to_owned()).await.is_err());
        }

        #[tokio::test]
        async fn broadcast_honors_exclusions() {
            let (events_hub, _rx_hub) = mpsc::unbounded_channel();
            let (events_x, mut rx_x) = mpsc::unbounded_channel();
            let (events_y, mut rx_y) = mpsc::unbounded_channel();
            let hub = MemoryTransport::new(events_hub);
            let x = MemoryTransport::new(events_x);
            let y = MemoryTransport::new(events_y);

            let (hub_to_x, _) = link(&hub, &x);
            let _ = link(&hub, &y);
            let _ = rx_x.recv().await;
            let _ = rx_y.recv().await;

            hub.broadcast("news".to_owned(), Some(hub_to_x)).await;

            assert!(
                matches!(rx_y.recv().await, Some(TransportEvent::Message { frame, .. }) if frame == "news")
            );
            assert!(rx_x.try_recv().is_err(), "excluded link stays quiet");
        }
    }
}
