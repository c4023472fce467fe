//! The driver task: single owner of all mutable instance state.
//!
//! One spawned task per mesh instance holds the working graph, the ack
//! queue, the subscription registry, the pending-reference set, the dup
//! cache, the finger table and the store handle, and mutates them only
//! from its own loop. Commands from the public handle, transport events
//! and timer expiries are multiplexed through one `select!`; there are no
//! locks anywhere in this module.

use core::time::Duration;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mesh_crypto::{Ed25519Verifier, Keypair, Signer as _};
use mesh_ham::{mix, MixOptions, MixOutcome};
use mesh_primitives::{
    FieldSelector, Graph, Lex, MessageId, Node, Soul, SoulKind, Value, WireMessage,
};
use mesh_routing::{distance, hash_id, FingerTable, IdHash, DEFAULT_CLOSEST};
use mesh_store::{GetOptions, Store};

use crate::commands::{Command, GetResult, MeshStats, WireStats};
use crate::config::MeshConfig;
use crate::dup::Dup;
use crate::error::WireError;
use crate::listeners::Listeners;
use crate::rate_limit::{RateDecision, RateLimiter, CLEANUP_INTERVAL};
use crate::transport::{ConnectionId, Transport, TransportEvent};

/// Cooperative delay between outbound sends.
const PACING: Duration = Duration::from_millis(10);

/// An ack we are still waiting for.
#[derive(Debug)]
struct PendingGet {
    lex: Lex,
    reply: mpsc::UnboundedSender<GetResult>,
    deadline: Instant,
    /// Set once disk or network answered; a timeout then expires the
    /// entry silently instead of reporting "not found".
    answered: bool,
}

#[derive(Debug)]
enum Route {
    /// Reply path: straight back to one connection.
    Direct(ConnectionId),
    /// Forward path: toward the peers XOR-closest to a soul, never back
    /// to the connection the message came in on.
    Soul {
        soul: Soul,
        exclude: Option<ConnectionId>,
    },
}

#[derive(Debug)]
struct Outbound {
    frame: String,
    route: Route,
    /// The pending GET to fail if this frame cannot be sent at all.
    origin: Option<MessageId>,
}

/// Where a change-graph came from, which decides filtering and listener
/// firing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChangeOrigin {
    /// A local `put` call: unfiltered, fires listeners.
    Local,
    /// Inbound wire data: subscription-filtered, fires listeners.
    Wire,
    /// Re-read from our own store: unfiltered, listeners stay quiet.
    Disk,
    /// A deferred write whose moment arrived.
    Deferred,
}

pub(crate) struct Driver {
    config: MeshConfig,
    identity: Option<Keypair>,
    /// Stable overlay id: the identity's public key, or a random token.
    peer_id: String,
    self_hash: IdHash,

    graph: Graph,
    store: Store,
    dup: Dup,
    listeners: Listeners,
    /// Souls seen as relation targets of accepted writes (or locally
    /// requested), eligible for storage without an explicit subscription.
    pending_refs: HashSet<Soul>,
    finger: FingerTable<ConnectionId>,
    /// Transport connection -> peer id, from HELLO.
    conn_peers: HashMap<ConnectionId, String>,
    queue: HashMap<MessageId, PendingGet>,
    rate: RateLimiter,

    outbox: VecDeque<Outbound>,
    last_send: Option<Instant>,

    deferred: Graph,
    deferred_at: Option<Instant>,

    transports: Vec<Arc<dyn Transport>>,
    stats: WireStats,

    /// Wall-clock anchor so logical time follows the tokio clock (and
    /// pauses with it under test).
    wall_origin_ms: f64,
    anchor: Instant,
    last_cleanup: Instant,
}

impl Driver {
    pub(crate) fn new(
        config: MeshConfig,
        store: Store,
        transports: Vec<Arc<dyn Transport>>,
        identity: Option<Keypair>,
    ) -> Self {
        let peer_id = identity.as_ref().map_or_else(
            || {
                let mut bytes = [0_u8; 16];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
                hex::encode(bytes)
            },
            Keypair::public_key,
        );
        let self_hash = hash_id(&peer_id);
        let wall_origin_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0);

        let max_age = config.max_age;
        Self {
            config,
            identity,
            peer_id: peer_id.clone(),
            self_hash,
            graph: Graph::new(),
            store,
            dup: Dup::new(max_age),
            listeners: Listeners::new(),
            pending_refs: HashSet::new(),
            finger: FingerTable::new(peer_id),
            conn_peers: HashMap::new(),
            queue: HashMap::new(),
            rate: RateLimiter::new(),
            outbox: VecDeque::new(),
            last_send: None,
            deferred: Graph::new(),
            deferred_at: None,
            transports,
            stats: WireStats::default(),
            wall_origin_ms,
            anchor: Instant::now(),
            last_cleanup: Instant::now(),
        }
    }

    /// Logical wall clock in milliseconds, anchored to the tokio clock.
    fn now_ms(&self) -> f64 {
        self.wall_origin_ms + self.anchor.elapsed().as_secs_f64() * 1000.0
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!(peer = %self.peer_id, "mesh instance started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                maybe_cmd = commands.recv() => match maybe_cmd {
                    Some(Command::Shutdown { outcome }) => {
                        let _ = outcome.send(self.shutdown().await);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        let _ = self.shutdown().await;
                        break;
                    }
                },
                maybe_ev = events.recv() => {
                    if let Some(ev) = maybe_ev {
                        self.handle_event(ev).await;
                    }
                },
                () = sleep_until_opt(deadline) => self.handle_timers().await,
            }
        }
        info!(peer = %self.peer_id, "mesh instance stopped");
    }

    async fn shutdown(&mut self) -> Result<(), WireError> {
        for transport in &self.transports {
            for conn in transport.connections() {
                transport.disconnect(conn).await;
            }
        }
        self.store.flush().await.map_err(WireError::from)
    }

    // ---- timers ---------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |at: Instant| {
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        };

        for pending in self.queue.values() {
            consider(pending.deadline);
        }
        if let Some(at) = self.deferred_at {
            consider(at);
        }
        if let Some(at) = self.dup.sweep_deadline() {
            consider(Instant::from_std(at));
        }
        if let Some(at) = self.store.flush_deadline() {
            consider(Instant::from_std(at));
        }
        if !self.outbox.is_empty() {
            consider(self.last_send.map_or_else(Instant::now, |at| at + PACING));
        }
        if !self.config.test_env {
            consider(self.last_cleanup + CLEANUP_INTERVAL);
        }
        deadline
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        // Expired GETs answer "not found" unless something already spoke.
        let expired: Vec<MessageId> = self
            .queue
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = self.queue.remove(&id) {
                if !pending.answered {
                    let _ = pending.reply.send(Ok(null_graph(&pending.lex)));
                }
            }
        }

        if self.deferred_at.is_some_and(|at| at <= now) {
            self.deferred_at = None;
            let retry = core::mem::take(&mut self.deferred);
            debug!(souls = retry.len(), "retrying deferred writes");
            let _ = self.apply_change(&retry, ChangeOrigin::Deferred).await;
        }

        if self
            .dup
            .sweep_deadline()
            .is_some_and(|at| Instant::from_std(at) <= now)
        {
            self.dup.sweep();
        }

        if self
            .store
            .flush_deadline()
            .is_some_and(|at| Instant::from_std(at) <= now)
        {
            if let Err(err) = self.store.flush().await {
                warn!(%err, "store flush failed");
            }
        }

        if !self.outbox.is_empty()
            && self.last_send.map_or(true, |at| at + PACING <= now)
        {
            self.send_next().await;
            self.last_send = Some(now);
        }

        if !self.config.test_env && self.last_cleanup + CLEANUP_INTERVAL <= now {
            self.rate.cleanup(std::time::Instant::now());
            self.last_cleanup = now;
        }
    }

    // ---- commands -------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Get { lex, wait, reply } => self.handle_get(lex, wait, reply).await,
            Command::Put { graph, outcome } => {
                let _ = outcome.send(self.handle_put(graph).await);
            }
            Command::On {
                lex,
                fetch,
                sender,
                outcome,
            } => {
                if fetch {
                    // Warm the graph from disk and ask the network; then
                    // prime this subscriber with whatever is already held.
                    // Later network answers reach it through the registry.
                    let (tx, _rx) = mpsc::unbounded_channel();
                    self.handle_get(lex.clone(), None, tx).await;
                    if let Some(found) = mesh_ham::get(&lex, &self.graph, false) {
                        let _ = sender.send(found);
                    }
                }
                let id = self.listeners.on(lex.soul.clone(), lex.field.clone(), sender);
                let _ = self.pending_refs.insert(lex.soul);
                let _ = outcome.send(id);
            }
            Command::Off { soul, id, outcome } => {
                self.listeners.off(&soul, id);
                let _ = outcome.send(());
            }
            Command::Stats { outcome } => {
                let _ = outcome.send(MeshStats {
                    wire: self.stats,
                    dup: self.dup.stats(),
                    store: self.store.stats(),
                    finger: self.finger.stats(),
                    graph_souls: self.graph.len(),
                    pending_gets: self.queue.len(),
                    outbox: self.outbox.len(),
                });
            }
            Command::Shutdown { .. } => unreachable!("shutdown is handled by the loop"),
        }
    }

    async fn handle_get(
        &mut self,
        lex: Lex,
        wait: Option<Duration>,
        reply: mpsc::UnboundedSender<GetResult>,
    ) {
        // Whatever comes back for this soul is welcome from now on.
        let _ = self.pending_refs.insert(lex.soul.clone());

        if let Some(found) = mesh_ham::get(&lex, &self.graph, false) {
            let _ = reply.send(Ok(found));
            return;
        }

        // Ask the network...
        let msg = WireMessage::get(lex.clone());
        let id = msg.id.clone();
        self.dup.track(id.clone());
        let deadline = Instant::now() + wait.unwrap_or(self.config.wait);
        let _ = self.queue.insert(
            id.clone(),
            PendingGet {
                lex: lex.clone(),
                reply,
                deadline,
                answered: false,
            },
        );
        self.enqueue(Outbound {
            frame: msg.encode(),
            route: Route::Soul {
                soul: lex.soul.clone(),
                exclude: None,
            },
            origin: Some(id.clone()),
        });

        // ...and the disk in parallel. A hit is merged into the working
        // graph (without firing listeners) and answered immediately; the
        // network may still answer with fresher data afterwards.
        match self.store.get(&lex, GetOptions::default()).await {
            Ok(Some(stored)) => {
                let _ = self.apply_change(&stored, ChangeOrigin::Disk).await;
                if let Some(found) = mesh_ham::get(&lex, &self.graph, false) {
                    if let Some(pending) = self.queue.get_mut(&id) {
                        pending.answered = true;
                        let _ = pending.reply.send(Ok(found));
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "store read failed");
                if let Some(pending) = self.queue.remove(&id) {
                    let _ = pending.reply.send(Err(err.into()));
                }
            }
        }
    }

    async fn handle_put(&mut self, change: Graph) -> Result<(), WireError> {
        let change = self.sign_own_souls(change);

        // Anti-spoofing: an already-stored user soul must keep its key.
        for (soul, _) in &change {
            if let SoulKind::User { pub_key } = soul.kind() {
                if let Some(stored) = self.stored_pub(soul).await? {
                    if stored != pub_key {
                        return Err(WireError::PubMismatch { soul: soul.clone() });
                    }
                }
            }
        }

        let outcome = self.apply_change(&change, ChangeOrigin::Local).await?;
        if outcome.accepted.is_empty() {
            return Ok(());
        }

        let msg = WireMessage::put(outcome.accepted.clone());
        self.dup.track(msg.id.clone());
        let target = outcome
            .accepted
            .first_soul()
            .cloned()
            .unwrap_or_else(|| Soul::from(""));
        self.enqueue(Outbound {
            frame: msg.encode(),
            route: Route::Soul {
                soul: target,
                exclude: None,
            },
            origin: None,
        });
        Ok(())
    }

    /// The `pub` field the graph or store already holds for a user soul.
    async fn stored_pub(&mut self, soul: &Soul) -> Result<Option<String>, WireError> {
        if let Some(Value::String(held)) = self
            .graph
            .get(soul)
            .and_then(|node| node.value("pub"))
        {
            return Ok(Some(held.clone()));
        }
        let lex = Lex::field(soul.clone(), "pub");
        if let Some(stored) = self.store.get(&lex, GetOptions::default()).await? {
            if let Some(Value::String(held)) =
                stored.get(soul).and_then(|node| node.value("pub"))
            {
                return Ok(Some(held.clone()));
            }
        }
        Ok(None)
    }

    /// Sign unsigned fields of our own user soul before merging.
    fn sign_own_souls(&self, mut change: Graph) -> Graph {
        let Some(identity) = &self.identity else {
            return change;
        };
        let own = Soul::from(identity.soul());
        if let Some(node) = change.get_mut(&own) {
            let fields: Vec<String> = node.stated_fields().cloned().collect();
            for field in fields {
                let Some(state) = node.state(&field) else {
                    continue;
                };
                if node.sig(state).is_some() {
                    continue;
                }
                let value = node.value(&field).cloned().unwrap_or(Value::Null);
                node.sign(state, identity.sign(&value, state));
            }
        }
        change
    }

    /// Merge a change through HAM, persist what was accepted, fire
    /// listeners and schedule deferred retries.
    async fn apply_change(
        &mut self,
        change: &Graph,
        origin: ChangeOrigin,
    ) -> Result<MixOutcome, WireError> {
        let keep = self.listeners.souls();
        let mut opts = MixOptions::new(self.now_ms(), &keep);
        // Secure mode rejects unsigned public souls: always for wire
        // data, for local puts only when no user identity is attached.
        // Disk re-reads and already-vetted deferrals pass through.
        opts.secure = self.config.secure
            && match origin {
                ChangeOrigin::Local => self.identity.is_none(),
                ChangeOrigin::Wire => true,
                ChangeOrigin::Disk | ChangeOrigin::Deferred => false,
            };
        opts.max_graph = self.config.max_graph;
        let outcome = mix(change, &mut self.graph, &Ed25519Verifier, &opts);

        // Accepted relation targets become pending references so graph
        // walks converge without explicit subscriptions.
        for (_, node) in &outcome.accepted {
            for (_, value) in node.fields() {
                if let Some(target) = value.relation() {
                    let _ = self.pending_refs.insert(target.clone());
                }
            }
        }

        if !outcome.accepted.is_empty() && origin != ChangeOrigin::Disk {
            self.store.put(&outcome.accepted).await?;
            self.listeners.fire(&outcome.accepted);
        }

        if !outcome.deferred.is_empty() {
            for (soul, node) in &outcome.deferred {
                for field in node.stated_fields() {
                    let Some(state) = node.state(field) else {
                        continue;
                    };
                    let value = node.value(field).cloned().unwrap_or(Value::Null);
                    let sig = node.sig(state).map(str::to_owned);
                    let target = self.deferred.entry(soul);
                    target.set(field.clone(), value, state);
                    if let Some(sig) = sig {
                        target.sign(state, sig);
                    }
                }
            }
            if let Some(wait_ms) = outcome.wait_ms {
                let at = Instant::now() + Duration::from_secs_f64(wait_ms / 1000.0);
                self.deferred_at = Some(self.deferred_at.map_or(at, |held| held.min(at)));
            }
        }

        Ok(outcome)
    }

    // ---- transport events ----------------------------------------------

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn } => {
                debug!(conn, "transport connected, sending hello");
                let msg = WireMessage::hello(self.peer_id.clone());
                self.dup.track(msg.id.clone());
                self.enqueue(Outbound {
                    frame: msg.encode(),
                    route: Route::Direct(conn),
                    origin: None,
                });
            }
            TransportEvent::Disconnected { conn } => {
                if let Some(peer_id) = self.conn_peers.remove(&conn) {
                    let _ = self.finger.remove_peer(&peer_id);
                    info!(conn, peer = %peer_id, "peer disconnected");
                }
                self.rate.remove(conn);

                // Best effort: with no links left, outstanding GETs can
                // only ever time out, so fail them now.
                if self.transports.iter().all(|t| t.connections().is_empty()) {
                    for (_, pending) in self.queue.drain() {
                        if !pending.answered {
                            let _ = pending.reply.send(Err(WireError::ConnectionClosed));
                        }
                    }
                }
            }
            TransportEvent::Message { conn, frame } => self.handle_frame(conn, frame).await,
        }
    }

    async fn handle_frame(&mut self, conn: ConnectionId, frame: String) {
        if frame.len() > self.config.max_frame_bytes {
            self.stats.dropped_oversize += 1;
            warn!(conn, bytes = frame.len(), "oversize frame dropped");
            return;
        }

        match self.rate.check(conn, std::time::Instant::now()) {
            RateDecision::Allow => {}
            RateDecision::Throttle { delay } => {
                self.stats.throttled += 1;
                tokio::time::sleep(delay).await;
            }
            RateDecision::Disconnect => {
                self.stats.throttled += 1;
                for transport in &self.transports {
                    transport.disconnect(conn).await;
                }
                return;
            }
        }

        let Ok(msg) = WireMessage::decode(&frame) else {
            self.stats.dropped_malformed += 1;
            debug!(conn, "malformed frame dropped");
            return;
        };

        if self.dup.check(&msg.id) {
            self.stats.dropped_dup += 1;
            return;
        }
        self.dup.track(msg.id.clone());
        self.stats.messages_in += 1;

        if let Some(hello) = &msg.hello {
            let _ = self.conn_peers.insert(conn, hello.peer_id.clone());
            match self.finger.add_peer(hello.peer_id.clone(), conn) {
                Ok(()) => info!(conn, peer = %hello.peer_id, "peer joined"),
                Err(err) => debug!(conn, peer = %hello.peer_id, %err, "peer not added"),
            }
        }

        if let Some(lex) = msg.get.clone() {
            self.handle_wire_get(conn, &msg.id, lex).await;
        }

        if let Some(put) = msg.put.clone() {
            self.handle_wire_put(conn, &msg, put).await;
        }

        if let Some(reply_to) = &msg.reply_to {
            if let Some(mut pending) = self.queue.remove(reply_to) {
                let result = match (&msg.err, &msg.put) {
                    (Some(err), _) => Err(WireError::Remote(err.clone())),
                    (None, Some(_)) => {
                        // The ack data went through the merge above; answer
                        // from the graph so the caller sees the resolved
                        // view.
                        Ok(mesh_ham::get(&pending.lex, &self.graph, true)
                            .unwrap_or_else(|| null_graph(&pending.lex)))
                    }
                    (None, None) => Ok(null_graph(&pending.lex)),
                };
                pending.answered = true;
                let _ = pending.reply.send(result);
            }
        }
    }

    async fn handle_wire_get(&mut self, conn: ConnectionId, reply_to: &MessageId, lex: Lex) {
        let found = match mesh_ham::get(&lex, &self.graph, false) {
            Some(found) => Some(found),
            None => {
                match self
                    .store
                    .get(&lex, GetOptions { secure: true })
                    .await
                {
                    Ok(found) => found,
                    Err(err) => {
                        let ack =
                            WireMessage::ack(reply_to, None, Some(err.to_string()));
                        self.dup.track(ack.id.clone());
                        self.enqueue(Outbound {
                            frame: ack.encode(),
                            route: Route::Direct(conn),
                            origin: None,
                        });
                        return;
                    }
                }
            }
        };

        let body = found.unwrap_or_else(|| null_graph(&lex));
        let ack = WireMessage::ack(reply_to, Some(body), None);
        self.dup.track(ack.id.clone());
        self.enqueue(Outbound {
            frame: ack.encode(),
            route: Route::Direct(conn),
            origin: None,
        });
    }

    /// Whether this peer is willing to store writes for `soul`.
    fn subscribed(&self, soul: &Soul) -> bool {
        self.graph.contains(soul)
            || self.pending_refs.contains(soul)
            || self.listeners.contains(soul)
    }

    async fn handle_wire_put(&mut self, conn: ConnectionId, msg: &WireMessage, put: Graph) {
        // First pass: subscribed souls donate their relation targets, so
        // edges walked from known data become acceptable in the same
        // message.
        for (soul, node) in &put {
            if !self.subscribed(soul) {
                continue;
            }
            for (_, value) in node.fields() {
                if let Some(target) = value.relation() {
                    let _ = self.pending_refs.insert(target.clone());
                }
            }
        }

        // Second pass: the subscription filter proper.
        let filtered: Graph = put
            .iter()
            .filter(|(soul, _)| self.subscribed(soul))
            .map(|(soul, node)| (soul.clone(), node.clone()))
            .collect();

        if !filtered.is_empty() {
            if let Err(err) = self.apply_change(&filtered, ChangeOrigin::Wire).await {
                warn!(%err, "inbound put failed to persist");
            }
        }

        // Non-subscribed data is not stored here, but the message still
        // travels onward. Replies (acks) are not re-forwarded.
        if msg.reply_to.is_none() {
            if let Some(target) = put.first_soul() {
                self.stats.forwarded += 1;
                self.enqueue(Outbound {
                    frame: msg.encode(),
                    route: Route::Soul {
                        soul: target.clone(),
                        exclude: Some(conn),
                    },
                    origin: None,
                });
            }

            let ack = WireMessage::ack(&msg.id, None, None);
            self.dup.track(ack.id.clone());
            self.enqueue(Outbound {
                frame: ack.encode(),
                route: Route::Direct(conn),
                origin: None,
            });
        }
    }

    // ---- outbound -------------------------------------------------------

    fn enqueue(&mut self, outbound: Outbound) {
        if self.outbox.len() >= self.config.max_queue_length {
            warn!("outbound queue full, dropping message");
            if let Some(origin) = outbound.origin {
                if let Some(pending) = self.queue.remove(&origin) {
                    let _ = pending.reply.send(Err(WireError::QueueFull));
                }
            }
            return;
        }
        self.outbox.push_back(outbound);
    }

    async fn send_next(&mut self) {
        let Some(outbound) = self.outbox.pop_front() else {
            return;
        };

        let sent = match &outbound.route {
            Route::Direct(conn) => self.send_to(*conn, &outbound.frame).await,
            Route::Soul { soul, exclude } => {
                self.send_routed(soul, &outbound.frame, *exclude).await
            }
        };

        if sent {
            self.stats.messages_out += 1;
            return;
        }

        // Offline (no connections anywhere) is not an error: a pending
        // GET falls through to its timeout and answers "not found". Only
        // a failed send while online is surfaced to the caller.
        let online = self
            .transports
            .iter()
            .any(|transport| !transport.connections().is_empty());
        if online {
            if let Some(origin) = outbound.origin {
                if let Some(pending) = self.queue.remove(&origin) {
                    let _ = pending.reply.send(Err(WireError::NoPeers));
                }
            }
        }
    }

    async fn send_to(&self, conn: ConnectionId, frame: &str) -> bool {
        for transport in &self.transports {
            if transport.send(conn, frame.to_owned()).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Send toward the peers strictly closer to the target than we are;
    /// fall back to broadcast when no such peer is known.
    async fn send_routed(&self, soul: &Soul, frame: &str, exclude: Option<ConnectionId>) -> bool {
        let target_hash = hash_id(soul.as_str());
        let own_distance = distance(&self.self_hash, &target_hash);

        let closer: Vec<ConnectionId> = self
            .finger
            .find_closest_peers(soul.as_str(), DEFAULT_CLOSEST)
            .into_iter()
            .filter(|peer| distance(&peer.hash, &target_hash) < own_distance)
            .map(|peer| peer.handle)
            .filter(|conn| Some(*conn) != exclude)
            .collect();

        if closer.is_empty() {
            return self.send_broadcast(frame, exclude).await;
        }

        let mut sent = false;
        for conn in closer {
            sent |= self.send_to(conn, frame).await;
        }
        sent
    }

    async fn send_broadcast(&self, frame: &str, exclude: Option<ConnectionId>) -> bool {
        let mut sent = false;
        for transport in &self.transports {
            let conns = transport.connections();
            if conns.iter().any(|conn| Some(*conn) != exclude) {
                transport.broadcast(frame.to_owned(), exclude).await;
                sent = true;
            }
        }
        sent
    }
}

/// The "not found" reply shape: the soul with the requested field (when
/// one was named) carried as a bare null.
fn null_graph(lex: &Lex) -> Graph {
    let mut node = Node::new(lex.soul.clone());
    if let FieldSelector::Exact(field) = &lex.field {
        node.set_value(field.clone(), Value::Null);
    }
    Graph::single(lex.soul.clone(), node)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
