#[cfg(test)]
#[path = "tests/finger_table.rs"]
mod tests;

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::debug;

use crate::{distance, hash_id, leading_zeros, IdHash};

/// Peers kept per bucket (Kademlia K).
pub const BUCKET_SIZE: usize = 20;

/// Default fan-out of a next-hop query.
pub const DEFAULT_CLOSEST: usize = 6;

#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum AddPeerError {
    #[error("cannot add self to the finger table")]
    SelfPeer,
    #[error("bucket {0} is full")]
    BucketFull(usize),
}

/// A known peer: its stable overlay ID plus the delivery handle the
/// transport layer uses to reach it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Peer<H> {
    pub id: String,
    pub hash: IdHash,
    pub handle: H,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FingerTableStats {
    pub peers: usize,
    pub buckets: usize,
}

/// Kademlia-style routing table keyed by SHA-256 XOR distance from the
/// local node.
///
/// Buckets hold at most [`BUCKET_SIZE`] peers in arrival order; re-adding
/// a peer moves it to the back (LRU refresh), and a full bucket rejects
/// newcomers so long-lived connections are preserved. Used only for
/// next-hop selection.
#[derive(Debug)]
pub struct FingerTable<H> {
    self_id: String,
    self_hash: IdHash,
    /// Bucket index (shared-prefix length with self) -> peers, oldest
    /// first. Empty buckets are dropped.
    buckets: BTreeMap<usize, Vec<Peer<H>>>,
    /// Peer id -> bucket index.
    by_id: HashMap<String, usize>,
}

impl<H: Clone> FingerTable<H> {
    #[must_use]
    pub fn new(self_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        let self_hash = hash_id(&self_id);
        Self {
            self_id,
            self_hash,
            buckets: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Register a peer under its delivery handle. Re-adding refreshes the
    /// entry (and may replace the handle); a full bucket rejects the
    /// newcomer.
    pub fn add_peer(&mut self, id: impl Into<String>, handle: H) -> Result<(), AddPeerError> {
        let id = id.into();
        if id == self.self_id {
            return Err(AddPeerError::SelfPeer);
        }

        let _ = self.remove_peer(&id);

        let hash = hash_id(&id);
        let bucket_index = leading_zeros(&distance(&self.self_hash, &hash));
        let bucket = self.buckets.entry(bucket_index).or_default();
        if bucket.len() >= BUCKET_SIZE {
            debug!(peer = %id, bucket = bucket_index, "bucket full, peer rejected");
            return Err(AddPeerError::BucketFull(bucket_index));
        }

        bucket.push(Peer { id: id.clone(), hash, handle });
        let _ = self.by_id.insert(id, bucket_index);
        Ok(())
    }

    /// Drop a peer, returning its handle. Empties buckets are removed.
    pub fn remove_peer(&mut self, id: &str) -> Option<H> {
        let bucket_index = self.by_id.remove(id)?;
        let bucket = self.buckets.get_mut(&bucket_index)?;
        let pos = bucket.iter().position(|peer| peer.id == id)?;
        let peer = bucket.remove(pos);
        if bucket.is_empty() {
            let _ = self.buckets.remove(&bucket_index);
        }
        Some(peer.handle)
    }

    #[must_use]
    pub fn get_peer(&self, id: &str) -> Option<&Peer<H>> {
        let bucket_index = self.by_id.get(id)?;
        self.buckets
            .get(bucket_index)?
            .iter()
            .find(|peer| peer.id == id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(String::as_str)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn stats(&self) -> FingerTableStats {
        FingerTableStats {
            peers: self.by_id.len(),
            buckets: self.buckets.len(),
        }
    }

    /// The `k` known peers closest to `target` in XOR space, nearest
    /// first.
    #[must_use]
    pub fn find_closest_peers(&self, target: &str, k: usize) -> Vec<Peer<H>> {
        let target_hash = hash_id(target);
        let mut peers: Vec<(IdHash, &Peer<H>)> = self
            .buckets
            .values()
            .flatten()
            .map(|peer| (distance(&target_hash, &peer.hash), peer))
            .collect();
        peers.sort_by(|(da, pa), (db, pb)| da.cmp(db).then_with(|| pa.id.cmp(&pb.id)));
        peers.into_iter().take(k).map(|(_, peer)| peer.clone()).collect()
    }
}
