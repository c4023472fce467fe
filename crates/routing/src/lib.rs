//! XOR overlay routing.
//!
//! Peer and soul IDs are hashed with SHA-256; the XOR of two hashes,
//! compared byte-wise, is the distance between them. The
//! [`FingerTable`] groups peers into k-buckets by the length of the
//! shared hash prefix with the local node and answers next-hop queries
//! with the k peers closest to a target. Routing is next-hop selection
//! only; storage responsibility never follows the keyspace.

use sha2::{Digest, Sha256};

mod finger_table;

pub use finger_table::{AddPeerError, FingerTable, FingerTableStats, Peer, BUCKET_SIZE, DEFAULT_CLOSEST};

/// Width of an ID hash in bytes.
pub const HASH_LEN: usize = 32;

/// A SHA-256 ID hash.
pub type IdHash = [u8; HASH_LEN];

/// Hash an arbitrary ID string into overlay keyspace.
#[must_use]
pub fn hash_id(id: &str) -> IdHash {
    Sha256::digest(id.as_bytes()).into()
}

/// Byte-wise XOR distance between two hashes.
#[must_use]
pub fn distance(a: &IdHash, b: &IdHash) -> IdHash {
    let mut out = [0_u8; HASH_LEN];
    for (out, (a, b)) in out.iter_mut().zip(a.iter().zip(b)) {
        *out = a ^ b;
    }
    out
}

/// Number of leading zero bits: the k-bucket index of a distance. Ranges
/// over 0..=256; 256 only for the distance to oneself.
#[must_use]
pub fn leading_zeros(d: &IdHash) -> usize {
    let mut zeros = 0;
    for &byte in d {
        if byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros() as usize;
            break;
        }
    }
    zeros
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_spread() {
        assert_eq!(hash_id("mark"), hash_id("mark"));
        assert_ne!(hash_id("mark"), hash_id("amber"));
    }

    #[test]
    fn distance_is_symmetric_and_zero_to_self() {
        let a = hash_id("a");
        let b = hash_id("b");
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), [0_u8; HASH_LEN]);
    }

    #[test]
    fn leading_zero_counting() {
        assert_eq!(leading_zeros(&[0_u8; HASH_LEN]), 256);

        let mut d = [0_u8; HASH_LEN];
        d[0] = 0b1000_0000;
        assert_eq!(leading_zeros(&d), 0);

        d[0] = 0b0000_0001;
        assert_eq!(leading_zeros(&d), 7);

        d[0] = 0;
        d[1] = 0b0100_0000;
        assert_eq!(leading_zeros(&d), 9);
    }

    #[test]
    fn triangle_of_distances_orders_peers() {
        // Closer in XOR space means a longer shared prefix.
        let target = hash_id("target");
        let near = distance(&target, &target);
        let far = distance(&target, &hash_id("elsewhere"));
        assert!(near < far);
    }
}
