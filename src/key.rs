//! The 256-bit identifier space shared by peers and content keys.
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`derive_node_id`], [`hash_content`]
//! - **Distance Metric**: [`xor_distance`] and the totally ordered [`Distance`]
//! - **Bucket Geometry**: [`bucket_index`] and [`random_id_for_bucket`]

use std::fmt;

use rand::RngCore;

/// A 256-bit identifier for DHT nodes.
///
/// Node IDs are derived from the node's public key using BLAKE3 hashing,
/// ensuring a uniform distribution across the identifier space.
pub type NodeId = [u8; 32];

/// A 256-bit key for stored values and provider records.
///
/// Keys live in the same space as [`NodeId`]s, so "the peers responsible for a
/// key" are simply the peers whose IDs are closest to it.
pub type Key = [u8; 32];

/// Number of bits in an identifier, and therefore the maximum bucket count.
pub const ID_BITS: usize = 256;

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable 32-byte [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// Typically used to derive a node's DHT identity from its public key:
///
/// ```
/// use kadmesh::derive_node_id;
///
/// let public_key = b"example-public-key-bytes";
/// let node_id = derive_node_id(public_key);
/// assert_eq!(node_id.len(), 32);
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_digest(data)
}

/// Compute a content key as the BLAKE3 hash of arbitrary bytes.
///
/// ```
/// use kadmesh::hash_content;
///
/// let key = hash_content(b"hello world");
/// assert_eq!(key, hash_content(b"hello world"));
/// ```
pub fn hash_content(data: &[u8]) -> Key {
    blake3_digest(data)
}

/// XOR distance between two identifiers, ordered as a big-endian unsigned integer.
///
/// # Properties
/// - `xor_distance(a, a) == Distance::ZERO`
/// - `xor_distance(a, b) == xor_distance(b, a)`
/// - For a fixed reference, distinct IDs always have distinct distances.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    /// The distance from any ID to itself.
    pub const ZERO: Distance = Distance([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Number of leading zero bits, i.e. the common-prefix length of the two IDs.
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}

/// Compute the XOR distance between two identifiers.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    Distance(out)
}

/// Find the bucket index for a node ID relative to self.
///
/// The bucket index is the position of the first differing bit (0..=255).
/// Bucket 0 is the furthest half of the key space, bucket 255 the closest.
/// Identical IDs are placed in the last bucket.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    xor_distance(self_id, other).leading_zeros().min(ID_BITS - 1)
}

/// Generate a random ID whose [`bucket_index`] relative to `self_id` is `bucket_idx`.
///
/// Used by bucket refresh: looking up a random ID inside a stale bucket's
/// range repopulates that bucket with fresh peers.
pub fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(ID_BITS - 1);
    let mut distance = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut distance);

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_id[i] ^ distance[i];
    }
    target
}

/// Short hex rendering of an identifier for log fields.
pub fn short_hex(id: &[u8; 32]) -> String {
    hex::encode(&id[..8])
}
