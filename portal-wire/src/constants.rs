//! Fundamental and derived constants for the Portal overlay wire protocol.

/// Routing table replication factor (bucket width).
pub const BUCKET_SIZE: usize = 16;

/// Number of k-buckets; one per possible log2 distance.
pub const BUCKET_COUNT: usize = 256;

/// Concurrency factor for iterative lookups.
pub const LOOKUP_PARALLELISM: usize = 3;

/// Largest talk payload we hand to the discv5 session layer. Sessions add
/// their own framing, so this stays under the 1280-byte IPv6 minimum MTU.
pub const MAX_TALK_PAYLOAD: usize = 1200;

/// Overlay message framing overhead: selector byte, container offsets, and
/// the content union selector.
pub const CONTENT_FRAMING_OVERHEAD: usize = 35;

/// Largest content value that fits in a single CONTENT response. Anything
/// bigger is redirected over uTP.
pub const MAX_INLINE_CONTENT: usize = MAX_TALK_PAYLOAD - CONTENT_FRAMING_OVERHEAD;

/// Maximum encoded size of a single ENR record.
pub const MAX_ENR_SIZE: usize = 300;

/// Maximum number of ENRs in a NODES or CONTENT response list.
pub const MAX_ENRS_PER_RESPONSE: usize = 32;

/// Maximum number of content keys in a single OFFER.
pub const MAX_KEYS_PER_OFFER: usize = 64;

/// Maximum encoded size of a content key.
pub const MAX_CONTENT_KEY_SIZE: usize = 2048;

/// Maximum number of distances in a FINDNODES request.
pub const MAX_FINDNODES_DISTANCES: usize = 256;

/// Pre-merge epoch length: header records per epoch accumulator.
pub const EPOCH_SIZE: u64 = 8192;

/// Slots per historical root period (post-merge header proofs).
pub const SLOTS_PER_HISTORICAL_ROOT: u64 = 8192;
