//! Shared constants for Locus.

/// Default TCP port for servers and clients.
pub const DEFAULT_PORT: u16 = 7777;

/// Well-known object id of the master object every peer exports.
pub const MASTER_OBJECT_ID: u64 = 1;

/// Maximum payload size of a single wire message.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Size of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 20;

/// Size of a node identifier in bits.
pub const NODE_ID_BITS: u8 = (NODE_ID_LEN * 8) as u8;

/// Bits of precision in the fixed-point encoding of one coordinate axis.
pub const FIXPOINT_BITS: u32 = 52;

/// Highest supported curve resolution (both axes at full fixed-point
/// precision).
pub const MAX_RESOLUTION: u8 = (2 * FIXPOINT_BITS) as u8;

/// Default curve resolution for new servers.
pub const DEFAULT_RESOLUTION: u8 = 64;

/// Maximum entries per R-tree node.
pub const RTREE_MAX_ENTRIES: usize = 5;

/// Client count above which a local range is split during load balancing.
pub const LOAD_THRESHOLD: usize = 5000;

/// How many times a client retries registration before giving up.
pub const MAX_REGISTRATION_RETRIES: u32 = 5;
