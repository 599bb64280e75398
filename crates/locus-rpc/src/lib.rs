//! RPC layer for Locus.
//!
//! Every message is a request or a reply on a persistent TCP
//! connection:
//! - Requests carry an opcode, a correlation id, a target object id,
//!   and a length-prefixed payload.
//! - Replies echo the correlation id with the high opcode bit set and
//!   carry a numeric error code (zero for success).
//!
//! The peer layer pairs replies with outstanding requests by
//! correlation id; a dropped connection completes every outstanding
//! request with `Unreachable`. Inbound requests are decoded and handed
//! to the [`Dispatcher`] installed on the context.

mod context;
mod frame;
mod message;
mod opcode;
mod peer;
pub mod wire;

pub use context::{Dispatcher, RpcContext};
pub use frame::{Frame, REPLY_FLAG};
pub use message::{RegistrationResult, LocationResult, Reply, Request};
pub use opcode::Opcode;
pub use peer::Peer;
