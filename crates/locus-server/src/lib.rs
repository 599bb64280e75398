//! The Locus directory server.
//!
//! Each server is the authority for a set of bit-prefix intervals of
//! the Hilbert curve. The partition table maps every interval to its
//! authority (this process or a peer), locally owned intervals index
//! their clients in a Hilbert R-tree, and the session layer translates
//! inbound RPCs into table operations while enforcing the peer's role.

pub mod config;
pub mod search;
pub mod server;
pub mod session;
pub mod table;

pub use config::ServerConfig;
pub use server::Server;
