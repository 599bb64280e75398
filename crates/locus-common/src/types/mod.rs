//! Core types for Locus.

mod address;
mod geo;
mod node_id;
mod range;

pub use address::Address;
pub use geo::GeoPoint;
pub use node_id::NodeId;
pub use range::NodeIdRange;
