//! Shared foundation for Locus.
//!
//! This crate provides the types every other Locus crate builds on:
//! - [`types::NodeId`] and [`types::NodeIdRange`]: 160-bit curve
//!   identifiers and the bit-prefix interval algebra over them
//! - [`types::GeoPoint`] and [`types::Address`]: geographic coordinates
//!   and peer addresses
//! - [`curve`]: the Hilbert space-filling curve and the fixed-point
//!   point ↔ NodeId codec
//! - [`error`]: the unified error type and wire error codes

pub mod constants;
pub mod curve;
pub mod error;
pub mod types;

pub use error::{ErrorCode, LocusError, LocusResult};
pub use types::{Address, GeoPoint, NodeId, NodeIdRange};
