//! Error handling for Locus.
//!
//! Provides the unified error type and result alias used across all
//! Locus components, plus the stable numeric codes errors are reduced to
//! on the wire.

mod directory;

pub use directory::{ErrorCode, LocusError};

/// Result type alias for Locus operations.
pub type LocusResult<T> = std::result::Result<T, LocusError>;
