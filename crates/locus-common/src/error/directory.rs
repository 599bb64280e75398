//! Directory error types.

use std::fmt;

use thiserror::Error;

/// Stable numeric error codes carried in reply frames.
///
/// These codes are the only error information that crosses the wire; a
/// receiver reconstructs a [`LocusError::Remote`] from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Malformed request, invalid node id, out-of-range resolution.
    InvalidArgument = 1,
    /// Role mismatch: a client calling a server-only RPC or vice versa.
    PermissionDenied = 2,
    /// Refusal to overwrite a locally owned range with a remote claim.
    AccessDenied = 3,
    /// Node id or metadata key unknown on this authority.
    NotFound = 4,
    /// The caller's assumption about authority is stale; re-register.
    NoSuchDevice = 5,
    /// Unrecognized opcode.
    NotImplemented = 6,
    /// Peer misbehavior detected (e.g. a subrange that does not fit).
    Io = 7,
    /// A peer claimed to be our own address.
    LoopDetected = 8,
    /// Network failure or connection drop.
    Unreachable = 9,
    /// The owner of a range is not yet known (transient).
    Unavailable = 10,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decodes a numeric code from the wire.
    #[must_use]
    pub const fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::InvalidArgument,
            2 => Self::PermissionDenied,
            3 => Self::AccessDenied,
            4 => Self::NotFound,
            5 => Self::NoSuchDevice,
            6 => Self::NotImplemented,
            7 => Self::Io,
            8 => Self::LoopDetected,
            9 => Self::Unreachable,
            10 => Self::Unavailable,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for Locus.
#[derive(Debug, Error)]
pub enum LocusError {
    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// The peer's role does not allow this request.
    #[error("permission denied")]
    PermissionDenied,

    /// A remote announcement would overwrite a local range.
    #[error("refusing to overwrite a locally owned range")]
    AccessDenied,

    /// Node id or metadata key unknown here.
    #[error("not found")]
    NotFound,

    /// Stale authority assumption; the caller should re-register.
    #[error("no such device on this authority")]
    NoSuchDevice,

    /// Unrecognized opcode.
    #[error("opcode {opcode:#06x} not implemented")]
    NotImplemented {
        /// The offending opcode.
        opcode: u16,
    },

    /// A peer sent something protocol-legal but semantically impossible.
    #[error("peer misbehavior: {message}")]
    PeerMisbehavior {
        /// What the peer did.
        message: String,
    },

    /// A peer claimed to be this process.
    #[error("peer routing loop detected")]
    LoopDetected,

    /// Network failure from the underlying socket.
    #[error("peer unreachable: {source}")]
    Network {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The connection dropped while a request was outstanding.
    #[error("peer unreachable: {reason}")]
    Unreachable {
        /// Why the peer is unreachable.
        reason: String,
    },

    /// The owner of a range is not yet known.
    #[error("authority temporarily unavailable")]
    Unavailable,

    /// An error reported by a remote peer.
    #[error("remote error: {code}")]
    Remote {
        /// The code the peer replied with.
        code: ErrorCode,
    },

    /// A frame or payload that does not parse.
    #[error("malformed message: {message}")]
    Malformed {
        /// What failed to parse.
        message: String,
    },
}

impl LocusError {
    /// Returns the wire code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } | Self::Malformed { .. } => ErrorCode::InvalidArgument,
            Self::PermissionDenied => ErrorCode::PermissionDenied,
            Self::AccessDenied => ErrorCode::AccessDenied,
            Self::NotFound => ErrorCode::NotFound,
            Self::NoSuchDevice => ErrorCode::NoSuchDevice,
            Self::NotImplemented { .. } => ErrorCode::NotImplemented,
            Self::PeerMisbehavior { .. } => ErrorCode::Io,
            Self::LoopDetected => ErrorCode::LoopDetected,
            Self::Network { .. } | Self::Unreachable { .. } => ErrorCode::Unreachable,
            Self::Unavailable => ErrorCode::Unavailable,
            Self::Remote { code } => *code,
        }
    }

    /// Reconstructs an error from a wire code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self::Remote { code }
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NoSuchDevice | ErrorCode::Unreachable | ErrorCode::Unavailable
        )
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a peer misbehavior error.
    #[must_use]
    pub fn peer_misbehavior(message: impl Into<String>) -> Self {
        Self::PeerMisbehavior {
            message: message.into(),
        }
    }

    /// Creates a malformed message error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates an unreachable error.
    #[must_use]
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }
}
