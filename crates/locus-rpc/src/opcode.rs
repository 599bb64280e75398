//! Protocol opcodes.

use std::fmt;

/// Opcode of a protocol request.
///
/// The same value with the high bit set identifies the matching reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// A server contacts another server to bootstrap the protocol.
    ServerHello = 1,
    /// A client registers (or re-registers) with a server.
    ClientHello = 2,
    /// Learn about a range owned by another server.
    AddRemoteRange = 3,
    /// Become the controlling server for a range.
    ControlRange = 4,
    /// Take over a client that was registered elsewhere.
    AdoptClient = 5,
    /// Find the server controlling the range containing a node id.
    FindControllingServer = 6,
    /// Find the server controlling the range containing a point.
    FindServerForPoint = 7,
    /// Update the calling client's physical location.
    SetLocation = 8,
    /// Set one metadata key of the calling client.
    SetMetadata = 9,
    /// Read one metadata key of a client known to this server.
    GetMetadata = 10,
    /// Look up the listening address of a client known to this server.
    FindClientAddress = 11,
    /// Find all clients inside a geographic rectangle.
    SearchClients = 12,
}

impl Opcode {
    /// Returns the numeric opcode.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Decodes a numeric opcode.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::ServerHello,
            2 => Self::ClientHello,
            3 => Self::AddRemoteRange,
            4 => Self::ControlRange,
            5 => Self::AdoptClient,
            6 => Self::FindControllingServer,
            7 => Self::FindServerForPoint,
            8 => Self::SetLocation,
            9 => Self::SetMetadata,
            10 => Self::GetMetadata,
            11 => Self::FindClientAddress,
            12 => Self::SearchClients,
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
