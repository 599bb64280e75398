//! Typed protocol messages.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use locus_common::{Address, GeoPoint, LocusError, LocusResult, NodeId, NodeIdRange};

use crate::opcode::Opcode;
use crate::wire::{WireDecode, WireEncode};

/// Outcome of a `client_hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationResult {
    /// A new client record was created; the client must upload all its
    /// metadata.
    Created = 0,
    /// The record already existed; only pending changes need pushing.
    AlreadyExists = 1,
    /// This server is not the authority; ask it who is and retry.
    WrongServer = 2,
}

impl RegistrationResult {
    fn from_u8(value: u8) -> LocusResult<Self> {
        Ok(match value {
            0 => Self::Created,
            1 => Self::AlreadyExists,
            2 => Self::WrongServer,
            _ => {
                return Err(LocusError::malformed(format!(
                    "unknown registration result {value}"
                )))
            }
        })
    }
}

/// Outcome of a `set_location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocationResult {
    /// The client is still controlled by the same server.
    SameServer = 0,
    /// The client was handed to the server in the reply; reconnect
    /// there.
    DifferentServer = 1,
}

impl LocationResult {
    fn from_u8(value: u8) -> LocusResult<Self> {
        Ok(match value {
            0 => Self::SameServer,
            1 => Self::DifferentServer,
            _ => {
                return Err(LocusError::malformed(format!(
                    "unknown location result {value}"
                )))
            }
        })
    }
}

/// A decoded protocol request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `server_hello(address)`
    ServerHello {
        /// The caller's routable listening address.
        address: Address,
    },
    /// `client_hello(address, prior_id, point)`
    ClientHello {
        /// The client's listening address.
        address: Address,
        /// The client's previous node id, or the zero sentinel.
        prior_id: NodeId,
        /// The client's current location.
        point: GeoPoint,
    },
    /// `add_remote_range(range, address)`
    AddRemoteRange {
        /// The announced range.
        range: NodeIdRange,
        /// Listening address of its authority.
        address: Address,
    },
    /// `control_range(range)`
    ControlRange {
        /// The range the receiver must start controlling.
        range: NodeIdRange,
    },
    /// `adopt_client(id, point, address, metadata)`
    AdoptClient {
        /// The migrating client's id.
        id: NodeId,
        /// Its last known location.
        point: GeoPoint,
        /// Its listening address.
        address: Address,
        /// Its full metadata.
        metadata: BTreeMap<String, String>,
    },
    /// `find_controlling_server(id)`
    FindControllingServer {
        /// The id to locate.
        id: NodeId,
    },
    /// `find_server_for_point(point)`
    FindServerForPoint {
        /// The point to locate.
        point: GeoPoint,
    },
    /// `set_location(point)`
    SetLocation {
        /// The caller's new location.
        point: GeoPoint,
    },
    /// `set_metadata(key, value)`
    SetMetadata {
        /// Metadata key.
        key: String,
        /// Metadata value.
        value: String,
    },
    /// `get_metadata(id, key)`
    GetMetadata {
        /// The client to read from.
        id: NodeId,
        /// Metadata key.
        key: String,
    },
    /// `find_client_address(id)`
    FindClientAddress {
        /// The client to look up.
        id: NodeId,
    },
    /// `search_clients(lower, upper)`
    SearchClients {
        /// South-west corner of the query rectangle.
        lower: GeoPoint,
        /// North-east corner of the query rectangle.
        upper: GeoPoint,
    },
}

impl Request {
    /// The opcode identifying this request on the wire.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ServerHello { .. } => Opcode::ServerHello,
            Self::ClientHello { .. } => Opcode::ClientHello,
            Self::AddRemoteRange { .. } => Opcode::AddRemoteRange,
            Self::ControlRange { .. } => Opcode::ControlRange,
            Self::AdoptClient { .. } => Opcode::AdoptClient,
            Self::FindControllingServer { .. } => Opcode::FindControllingServer,
            Self::FindServerForPoint { .. } => Opcode::FindServerForPoint,
            Self::SetLocation { .. } => Opcode::SetLocation,
            Self::SetMetadata { .. } => Opcode::SetMetadata,
            Self::GetMetadata { .. } => Opcode::GetMetadata,
            Self::FindClientAddress { .. } => Opcode::FindClientAddress,
            Self::SearchClients { .. } => Opcode::SearchClients,
        }
    }

    /// Marshals the request arguments.
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::ServerHello { address } => address.encode(&mut buf),
            Self::ClientHello {
                address,
                prior_id,
                point,
            } => {
                address.encode(&mut buf);
                prior_id.encode(&mut buf);
                point.encode(&mut buf);
            }
            Self::AddRemoteRange { range, address } => {
                range.encode(&mut buf);
                address.encode(&mut buf);
            }
            Self::ControlRange { range } => range.encode(&mut buf),
            Self::AdoptClient {
                id,
                point,
                address,
                metadata,
            } => {
                id.encode(&mut buf);
                point.encode(&mut buf);
                address.encode(&mut buf);
                metadata.encode(&mut buf);
            }
            Self::FindControllingServer { id } => id.encode(&mut buf),
            Self::FindServerForPoint { point } => point.encode(&mut buf),
            Self::SetLocation { point } => point.encode(&mut buf),
            Self::SetMetadata { key, value } => {
                key.encode(&mut buf);
                value.encode(&mut buf);
            }
            Self::GetMetadata { id, key } => {
                id.encode(&mut buf);
                key.encode(&mut buf);
            }
            Self::FindClientAddress { id } => id.encode(&mut buf),
            Self::SearchClients { lower, upper } => {
                lower.encode(&mut buf);
                upper.encode(&mut buf);
            }
        }
        buf.freeze()
    }

    /// Parses a request payload for the given opcode.
    pub fn decode(opcode: Opcode, mut payload: Bytes) -> LocusResult<Self> {
        let buf = &mut payload;
        let request = match opcode {
            Opcode::ServerHello => Self::ServerHello {
                address: Address::decode(buf)?,
            },
            Opcode::ClientHello => Self::ClientHello {
                address: Address::decode(buf)?,
                prior_id: NodeId::decode(buf)?,
                point: GeoPoint::decode(buf)?,
            },
            Opcode::AddRemoteRange => Self::AddRemoteRange {
                range: NodeIdRange::decode(buf)?,
                address: Address::decode(buf)?,
            },
            Opcode::ControlRange => Self::ControlRange {
                range: NodeIdRange::decode(buf)?,
            },
            Opcode::AdoptClient => Self::AdoptClient {
                id: NodeId::decode(buf)?,
                point: GeoPoint::decode(buf)?,
                address: Address::decode(buf)?,
                metadata: BTreeMap::decode(buf)?,
            },
            Opcode::FindControllingServer => Self::FindControllingServer {
                id: NodeId::decode(buf)?,
            },
            Opcode::FindServerForPoint => Self::FindServerForPoint {
                point: GeoPoint::decode(buf)?,
            },
            Opcode::SetLocation => Self::SetLocation {
                point: GeoPoint::decode(buf)?,
            },
            Opcode::SetMetadata => Self::SetMetadata {
                key: String::decode(buf)?,
                value: String::decode(buf)?,
            },
            Opcode::GetMetadata => Self::GetMetadata {
                id: NodeId::decode(buf)?,
                key: String::decode(buf)?,
            },
            Opcode::FindClientAddress => Self::FindClientAddress {
                id: NodeId::decode(buf)?,
            },
            Opcode::SearchClients => Self::SearchClients {
                lower: GeoPoint::decode(buf)?,
                upper: GeoPoint::decode(buf)?,
            },
        };
        if buf.remaining() != 0 {
            return Err(LocusError::malformed("trailing bytes in request payload"));
        }
        Ok(request)
    }
}

/// A decoded protocol reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Success with no results.
    Empty,
    /// Reply to `client_hello`.
    ClientHello {
        /// Registration outcome.
        result: RegistrationResult,
        /// The id assigned to the client (zero on `WrongServer`).
        id: NodeId,
    },
    /// Reply to `find_controlling_server` / `find_server_for_point`.
    AddressAndRange {
        /// The authority's listening address.
        address: Address,
        /// The range it controls.
        range: NodeIdRange,
    },
    /// Reply to `set_location`.
    SetLocation {
        /// Whether the client stayed on this server.
        result: LocationResult,
        /// The client's new id.
        id: NodeId,
        /// The responsible server (self on `SameServer`).
        address: Address,
    },
    /// Reply to `get_metadata`.
    Metadata {
        /// The stored value.
        value: String,
    },
    /// Reply to `find_client_address`.
    ClientAddress {
        /// The client's listening address.
        address: Address,
    },
    /// Reply to `search_clients`.
    NodeIds {
        /// Every matching client id.
        ids: Vec<NodeId>,
    },
}

impl Reply {
    /// Marshals the reply results.
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Empty => {}
            Self::ClientHello { result, id } => {
                (*result as u8).encode(&mut buf);
                id.encode(&mut buf);
            }
            Self::AddressAndRange { address, range } => {
                address.encode(&mut buf);
                range.encode(&mut buf);
            }
            Self::SetLocation {
                result,
                id,
                address,
            } => {
                (*result as u8).encode(&mut buf);
                id.encode(&mut buf);
                address.encode(&mut buf);
            }
            Self::Metadata { value } => value.encode(&mut buf),
            Self::ClientAddress { address } => address.encode(&mut buf),
            Self::NodeIds { ids } => ids.encode(&mut buf),
        }
        buf.freeze()
    }

    /// Parses a successful reply payload for the given request opcode.
    pub fn decode(opcode: Opcode, mut payload: Bytes) -> LocusResult<Self> {
        let buf = &mut payload;
        let reply = match opcode {
            Opcode::ServerHello
            | Opcode::AddRemoteRange
            | Opcode::ControlRange
            | Opcode::AdoptClient
            | Opcode::SetMetadata => Self::Empty,
            Opcode::ClientHello => Self::ClientHello {
                result: RegistrationResult::from_u8(u8::decode(buf)?)?,
                id: NodeId::decode(buf)?,
            },
            Opcode::FindControllingServer | Opcode::FindServerForPoint => Self::AddressAndRange {
                address: Address::decode(buf)?,
                range: NodeIdRange::decode(buf)?,
            },
            Opcode::SetLocation => Self::SetLocation {
                result: LocationResult::from_u8(u8::decode(buf)?)?,
                id: NodeId::decode(buf)?,
                address: Address::decode(buf)?,
            },
            Opcode::GetMetadata => Self::Metadata {
                value: String::decode(buf)?,
            },
            Opcode::FindClientAddress => Self::ClientAddress {
                address: Address::decode(buf)?,
            },
            Opcode::SearchClients => Self::NodeIds {
                ids: Vec::decode(buf)?,
            },
        };
        if buf.remaining() != 0 {
            return Err(LocusError::malformed("trailing bytes in reply payload"));
        }
        Ok(reply)
    }
}
