//! Range authorities and client records.

use std::collections::BTreeMap;
use std::sync::Arc;

use locus_common::{Address, GeoPoint, NodeId, NodeIdRange};
use locus_rpc::Peer;
use locus_rtree::{GridPoint, RTree};

/// A client known to this server: its position, its connection, and its
/// metadata. The record is shared between the registry map (keyed by
/// node id) and exactly one local owner's R-tree (which stores the id).
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Current node id (changes when the client moves).
    pub id: NodeId,
    /// Last reported location.
    pub point: GeoPoint,
    /// Connection to the client, when one is open.
    pub peer: Option<Arc<Peer>>,
    /// The client's own listening address.
    pub address: Option<Address>,
    /// Key/value metadata, kept ordered.
    pub metadata: BTreeMap<String, String>,
    /// Set once the client completed a registration; a registered
    /// record survives reconnects with its metadata intact.
    pub registered: bool,
}

impl ClientEntry {
    pub(crate) fn new(id: NodeId, point: GeoPoint) -> Self {
        Self {
            id,
            point,
            peer: None,
            address: None,
            metadata: BTreeMap::new(),
            registered: false,
        }
    }
}

/// A locally controlled interval: the spatial index of its clients.
pub struct LocalOwner {
    /// Clients in this interval, indexed by grid cell; payloads are the
    /// registry keys.
    pub(crate) index: RTree<NodeId>,
}

impl LocalOwner {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            index: RTree::new(max_entries),
        }
    }

    /// Number of clients currently indexed here.
    #[must_use]
    pub fn load(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn insert(&mut self, point: GridPoint, hilbert: u128, id: NodeId) {
        self.index.insert(point, hilbert, id);
    }

    pub(crate) fn remove(&mut self, hilbert: u128, id: &NodeId) -> bool {
        self.index.remove(hilbert, id)
    }

    /// Moves every client out of `other` into this owner.
    pub(crate) fn absorb(&mut self, other: LocalOwner) {
        other
            .index
            .for_each_entry(|entry| self.index.insert(entry.point, entry.hilbert, entry.data));
    }

    /// Partitions the clients by the discriminating bit at `bit`,
    /// returning the owner for the 1-side. `self` keeps the 0-side.
    pub(crate) fn split_by_bit(&mut self, bit: u8, max_entries: usize) -> LocalOwner {
        let mut left = RTree::new(max_entries);
        let mut right = RTree::new(max_entries);
        self.index.for_each_entry(|entry| {
            let target = if entry.data.bit_at(bit) {
                &mut right
            } else {
                &mut left
            };
            target.insert(entry.point, entry.hilbert, entry.data);
        });
        self.index = left;
        LocalOwner { index: right }
    }

    /// Every client id indexed here, in Hilbert order.
    #[must_use]
    pub fn client_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.index.len());
        self.index.for_each_entry(|entry| ids.push(entry.data));
        ids
    }
}

impl std::fmt::Debug for LocalOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOwner")
            .field("load", &self.load())
            .finish()
    }
}

/// A remotely controlled interval: who to ask about it.
#[derive(Debug, Clone, Default)]
pub struct RemoteOwner {
    /// Connection to the authority, when one is open.
    pub peer: Option<Arc<Peer>>,
    /// The authority's listening address, when known. Both fields are
    /// `None` for intervals whose owner has not been discovered yet.
    pub address: Option<Address>,
}

/// The authority for one partition entry.
pub enum Authority {
    /// This process controls the interval.
    Local(LocalOwner),
    /// A peer (possibly not yet known) controls the interval.
    Remote(RemoteOwner),
}

impl Authority {
    /// Returns true for locally controlled intervals.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(owner) => write!(f, "Local(load={})", owner.load()),
            Self::Remote(remote) => write!(f, "Remote({:?})", remote.address),
        }
    }
}

/// One row of the partition table.
#[derive(Debug)]
pub struct PartitionEntry {
    /// The interval this row covers.
    pub range: NodeIdRange,
    /// Who controls it.
    pub authority: Authority,
}
