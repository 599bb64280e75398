//! The partition table.
//!
//! An ordered map from interval start to [`PartitionEntry`]. The table
//! always covers the universal range with no gaps or overlaps; every
//! entry's interval is a bit prefix, so splitting and merging move
//! along power-of-two boundaries only. The table also owns the client
//! registry and keeps it consistent with the per-owner R-trees.

mod owner;

pub use owner::{Authority, ClientEntry, LocalOwner, PartitionEntry, RemoteOwner};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use locus_common::constants::{LOAD_THRESHOLD, RTREE_MAX_ENTRIES};
use locus_common::{curve, Address, GeoPoint, LocusError, LocusResult, NodeId, NodeIdRange};
use locus_rpc::Peer;
use locus_rtree::GridPoint;

/// Outcome of [`Table::get_or_create_client`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientLookup {
    /// The id was already registered here.
    Existing(NodeId),
    /// A new record was created under this id.
    Created(NodeId),
    /// The id falls under a remote authority.
    NotOurs,
}

/// Outcome of [`Table::move_client`].
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    /// The client is still under a local authority (possibly with a new
    /// id, possibly in a different local interval).
    Local {
        /// The client's id after the move.
        new_id: NodeId,
    },
    /// The client's new position belongs to a peer. The record is kept
    /// in the registry (outside any R-tree) until the caller finishes
    /// or abandons the handoff.
    Moved {
        /// The client's id after the move.
        new_id: NodeId,
        /// The new authority.
        target: RemoteOwner,
    },
}

/// One step of a load-balancing round.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceAction {
    /// Tell the peer that we own this range.
    InformOwn {
        /// The range to announce.
        range: NodeIdRange,
    },
    /// Tell the peer that a third party owns this range.
    InformOther {
        /// The range to announce.
        range: NodeIdRange,
        /// The third party's address.
        address: Address,
    },
    /// Offer this locally owned range to the peer.
    Relinquish {
        /// The range to hand over.
        range: NodeIdRange,
    },
}

/// A remote authority to query during a spatial search.
#[derive(Debug, Clone)]
pub struct RemoteSearchTarget {
    /// Connection, if one is open.
    pub peer: Option<Arc<Peer>>,
    /// Listening address, if known.
    pub address: Option<Address>,
}

/// The partition table and client registry of one server.
pub struct Table {
    resolution: u8,
    ranges: BTreeMap<NodeId, PartitionEntry>,
    clients: HashMap<NodeId, ClientEntry>,
}

impl Table {
    /// Creates a table covering the universal range with an
    /// undiscovered remote authority, at the given curve resolution.
    pub fn new(resolution: u8) -> LocusResult<Self> {
        // validate the resolution once; the curve codec enforces the
        // same bounds on every conversion
        curve::node_id_for_hilbert(0, resolution)?;

        let mut ranges = BTreeMap::new();
        ranges.insert(
            NodeId::ZERO,
            PartitionEntry {
                range: NodeIdRange::UNIVERSAL,
                authority: Authority::Remote(RemoteOwner::default()),
            },
        );
        Ok(Self {
            resolution,
            ranges,
            clients: HashMap::new(),
        })
    }

    /// The curve resolution of this table.
    #[must_use]
    pub fn resolution(&self) -> u8 {
        self.resolution
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// True if the range can exist in a table of this resolution.
    #[must_use]
    pub fn is_valid_range(&self, range: &NodeIdRange) -> bool {
        range.mask() <= self.resolution
    }

    /// Derives the node id for a point at this table's resolution.
    pub fn node_id_for_point(&self, point: &GeoPoint) -> LocusResult<NodeId> {
        curve::node_id_for_point(point, self.resolution)
    }

    fn grid_of(&self, id: &NodeId) -> (u128, GridPoint) {
        let hilbert = curve::hilbert_for_node_id(id, self.resolution)
            .expect("resolution validated at construction");
        let order = u32::from(self.resolution) / 2;
        (hilbert, curve::hilbert::d_to_xy(order, hilbert))
    }

    // ------------------------------------------------------------------
    // lookup
    // ------------------------------------------------------------------

    fn key_of(&self, id: &NodeId) -> NodeId {
        let (key, entry) = self
            .ranges
            .range(..=*id)
            .next_back()
            .expect("table coverage is total");
        debug_assert!(entry.range.contains(id), "hole in partition table");
        *key
    }

    /// The unique entry whose range contains `id`.
    #[must_use]
    pub fn find_authority(&self, id: &NodeId) -> &PartitionEntry {
        let key = self.key_of(id);
        &self.ranges[&key]
    }

    /// Read access to a client record.
    #[must_use]
    pub fn client(&self, id: &NodeId) -> Option<&ClientEntry> {
        self.clients.get(id)
    }

    /// Write access to a client record.
    pub fn client_mut(&mut self, id: &NodeId) -> Option<&mut ClientEntry> {
        self.clients.get_mut(id)
    }

    // ------------------------------------------------------------------
    // range registration
    // ------------------------------------------------------------------

    /// Records that a peer owns `range`.
    ///
    /// Refuses with `AccessDenied` to overwrite any locally owned
    /// entry; we alone decide when to give up our clients.
    pub fn add_remote(
        &mut self,
        range: NodeIdRange,
        peer: Option<Arc<Peer>>,
        address: Option<Address>,
    ) -> LocusResult<()> {
        let covering_key = self.key_of(range.from());
        let covering_range = self.ranges[&covering_key].range;

        if covering_range == range {
            let entry = self.ranges.get_mut(&covering_key).unwrap();
            if entry.authority.is_local() {
                return Err(LocusError::AccessDenied);
            }
            entry.authority = Authority::Remote(RemoteOwner { peer, address });
            return Ok(());
        }

        if range.contains_range(&covering_range) {
            // the range swallows one or more existing entries
            let keys = self.covered_keys(&range);
            if keys
                .iter()
                .any(|key| self.ranges[key].authority.is_local())
            {
                return Err(LocusError::AccessDenied);
            }
            for key in keys {
                self.ranges.remove(&key);
            }
            self.ranges.insert(
                *range.from(),
                PartitionEntry {
                    range,
                    authority: Authority::Remote(RemoteOwner { peer, address }),
                },
            );
            return Ok(());
        }

        // the range is strictly inside an existing entry: split down
        debug_assert!(covering_range.contains_range(&range));
        if self.ranges[&covering_key].authority.is_local() {
            return Err(LocusError::AccessDenied);
        }
        let final_key = self.split_down_to(covering_key, &range);
        let entry = self.ranges.get_mut(&final_key).unwrap();
        debug_assert_eq!(entry.range, range);
        entry.authority = Authority::Remote(RemoteOwner { peer, address });
        Ok(())
    }

    /// Takes local control of `range`.
    ///
    /// Clients of absorbed local entries move into the new owner (or
    /// into `existing`, when the caller supplies an already populated
    /// owner). Remote entries are simply replaced; their clients arrive
    /// later through adoption.
    pub fn add_local(&mut self, range: NodeIdRange, existing: Option<LocalOwner>) {
        let covering_key = self.key_of(range.from());
        let covering_range = self.ranges[&covering_key].range;

        if range.contains_range(&covering_range) {
            // swallow every covered entry, keeping their clients
            let mut owner = existing.unwrap_or_else(|| LocalOwner::new(RTREE_MAX_ENTRIES));
            for key in self.covered_keys(&range) {
                let entry = self.ranges.remove(&key).unwrap();
                if let Authority::Local(absorbed) = entry.authority {
                    owner.absorb(absorbed);
                }
            }
            self.ranges.insert(
                *range.from(),
                PartitionEntry {
                    range,
                    authority: Authority::Local(owner),
                },
            );
            return;
        }

        // strictly inside an existing entry: split down
        debug_assert!(covering_range.contains_range(&range));
        let final_key = self.split_down_to(covering_key, &range);
        let entry = self.ranges.get_mut(&final_key).unwrap();
        debug_assert_eq!(entry.range, range);
        match &mut entry.authority {
            Authority::Local(owner) => {
                // splitting already routed the clients here
                if let Some(extra) = existing {
                    owner.absorb(extra);
                }
            }
            Authority::Remote(_) => {
                entry.authority = Authority::Local(
                    existing.unwrap_or_else(|| LocalOwner::new(RTREE_MAX_ENTRIES)),
                );
            }
        }
    }

    /// Keys of all entries wholly contained in `range`, starting at its
    /// first entry.
    fn covered_keys(&self, range: &NodeIdRange) -> Vec<NodeId> {
        self.ranges
            .range(*range.from()..)
            .take_while(|(_, entry)| range.contains_range(&entry.range))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Splits the entry at `key` repeatedly until one child's range
    /// equals `target`, returning that child's key. At every split the
    /// half away from `target` keeps the previous authority.
    fn split_down_to(&mut self, key: NodeId, target: &NodeIdRange) -> NodeId {
        let mut current = key;
        loop {
            let mask = self.ranges[&current].range.mask();
            if mask == target.mask() {
                return current;
            }
            debug_assert!(mask < target.mask());
            let (_, right_key) = self.split_entry(current);
            if target.from().bit_at(mask) {
                current = right_key;
            }
        }
    }

    /// Splits one entry into its two children, partitioning clients for
    /// local owners and cloning the authority for remote ones. Returns
    /// the child keys.
    fn split_entry(&mut self, key: NodeId) -> (NodeId, NodeId) {
        let entry = self.ranges.remove(&key).expect("split of missing entry");
        let (left_range, right_range) = entry.range.split();
        let discriminant = entry.range.mask();

        let (left_auth, right_auth) = match entry.authority {
            Authority::Local(mut owner) => {
                let right = owner.split_by_bit(discriminant, RTREE_MAX_ENTRIES);
                (Authority::Local(owner), Authority::Local(right))
            }
            Authority::Remote(remote) => {
                (Authority::Remote(remote.clone()), Authority::Remote(remote))
            }
        };

        let left_key = *left_range.from();
        let right_key = *right_range.from();
        self.ranges.insert(
            left_key,
            PartitionEntry {
                range: left_range,
                authority: left_auth,
            },
        );
        self.ranges.insert(
            right_key,
            PartitionEntry {
                range: right_range,
                authority: right_auth,
            },
        );
        (left_key, right_key)
    }

    // ------------------------------------------------------------------
    // client registry
    // ------------------------------------------------------------------

    /// True if `id` was constructed at this table's resolution: the
    /// validity flag is set and no coordinate bit lies beyond the
    /// resolution.
    #[must_use]
    pub fn is_valid_client_id(&self, id: &NodeId) -> bool {
        if !id.is_set() {
            return false;
        }
        let mut coordinate_bits = *id;
        coordinate_bits.set_bit_at(NodeId::BITS - 1, false);
        coordinate_bits.has_mask(self.resolution)
    }

    /// Finds or creates the record for a client announcing itself with
    /// `prior_id` (zero for a fresh client) at `point`.
    pub fn get_or_create_client(
        &mut self,
        prior_id: NodeId,
        point: GeoPoint,
    ) -> LocusResult<ClientLookup> {
        let id = if prior_id.is_set() {
            if !self.is_valid_client_id(&prior_id) {
                return Err(LocusError::invalid_argument(
                    "node id does not match this resolution",
                ));
            }
            prior_id
        } else {
            self.node_id_for_point(&point)?
        };

        if self.clients.contains_key(&id) {
            return Ok(ClientLookup::Existing(id));
        }

        let key = self.key_of(&id);
        let Authority::Local(_) = self.ranges[&key].authority else {
            return Ok(ClientLookup::NotOurs);
        };

        let (hilbert, cell) = self.grid_of(&id);
        let Authority::Local(owner) = &mut self.ranges.get_mut(&key).unwrap().authority else {
            unreachable!();
        };
        owner.insert(cell, hilbert, id);
        self.clients.insert(id, ClientEntry::new(id, point));
        Ok(ClientLookup::Created(id))
    }

    /// Moves a registered client to a new position, rebinding it in the
    /// R-trees and recomputing its id.
    pub fn move_client(&mut self, id: &NodeId, point: GeoPoint) -> LocusResult<MoveOutcome> {
        if !self.clients.contains_key(id) {
            return Err(LocusError::NoSuchDevice);
        }
        let new_id = self.node_id_for_point(&point)?;
        if new_id == *id {
            let entry = self.clients.get_mut(id).unwrap();
            entry.point = point;
            return Ok(MoveOutcome::Local { new_id });
        }

        let old_key = self.key_of(id);
        let (old_hilbert, _) = self.grid_of(id);
        let (new_hilbert, new_cell) = self.grid_of(&new_id);

        // detach from the old index
        if let Authority::Local(owner) = &mut self.ranges.get_mut(&old_key).unwrap().authority {
            owner.remove(old_hilbert, id);
        }

        // rekey the registry record
        let mut entry = self.clients.remove(id).unwrap();
        entry.id = new_id;
        entry.point = point;
        self.clients.insert(new_id, entry);

        let new_key = self.key_of(&new_id);
        match &mut self.ranges.get_mut(&new_key).unwrap().authority {
            Authority::Local(owner) => {
                owner.insert(new_cell, new_hilbert, new_id);
                Ok(MoveOutcome::Local { new_id })
            }
            Authority::Remote(remote) => Ok(MoveOutcome::Moved {
                new_id,
                target: remote.clone(),
            }),
        }
    }

    /// Ids of every client whose record is bound to the given peer
    /// connection.
    #[must_use]
    pub fn clients_bound_to(&self, peer_id: u64) -> Vec<NodeId> {
        self.clients
            .values()
            .filter(|entry| entry.peer.as_ref().is_some_and(|p| p.id() == peer_id))
            .map(|entry| entry.id)
            .collect()
    }

    /// Drops a client from the registry and its owning index.
    pub fn forget_client(&mut self, id: &NodeId) {
        if self.clients.remove(id).is_none() {
            return;
        }
        let key = self.key_of(id);
        let (hilbert, _) = self.grid_of(id);
        if let Authority::Local(owner) = &mut self.ranges.get_mut(&key).unwrap().authority {
            owner.remove(hilbert, id);
        }
    }

    // ------------------------------------------------------------------
    // load balancing
    // ------------------------------------------------------------------

    /// Walks the table deciding what to tell, and what to offer, a
    /// newly connected peer. The returned actions exactly cover the
    /// table as it stood on entry; offered ranges stay local until the
    /// caller completes the handoff with [`Table::release_range`].
    pub fn load_balance(&mut self) -> Vec<BalanceAction> {
        let mut actions = Vec::new();
        let keys: Vec<NodeId> = self.ranges.keys().copied().collect();

        for key in keys {
            let (range, local) = {
                let entry = &self.ranges[&key];
                (entry.range, entry.authority.is_local())
            };
            if !local {
                let Authority::Remote(remote) = &self.ranges[&key].authority else {
                    unreachable!();
                };
                match remote.address {
                    Some(address) => actions.push(BalanceAction::InformOther { range, address }),
                    // the owner is unknown; nothing useful to say
                    None => debug!("skipping announcement of {range} (owner unknown)"),
                }
                continue;
            }

            if range.mask() < self.resolution / 2 {
                // a coarse range is always worth sharing, loaded or not
                let (left_key, right_key) = self.split_entry(key);
                actions.push(BalanceAction::InformOwn {
                    range: self.ranges[&left_key].range,
                });
                actions.push(BalanceAction::Relinquish {
                    range: self.ranges[&right_key].range,
                });
                continue;
            }

            let load = match &self.ranges[&key].authority {
                Authority::Local(owner) => owner.load(),
                Authority::Remote(_) => unreachable!(),
            };
            if load <= LOAD_THRESHOLD {
                actions.push(BalanceAction::InformOwn { range });
                continue;
            }

            // overloaded: shed the smaller half, keep splitting the
            // bigger one until the halves even out or fit the threshold
            let mut current = key;
            loop {
                if self.ranges[&current].range.mask() >= self.resolution {
                    actions.push(BalanceAction::InformOwn {
                        range: self.ranges[&current].range,
                    });
                    break;
                }
                let (left_key, right_key) = self.split_entry(current);
                let load_of = |table: &Table, k: &NodeId| match &table.ranges[k].authority {
                    Authority::Local(owner) => owner.load(),
                    Authority::Remote(_) => unreachable!(),
                };
                let left_load = load_of(self, &left_key);
                let right_load = load_of(self, &right_key);
                let (keep, give) = if left_load >= right_load {
                    (left_key, right_key)
                } else {
                    (right_key, left_key)
                };
                actions.push(BalanceAction::Relinquish {
                    range: self.ranges[&give].range,
                });

                let bigger = left_load.max(right_load);
                let smaller = left_load.min(right_load);
                if bigger <= LOAD_THRESHOLD || bigger <= 2 * smaller {
                    actions.push(BalanceAction::InformOwn {
                        range: self.ranges[&keep].range,
                    });
                    break;
                }
                current = keep;
            }
        }
        actions
    }

    /// Snapshot of the clients inside a locally owned range, for
    /// adoption by a peer.
    #[must_use]
    pub fn clients_in_range(&self, range: &NodeIdRange) -> Vec<ClientEntry> {
        let key = self.key_of(range.from());
        let entry = &self.ranges[&key];
        if entry.range != *range {
            return Vec::new();
        }
        let Authority::Local(owner) = &entry.authority else {
            return Vec::new();
        };
        owner
            .client_ids()
            .iter()
            .filter_map(|id| self.clients.get(id).cloned())
            .collect()
    }

    /// Completes a handoff: flips a local range to remote and forgets
    /// its clients. A no-op if the entry no longer matches.
    pub fn release_range(
        &mut self,
        range: &NodeIdRange,
        peer: Option<Arc<Peer>>,
        address: Option<Address>,
    ) {
        let key = self.key_of(range.from());
        let entry = self.ranges.get_mut(&key).unwrap();
        if entry.range != *range || !entry.authority.is_local() {
            debug!("release of {range} skipped, table moved on");
            return;
        }
        let previous = std::mem::replace(
            &mut entry.authority,
            Authority::Remote(RemoteOwner { peer, address }),
        );
        if let Authority::Local(owner) = previous {
            for id in owner.client_ids() {
                self.clients.remove(&id);
            }
        }
    }

    // ------------------------------------------------------------------
    // spatial search
    // ------------------------------------------------------------------

    /// Plans a rectangle search: collects matching local clients and
    /// the remote authorities that must also be asked.
    ///
    /// Walks the curve interval spanned by the rectangle's corners,
    /// jumping across foreign intervals and out-of-rectangle stretches
    /// (corner Hilbert values sorted ascending guarantee progress).
    pub fn plan_search(
        &self,
        lower: &GeoPoint,
        upper: &GeoPoint,
    ) -> LocusResult<(Vec<NodeId>, Vec<RemoteSearchTarget>)> {
        let order = u32::from(self.resolution) / 2;
        let (lat0, lon0) = lower.to_fixed_point();
        let (lat1, lon1) = upper.to_fixed_point();
        let a = (lat0 >> (64 - order), lon0 >> (64 - order));
        let b = (lat1 >> (64 - order), lon1 >> (64 - order));
        let rect = locus_rtree::Rect::new(a, b);

        let mut corners: Vec<u128> = [
            (rect.lower().0, rect.lower().1),
            (rect.lower().0, rect.upper().1),
            (rect.upper().0, rect.lower().1),
            (rect.upper().0, rect.upper().1),
        ]
        .iter()
        .map(|&(x, y)| curve::hilbert::xy_to_d(order, x, y))
        .collect();
        corners.sort_unstable();

        let end = 1u128 << self.resolution;
        let mut local_hits: Vec<NodeId> = Vec::new();
        let mut remote: Vec<RemoteSearchTarget> = Vec::new();
        let mut seen_addresses: Vec<Address> = Vec::new();

        let mut i = corners[0];
        while i < end {
            let cell = curve::hilbert::d_to_xy(order, i);
            if !rect.contains_point(cell) {
                // jump to the next corner still ahead of us
                match corners.iter().find(|&&c| c > i) {
                    Some(&next) => {
                        i = next;
                        continue;
                    }
                    None => break,
                }
            }

            let probe = curve::node_id_for_hilbert(i, self.resolution)?;
            let entry = self.find_authority(&probe);
            match &entry.authority {
                Authority::Local(owner) => {
                    for hit in owner.index.search(&rect) {
                        local_hits.push(hit.data);
                    }
                }
                Authority::Remote(owner) => {
                    // one query per authority, however many of its
                    // intervals we cross
                    let duplicate = owner
                        .address
                        .is_some_and(|addr| seen_addresses.contains(&addr));
                    if !duplicate {
                        if let Some(addr) = owner.address {
                            seen_addresses.push(addr);
                        }
                        remote.push(RemoteSearchTarget {
                            peer: owner.peer.clone(),
                            address: owner.address,
                        });
                    }
                }
            }
            let (_, interval_end) = curve::hilbert_interval(&entry.range, self.resolution)?;
            i = interval_end;
        }

        Ok((local_hits, remote))
    }

    /// Searches only the locally owned intervals, for queries forwarded
    /// by a peer that is already fanning out across the cluster.
    #[must_use]
    pub fn search_local(&self, lower: &GeoPoint, upper: &GeoPoint) -> Vec<NodeId> {
        let order = u32::from(self.resolution) / 2;
        let (lat0, lon0) = lower.to_fixed_point();
        let (lat1, lon1) = upper.to_fixed_point();
        let a = (lat0 >> (64 - order), lon0 >> (64 - order));
        let b = (lat1 >> (64 - order), lon1 >> (64 - order));
        let rect = locus_rtree::Rect::new(a, b);

        let mut hits = Vec::new();
        for entry in self.ranges.values() {
            if let Authority::Local(owner) = &entry.authority {
                for hit in owner.index.search(&rect) {
                    hits.push(hit.data);
                }
            }
        }
        hits
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    /// All ranges with whether each is local, in table order.
    #[must_use]
    pub fn ranges(&self) -> Vec<(NodeIdRange, bool)> {
        self.ranges
            .values()
            .map(|entry| (entry.range, entry.authority.is_local()))
            .collect()
    }

    /// Checks that the table covers the universal range exactly, in
    /// order and without gaps or overlaps, and that every locally
    /// indexed client is registered and in range.
    pub fn check_coverage(&self) -> LocusResult<()> {
        let mut expected = Some(NodeId::ZERO);
        for (key, entry) in &self.ranges {
            if entry.range.from() != key {
                return Err(LocusError::peer_misbehavior("entry key mismatch"));
            }
            match expected {
                Some(start) if start == *key => {}
                _ => return Err(LocusError::peer_misbehavior("gap or overlap in table")),
            }
            expected = next_after(&entry.range);

            if let Authority::Local(owner) = &entry.authority {
                for id in owner.client_ids() {
                    if !entry.range.contains(&id) {
                        return Err(LocusError::peer_misbehavior("client outside its range"));
                    }
                    if !self.clients.contains_key(&id) {
                        return Err(LocusError::peer_misbehavior("client missing from registry"));
                    }
                }
            }
        }
        if expected.is_some() {
            return Err(LocusError::peer_misbehavior("table does not reach the end"));
        }
        Ok(())
    }
}

/// The id immediately after a range, or `None` at the end of the space.
fn next_after(range: &NodeIdRange) -> Option<NodeId> {
    let mut id = *range.from();
    // adding 2^(160-mask): propagate a carry from bit mask-1 upward
    let mut pos = range.mask();
    loop {
        if pos == 0 {
            return None;
        }
        pos -= 1;
        if id.bit_at(pos) {
            id.set_bit_at(pos, false);
        } else {
            id.set_bit_at(pos, true);
            return Some(id);
        }
    }
}

#[cfg(test)]
mod tests;
