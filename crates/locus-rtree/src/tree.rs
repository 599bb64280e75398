//! The Hilbert R-tree.

use crate::node::{LeafEntry, Node, NodeIdx, Slot};
use crate::rect::{GridPoint, Rect};

/// Default maximum number of entries per node.
pub const DEFAULT_MAX_ENTRIES: usize = 5;

/// A Hilbert-ordered R-tree over grid points.
///
/// `T` is the caller's payload, carried by value in each leaf entry.
/// Within every node, slots are sorted ascending by Hilbert key (the
/// entry's Hilbert value in leaves, the child's LHV in internal nodes),
/// and every internal node's MBR/LHV summarize its subtree exactly.
pub struct RTree<T> {
    nodes: Vec<Node<T>>,
    root: NodeIdx,
    len: usize,
    max_entries: usize,
}

impl<T: Clone + PartialEq> Default for RTree<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl<T: Clone + PartialEq> RTree<T> {
    /// Creates an empty tree with the given node capacity.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        assert!(max_entries >= 2, "nodes need room for at least two slots");
        let root = Node::new(true);
        Self {
            nodes: vec![root],
            root: 0,
            len: 0,
            max_entries,
        }
    }

    /// Number of indexed entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the tree holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts an entry at `point` with the given Hilbert value.
    pub fn insert(&mut self, point: GridPoint, hilbert: u128, data: T) {
        let entry = LeafEntry {
            point,
            hilbert,
            data,
        };
        let leaf = self.choose_leaf(hilbert);

        let new_node = if self.nodes[leaf].has_capacity(self.max_entries) {
            self.insert_slot(leaf, Slot::Leaf(entry));
            None
        } else {
            self.handle_overflow(leaf, Slot::Leaf(entry))
        };

        self.propagate_split(leaf, new_node);
        self.tighten_upward(leaf);
        self.len += 1;
    }

    /// Removes the entry with the given Hilbert value and payload.
    /// Returns true if an entry was removed.
    pub fn remove(&mut self, hilbert: u128, data: &T) -> bool {
        let Some(leaf) = self.remove_from(self.root, hilbert, data) else {
            return false;
        };
        self.tighten_upward(leaf);
        self.len -= 1;
        true
    }

    /// Returns every entry whose cell intersects the query rectangle.
    #[must_use]
    pub fn search(&self, query: &Rect) -> Vec<&LeafEntry<T>> {
        let mut out = Vec::new();
        self.search_in(self.root, query, &mut out);
        out
    }

    /// Visits every entry in post-order (leaves in Hilbert order).
    pub fn for_each_entry(&self, mut f: impl FnMut(&LeafEntry<T>)) {
        self.walk(self.root, &mut f);
    }

    /// The bounding rectangle of the whole tree, if non-empty.
    #[must_use]
    pub fn bounds(&self) -> Option<Rect> {
        self.nodes[self.root].mbr
    }

    // ------------------------------------------------------------------
    // descent
    // ------------------------------------------------------------------

    fn choose_leaf(&self, hilbert: u128) -> NodeIdx {
        let mut idx = self.root;
        loop {
            let node = &self.nodes[idx];
            if node.leaf {
                return idx;
            }
            // first child with LHV beyond the new value, else the last
            idx = node
                .slots
                .iter()
                .find(|s| self.nodes[s.as_child()].lhv > hilbert)
                .unwrap_or_else(|| node.slots.last().expect("internal node with no children"))
                .as_child();
        }
    }

    fn search_in<'a>(&'a self, idx: NodeIdx, query: &Rect, out: &mut Vec<&'a LeafEntry<T>>) {
        let node = &self.nodes[idx];
        if node.leaf {
            for slot in &node.slots {
                if let Slot::Leaf(entry) = slot {
                    if query.contains_point(entry.point) {
                        out.push(entry);
                    }
                }
            }
        } else {
            for slot in &node.slots {
                let child = slot.as_child();
                if self.nodes[child]
                    .mbr
                    .is_some_and(|mbr| mbr.intersects(query))
                {
                    self.search_in(child, query, out);
                }
            }
        }
    }

    fn walk<'a>(&'a self, idx: NodeIdx, f: &mut impl FnMut(&'a LeafEntry<T>)) {
        let node = &self.nodes[idx];
        if node.leaf {
            for slot in &node.slots {
                if let Slot::Leaf(entry) = slot {
                    f(entry);
                }
            }
        } else {
            for slot in &node.slots {
                self.walk(slot.as_child(), f);
            }
        }
    }

    fn remove_from(&mut self, idx: NodeIdx, hilbert: u128, data: &T) -> Option<NodeIdx> {
        if self.nodes[idx].leaf {
            let pos = self.nodes[idx].slots.iter().position(|s| {
                matches!(s, Slot::Leaf(entry) if entry.hilbert == hilbert && entry.data == *data)
            })?;
            self.nodes[idx].slots.remove(pos);
            return Some(idx);
        }

        // entries left of a child with lhv < hilbert cannot match
        let candidates: Vec<NodeIdx> = self.nodes[idx]
            .slots
            .iter()
            .map(Slot::as_child)
            .filter(|&c| self.nodes[c].lhv >= hilbert)
            .collect();
        for child in candidates {
            if let Some(leaf) = self.remove_from(child, hilbert, data) {
                return Some(leaf);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // structure maintenance
    // ------------------------------------------------------------------

    fn alloc(&mut self, leaf: bool) -> NodeIdx {
        self.nodes.push(Node::new(leaf));
        self.nodes.len() - 1
    }

    fn slot_key(&self, slot: &Slot<T>) -> u128 {
        match slot {
            Slot::Leaf(entry) => entry.hilbert,
            Slot::Child(idx) => self.nodes[*idx].lhv,
        }
    }

    fn slot_mbr(&self, slot: &Slot<T>) -> Option<Rect> {
        match slot {
            Slot::Leaf(entry) => Some(Rect::point(entry.point)),
            Slot::Child(idx) => self.nodes[*idx].mbr,
        }
    }

    /// Inserts a slot in Hilbert order and refreshes the node summary.
    fn insert_slot(&mut self, idx: NodeIdx, slot: Slot<T>) {
        if let Slot::Child(child) = &slot {
            self.nodes[*child].parent = Some(idx);
        }
        let key = self.slot_key(&slot);
        let pos = self.nodes[idx]
            .slots
            .iter()
            .position(|s| self.slot_key(s) > key)
            .unwrap_or(self.nodes[idx].slots.len());
        self.nodes[idx].slots.insert(pos, slot);
        self.adjust(idx);
    }

    /// Recomputes MBR and LHV of a node from its slots.
    fn adjust(&mut self, idx: NodeIdx) {
        let mut mbr: Option<Rect> = None;
        let mut lhv: u128 = 0;
        for i in 0..self.nodes[idx].slots.len() {
            let slot_mbr = self.slot_mbr(&self.nodes[idx].slots[i]);
            let key = self.slot_key(&self.nodes[idx].slots[i]);
            mbr = match (mbr, slot_mbr) {
                (Some(a), Some(b)) => Some(a.union(&b)),
                (a, b) => a.or(b),
            };
            lhv = lhv.max(key);
        }
        let node = &mut self.nodes[idx];
        node.mbr = mbr;
        node.lhv = lhv;
    }

    /// Refreshes MBR/LHV from a node to the root.
    fn tighten_upward(&mut self, mut idx: NodeIdx) {
        loop {
            self.adjust(idx);
            match self.nodes[idx].parent {
                Some(parent) => idx = parent,
                None => return,
            }
        }
    }

    /// Absorbs an overflowing slot by redistributing across the node and
    /// its cooperating siblings; allocates a new sibling (placed just
    /// before `idx`) only when all of them are full. Returns the new
    /// sibling, which the caller must link into the parent.
    fn handle_overflow(&mut self, idx: NodeIdx, slot: Slot<T>) -> Option<NodeIdx> {
        let mut coop: Vec<NodeIdx> = match self.nodes[idx].parent {
            Some(parent) => {
                let children: Vec<NodeIdx> =
                    self.nodes[parent].slots.iter().map(Slot::as_child).collect();
                let pos = children
                    .iter()
                    .position(|&c| c == idx)
                    .expect("node missing from its parent");
                let mut coop = Vec::with_capacity(3);
                if pos > 0 {
                    coop.push(children[pos - 1]);
                }
                coop.push(idx);
                if pos + 1 < children.len() {
                    coop.push(children[pos + 1]);
                }
                coop
            }
            None => vec![idx],
        };

        // gather everything in Hilbert order; sibling concatenation is
        // already sorted because siblings are ordered by LHV
        let mut slots: Vec<Slot<T>> = Vec::new();
        for &node in &coop {
            slots.append(&mut self.nodes[node].slots);
        }
        let key = self.slot_key(&slot);
        let pos = slots
            .iter()
            .position(|s| self.slot_key(s) > key)
            .unwrap_or(slots.len());
        slots.insert(pos, slot);

        let new_node = if slots.len() <= coop.len() * self.max_entries {
            None
        } else {
            let fresh = self.alloc(self.nodes[idx].leaf);
            let at = coop.iter().position(|&c| c == idx).unwrap();
            coop.insert(at, fresh);
            Some(fresh)
        };

        self.distribute(slots, &coop);
        new_node
    }

    /// Spreads slots evenly across the given nodes, in order.
    fn distribute(&mut self, slots: Vec<Slot<T>>, targets: &[NodeIdx]) {
        let per_node = slots.len().div_ceil(targets.len());
        let mut slots = slots.into_iter();
        for &target in targets {
            let batch: Vec<Slot<T>> = slots.by_ref().take(per_node).collect();
            for slot in &batch {
                if let Slot::Child(child) = slot {
                    self.nodes[*child].parent = Some(target);
                }
            }
            self.nodes[target].slots = batch;
            self.adjust(target);
        }
    }

    /// Carries a split upward: links the new sibling into the parent,
    /// overflowing recursively, and grows a new root when the split
    /// reaches the top.
    fn propagate_split(&mut self, mut idx: NodeIdx, mut split: Option<NodeIdx>) {
        loop {
            let Some(new_node) = split else { return };
            match self.nodes[idx].parent {
                None => {
                    let new_root = self.alloc(false);
                    // keep children in LHV order
                    let (a, b) = if self.nodes[new_node].lhv <= self.nodes[idx].lhv {
                        (new_node, idx)
                    } else {
                        (idx, new_node)
                    };
                    self.nodes[new_root].slots = vec![Slot::Child(a), Slot::Child(b)];
                    self.nodes[a].parent = Some(new_root);
                    self.nodes[b].parent = Some(new_root);
                    self.adjust(new_root);
                    self.root = new_root;
                    return;
                }
                Some(parent) => {
                    split = if self.nodes[parent].has_capacity(self.max_entries) {
                        self.insert_slot(parent, Slot::Child(new_node));
                        None
                    } else {
                        self.handle_overflow(parent, Slot::Child(new_node))
                    };
                    idx = parent;
                }
            }
        }
    }
}
