//! A Hilbert-packed R-tree.
//!
//! Spatial index over grid points used by each locally owned curve
//! interval. Entries are kept in Hilbert order inside every node, which
//! makes insertion deterministic and keeps node rectangles compact:
//!
//! - **Insert** descends by Largest Hilbert Value (LHV), and overflow is
//!   absorbed by redistributing across a node's cooperating siblings
//!   before a new node is allocated.
//! - **Search** is the usual rectangle intersection walk.
//! - **Remove** deletes a leaf entry and re-tightens bounding boxes on
//!   the path to the root.
//!
//! Nodes live in an arena owned by the tree and are addressed by index,
//! so parent/sibling links never form ownership cycles; the arena is
//! dropped wholesale with the tree.

mod node;
mod rect;
mod tree;

pub use node::LeafEntry;
pub use rect::{GridPoint, Rect};
pub use tree::RTree;
