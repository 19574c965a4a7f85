use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::octree::cell::Cell;
use crate::octree::node::Node;
use crate::progress::CancellationToken;
use crate::storage::BlobStore;
use glam::DVec3;
use std::sync::Arc;

/// Cells below this exponent are never split further: positions closer than
/// `2^-64` are indistinguishable at the stored precision, so a cluster of
/// near-coincident points beyond the split limit stays in one leaf.
pub(crate) const MIN_LEAF_EXPONENT: i32 = -64;

/// Bulk-builds an octree from one chunk. Nodes are persisted post-order:
/// every child blob is written before its parent blob.
pub fn build_octree(
    store: &Arc<dyn BlobStore>,
    chunk: Chunk,
    split_limit: usize,
    cancel: &CancellationToken,
) -> Result<Node> {
    if split_limit == 0 {
        return Err(Error::InvalidConfig(
            "split_limit must be positive".to_string(),
        ));
    }
    if chunk.is_empty() {
        // sentinel empty node
        return Node::write_leaf(store, Cell::new(0, 0, 0, 0), &chunk);
    }
    let cell = Cell::containing(chunk.bounds());
    build_at_cell(store, cell, chunk, split_limit, cancel)
}

/// Recursive octant partition of `chunk` under `cell`, which must contain
/// every position of the chunk.
pub(crate) fn build_at_cell(
    store: &Arc<dyn BlobStore>,
    cell: Cell,
    chunk: Chunk,
    split_limit: usize,
    cancel: &CancellationToken,
) -> Result<Node> {
    cancel.check()?;
    if chunk.len() <= split_limit
        || cell.exponent <= MIN_LEAF_EXPONENT
        || all_coincident(chunk.positions())
    {
        return Node::write_leaf(store, cell, &chunk);
    }
    let mut buckets: [Vec<u32>; 8] = Default::default();
    for (index, p) in chunk.positions().iter().enumerate() {
        buckets[cell.octant_of_point(*p)].push(index as u32);
    }
    let mut children: [Option<Node>; 8] = Default::default();
    for (octant, indices) in buckets.iter().enumerate() {
        if indices.is_empty() {
            continue;
        }
        let child = build_at_cell(
            store,
            cell.child(octant),
            chunk.select(indices),
            split_limit,
            cancel,
        )?;
        children[octant] = Some(child);
    }
    Node::write_inner(store, cell, children)
}

fn all_coincident(points: &[DVec3]) -> bool {
    points.windows(2).all(|pair| pair[0] == pair[1])
}
