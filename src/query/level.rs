//! Level-of-detail queries: serve a tree at a bounded depth, fusing leaves
//! that sit higher up, and the approximate counting variants.

use crate::error::Result;
use crate::octree::node::Node;
use crate::progress::CancellationToken;
use crate::query::{query, Everything, FilterState, QueryIter, QueryOptions, SpatialFilter};

/// Cell exponent corresponding to `level` steps below the root.
fn floor_exponent(root: &Node, level: u32) -> i32 {
    root.cell().exponent - level as i32
}

/// The whole tree at a bounded depth: nodes `level` steps below the root
/// serve their LoD sample, leaves higher up serve themselves.
pub fn points_at_level(root: &Node, level: u32, cancel: CancellationToken) -> QueryIter<Everything> {
    points_in_region_at_level(root, Everything, level, cancel)
}

/// Region query with a depth budget.
pub fn points_in_region_at_level<F: SpatialFilter>(
    root: &Node,
    filter: F,
    level: u32,
    cancel: CancellationToken,
) -> QueryIter<F> {
    query(
        root,
        filter,
        QueryOptions {
            min_exponent: Some(floor_exponent(root, level)),
            cancel,
        },
    )
}

/// Approximate number of points a depth-bounded region query would yield.
///
/// Nodes that are only partially inside the region are counted whole, so the
/// result is an overestimate of the exact count; fully inside and fully
/// outside subtrees are exact.
pub fn count_points_in_region_at_level<F: SpatialFilter>(
    root: &Node,
    filter: &F,
    level: u32,
    cancel: &CancellationToken,
) -> Result<u64> {
    count_node(root, filter, floor_exponent(root, level), cancel)
}

fn count_node<F: SpatialFilter>(
    node: &Node,
    filter: &F,
    floor: i32,
    cancel: &CancellationToken,
) -> Result<u64> {
    cancel.check()?;
    match filter.classify(&node.bounding_box()) {
        FilterState::FullyOutside => Ok(0),
        FilterState::FullyInside => Ok(served_count(node, floor, cancel)?),
        FilterState::Partial => {
            if node.is_leaf() {
                return Ok(node.point_count_node());
            }
            if node.cell().exponent <= floor {
                if let Some(count) = lod_count(node)? {
                    return Ok(count);
                }
            }
            let mut sum = 0;
            for child_ref in node.subnodes().iter().flatten() {
                sum += count_node(&child_ref.node()?, filter, floor, cancel)?;
            }
            Ok(sum)
        }
    }
}

/// Number of points the traversal would serve for a fully accepted node.
fn served_count(node: &Node, floor: i32, cancel: &CancellationToken) -> Result<u64> {
    cancel.check()?;
    if node.is_leaf() {
        return Ok(node.point_count_node());
    }
    if node.cell().exponent <= floor {
        if let Some(count) = lod_count(node)? {
            return Ok(count);
        }
    }
    let mut sum = 0;
    for child_ref in node.subnodes().iter().flatten() {
        sum += served_count(&child_ref.node()?, floor, cancel)?;
    }
    Ok(sum)
}

fn lod_count(node: &Node) -> Result<Option<u64>> {
    Ok(node
        .lod_data()
        .positions()?
        .map(|positions| positions.len() as u64))
}
