//! Streaming spatial queries: a uniform predicate-driven traversal with
//! node-level early accept/reject, plus the specialised geometric filters,
//! k-nearest-neighbour and level queries built on top of it.

pub mod filters;
pub mod knn;
pub mod level;

use crate::error::Result;
use crate::octree::aabb::Aabb;
use crate::octree::cell::Cell;
use crate::octree::node::{to_absolute, AttributeRefs, Node};
use crate::progress::CancellationToken;
use glam::{DVec3, Vec3};

/// Per-node filter state; `FullyOutside` nodes are pruned without touching
/// their attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    FullyInside,
    Partial,
    FullyOutside,
}

/// The three predicates driving the uniform traversal.
pub trait SpatialFilter: Send + Sync {
    /// Node-level early accept/reject from the node's exact bounding box.
    fn classify(&self, bounds: &Aabb) -> FilterState;

    /// Per-point predicate, consulted for `Partial` nodes.
    fn contains(&self, point: DVec3) -> bool;
}

/// Passes every node and point; used to enumerate a whole tree.
pub struct Everything;

impl SpatialFilter for Everything {
    fn classify(&self, _bounds: &Aabb) -> FilterState {
        FilterState::FullyInside
    }

    fn contains(&self, _point: DVec3) -> bool {
        true
    }
}

/// One result batch: the served points of a single node, with whatever
/// attribute columns that node carries (absent columns stay `None`).
#[derive(Clone, Debug)]
pub struct QueryChunk {
    pub node_id: String,
    pub cell: Cell,
    pub positions: Vec<DVec3>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub normals: Option<Vec<Vec3>>,
    pub intensities: Option<Vec<i32>>,
    pub classifications: Option<Vec<u8>>,
}

impl QueryChunk {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Traversal floor: nodes at or below this cell exponent are served from
    /// their sample instead of being descended into.
    pub min_exponent: Option<i32>,
    pub cancel: CancellationToken,
}

/// Lazily traverses `root`, yielding the chunks selected by `filter`. The
/// iterator carries an explicit work stack so callers can stop mid-stream.
pub fn query<F: SpatialFilter>(root: &Node, filter: F, options: QueryOptions) -> QueryIter<F> {
    QueryIter {
        filter,
        options,
        stack: vec![root.clone()],
    }
}

/// Every point of the tree as a lazy chunk stream.
pub fn enumerate(root: &Node) -> QueryIter<Everything> {
    query(root, Everything, QueryOptions::default())
}

pub struct QueryIter<F> {
    filter: F,
    options: QueryOptions,
    stack: Vec<Node>,
}

impl<F: SpatialFilter> Iterator for QueryIter<F> {
    type Item = Result<QueryChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if let Err(err) = self.options.cancel.check() {
                return Some(Err(err));
            }
            let state = self.filter.classify(&node.bounding_box());
            if state == FilterState::FullyOutside {
                continue;
            }
            let at_floor = self
                .options
                .min_exponent
                .is_some_and(|floor| node.cell().exponent <= floor);
            let serve_data = if node.is_leaf() {
                Some(node.node_data())
            } else if at_floor && node.lod_data().has_positions() {
                // node-level data is absent on inner nodes; their published
                // LoD sample stands in for the subtree
                Some(node.lod_data())
            } else {
                None
            };
            if let Some(data) = serve_data {
                match serve_chunk(&node, data, state, &self.filter) {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => return Some(Ok(chunk)),
                    Err(err) => return Some(Err(err)),
                }
            }
            for child_ref in node.subnodes().iter().flatten() {
                match child_ref.node() {
                    Ok(child) => self.stack.push(child),
                    Err(err) => return Some(Err(err)),
                }
            }
        }
        None
    }
}

fn serve_chunk<F: SpatialFilter>(
    node: &Node,
    data: &AttributeRefs,
    state: FilterState,
    filter: &F,
) -> Result<QueryChunk> {
    let Some(relative) = data.positions()? else {
        return Ok(empty_chunk(node));
    };
    let positions = to_absolute(&relative, node.cell());
    let kept: Option<Vec<u32>> = match state {
        FilterState::Partial => Some(
            positions
                .iter()
                .enumerate()
                .filter(|(_, p)| filter.contains(**p))
                .map(|(i, _)| i as u32)
                .collect(),
        ),
        _ => None,
    };
    fn column<T: Copy>(values: Option<std::sync::Arc<Vec<T>>>, kept: &Option<Vec<u32>>) -> Option<Vec<T>> {
        values.map(|v| match kept {
            Some(kept) => kept.iter().map(|&i| v[i as usize]).collect(),
            None => v.to_vec(),
        })
    }
    let colors = column(data.colors()?, &kept);
    let normals = column(data.normals()?, &kept);
    let intensities = column(data.intensities()?, &kept);
    let classifications = column(data.classifications()?, &kept);
    let positions = match &kept {
        Some(kept) => kept.iter().map(|&i| positions[i as usize]).collect(),
        None => positions,
    };
    Ok(QueryChunk {
        node_id: node.id().to_string(),
        cell: node.cell(),
        positions,
        colors,
        normals,
        intensities,
        classifications,
    })
}

fn empty_chunk(node: &Node) -> QueryChunk {
    QueryChunk {
        node_id: node.id().to_string(),
        cell: node.cell(),
        positions: Vec::new(),
        colors: None,
        normals: None,
        intensities: None,
        classifications: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::octree::build::build_octree;
    use crate::octree::lod::generate_lod;
    use crate::storage::memory::MemoryBlobStore;
    use crate::storage::BlobStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn store() -> Arc<dyn BlobStore> {
        Arc::new(MemoryBlobStore::new())
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn random_tree(store: &Arc<dyn BlobStore>, count: usize, split_limit: usize) -> Node {
        let mut rng = StdRng::seed_from_u64(61);
        let positions: Vec<DVec3> = (0..count)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect();
        build_octree(store, Chunk::new(positions).unwrap(), split_limit, &cancel()).unwrap()
    }

    #[test]
    fn enumeration_yields_every_point_exactly_once() {
        let store = store();
        let root = random_tree(&store, 1200, 64);
        let total: usize = enumerate(&root).map(|c| c.unwrap().len()).sum();
        assert_eq!(total, 1200);
    }

    #[test]
    fn traversal_can_stop_mid_stream() {
        let store = store();
        let root = random_tree(&store, 1200, 64);
        let mut iter = enumerate(&root);
        let first = iter.next().unwrap().unwrap();
        assert!(!first.is_empty());
        drop(iter);
    }

    #[test]
    fn floor_serves_lod_samples() {
        let store = store();
        let root = random_tree(&store, 1500, 64);
        let root = generate_lod(root, 64, &cancel()).unwrap();
        let root_exponent = root.cell().exponent;
        let chunks: Vec<QueryChunk> = query(
            &root,
            Everything,
            QueryOptions {
                min_exponent: Some(root_exponent),
                cancel: cancel(),
            },
        )
        .collect::<Result<_>>()
        .unwrap();
        // the whole tree collapses into the root's LoD sample
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].len() <= 64);
        assert_eq!(chunks[0].node_id, root.id());
    }

    #[test]
    fn floor_without_lod_descends_instead_of_dropping_points() {
        let store = store();
        let root = random_tree(&store, 1500, 64);
        let root_exponent = root.cell().exponent;
        let total: usize = query(
            &root,
            Everything,
            QueryOptions {
                min_exponent: Some(root_exponent),
                cancel: cancel(),
            },
        )
        .map(|c| c.unwrap().len())
        .sum();
        assert_eq!(total, 1500);
    }

    #[test]
    fn cancelled_query_surfaces_the_error() {
        let store = store();
        let root = random_tree(&store, 100, 10);
        let token = cancel();
        token.cancel();
        let mut iter = query(
            &root,
            Everything,
            QueryOptions {
                min_exponent: None,
                cancel: token,
            },
        );
        assert!(matches!(
            iter.next(),
            Some(Err(crate::error::Error::Cancelled))
        ));
    }
}
