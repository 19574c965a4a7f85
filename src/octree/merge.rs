use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::octree::build::build_at_cell;
use crate::octree::cell::Cell;
use crate::octree::node::Node;
use crate::progress::CancellationToken;
use crate::storage::BlobStore;
use std::sync::Arc;
use tracing::debug;

/// One side of a pending combine: an already persisted subtree, or loose
/// points extracted from a leaf that is being pushed down or re-split.
enum Source {
    Tree(Node),
    Points(Chunk),
}

/// A source normalized against the cell currently being produced.
enum Form {
    /// Loose points belonging anywhere in the cell.
    Points(Chunk),
    /// Per-octant contributions.
    Slots([Option<Source>; 8]),
}

/// Merges two octrees whose root cells may differ in size and position.
///
/// The sides are aligned into their smallest common enclosing cell and
/// combined recursively; overlapping leaves are concatenated and re-split
/// where the split limit requires it. Subtrees only one side touches are
/// reused as-is (lifted through forwarding wrappers where the cells differ).
/// Point order is not preserved; stale LoD samples are discarded.
pub fn merge_octrees(
    store: &Arc<dyn BlobStore>,
    a: Node,
    b: Node,
    split_limit: usize,
    cancel: &CancellationToken,
) -> Result<Node> {
    // an empty sentinel merges away
    if a.point_count_tree() == 0 {
        return Ok(b);
    }
    if b.point_count_tree() == 0 {
        return Ok(a);
    }
    let root_cell = Cell::common_root(&a.cell(), &b.cell());
    let expected = a.point_count_tree() + b.point_count_tree();
    debug!(
        a = %a.id(),
        b = %b.id(),
        expected,
        "merging octrees into {:?}", root_cell
    );
    let merged = combine(
        store,
        root_cell,
        Some(Source::Tree(a)),
        Some(Source::Tree(b)),
        split_limit,
        cancel,
    )?
    .ok_or_else(|| Error::InvariantViolation("merge produced an empty tree".to_string()))?;
    if merged.point_count_tree() != expected {
        return Err(Error::InvariantViolation(format!(
            "merge lost points: expected {expected}, produced {}",
            merged.point_count_tree()
        )));
    }
    Ok(merged)
}

fn combine(
    store: &Arc<dyn BlobStore>,
    cell: Cell,
    a: Option<Source>,
    b: Option<Source>,
    split_limit: usize,
    cancel: &CancellationToken,
) -> Result<Option<Node>> {
    cancel.check()?;
    match (a, b) {
        (None, None) => Ok(None),
        (Some(one), None) | (None, Some(one)) => {
            place(store, cell, one, split_limit, cancel).map(Some)
        }
        (Some(a), Some(b)) => {
            let a = decompose(cell, a)?;
            let b = decompose(cell, b)?;
            match (a, b) {
                (Form::Points(pa), Form::Points(pb)) => {
                    let joined = pa.concat(pb);
                    if joined.len() <= split_limit {
                        Node::write_leaf(store, cell, &joined).map(Some)
                    } else {
                        // re-split the concatenation on the shared cell
                        build_at_cell(store, cell, joined, split_limit, cancel).map(Some)
                    }
                }
                (Form::Points(points), Form::Slots(slots))
                | (Form::Slots(slots), Form::Points(points)) => {
                    merge_slots(store, cell, slots, split_points(cell, points), split_limit, cancel)
                        .map(Some)
                }
                (Form::Slots(sa), Form::Slots(sb)) => {
                    merge_slots(store, cell, sa, sb, split_limit, cancel).map(Some)
                }
            }
        }
    }
}

/// Combines the eight child slots pairwise and writes the shared inner node.
fn merge_slots(
    store: &Arc<dyn BlobStore>,
    cell: Cell,
    a: [Option<Source>; 8],
    b: [Option<Source>; 8],
    split_limit: usize,
    cancel: &CancellationToken,
) -> Result<Node> {
    let mut children: [Option<Node>; 8] = Default::default();
    for (octant, (sa, sb)) in a.into_iter().zip(b).enumerate() {
        children[octant] = combine(store, cell.child(octant), sa, sb, split_limit, cancel)?;
    }
    Node::write_inner(store, cell, children)
}

/// Normalizes one side against `cell`. A tree at the cell itself yields its
/// points (leaf) or direct children (inner); a deeper tree lands in the
/// octant its cell belongs to. A deeper *centered* cell straddles all
/// octants and is unfolded instead.
fn decompose(cell: Cell, source: Source) -> Result<Form> {
    let node = match source {
        Source::Points(chunk) => return Ok(Form::Points(chunk)),
        Source::Tree(node) => node,
    };
    if node.cell() == cell {
        if node.is_leaf() {
            return Ok(Form::Points(node.extract_chunk()?));
        }
        let mut slots: [Option<Source>; 8] = Default::default();
        for (octant, child_ref) in node.subnodes().iter().enumerate() {
            if let Some(child_ref) = child_ref {
                slots[octant] = Some(Source::Tree(child_ref.node()?));
            }
        }
        return Ok(Form::Slots(slots));
    }
    debug_assert!(cell.contains_cell(&node.cell()));
    if node.cell().is_centered() {
        if node.is_leaf() {
            return Ok(Form::Points(node.extract_chunk()?));
        }
        // children of a centered cell are ordinary corner cells, one per octant
        let mut slots: [Option<Source>; 8] = Default::default();
        for child_ref in node.subnodes().iter().flatten() {
            let child = child_ref.node()?;
            let octant = cell.octant_of_cell(&child.cell());
            debug_assert!(slots[octant].is_none());
            slots[octant] = Some(Source::Tree(child));
        }
        return Ok(Form::Slots(slots));
    }
    let mut slots: [Option<Source>; 8] = Default::default();
    let octant = cell.octant_of_cell(&node.cell());
    slots[octant] = Some(Source::Tree(node));
    Ok(Form::Slots(slots))
}

/// Produces a node exactly at `cell` from a single remaining source.
fn place(
    store: &Arc<dyn BlobStore>,
    cell: Cell,
    source: Source,
    split_limit: usize,
    cancel: &CancellationToken,
) -> Result<Node> {
    let node = match source {
        Source::Points(chunk) => {
            return build_at_cell(store, cell, chunk, split_limit, cancel);
        }
        Source::Tree(node) => node,
    };
    if node.cell() == cell {
        // untouched subtree, reuse without rewriting
        return Ok(node);
    }
    if node.cell().is_centered() {
        // a smaller centered tree straddles every octant: unfold it
        let slots = match decompose(cell, Source::Tree(node))? {
            Form::Points(chunk) => {
                return build_at_cell(store, cell, chunk, split_limit, cancel);
            }
            Form::Slots(slots) => slots,
        };
        return merge_slots(store, cell, slots, Default::default(), split_limit, cancel);
    }
    // lift through forwarding wrappers, one level at a time
    let mut node = node;
    loop {
        if node.cell() == cell {
            return Ok(node);
        }
        let wrapper_cell = if cell.is_centered() && node.cell().exponent == cell.exponent - 1 {
            cell
        } else {
            node.cell().parent()
        };
        node = Node::write_linked(store, wrapper_cell, &node)?;
    }
}

/// Partitions loose points into per-octant sources.
fn split_points(cell: Cell, chunk: Chunk) -> [Option<Source>; 8] {
    let mut buckets: [Vec<u32>; 8] = Default::default();
    for (index, p) in chunk.positions().iter().enumerate() {
        buckets[cell.octant_of_point(*p)].push(index as u32);
    }
    let mut slots: [Option<Source>; 8] = Default::default();
    for (octant, indices) in buckets.iter().enumerate() {
        if !indices.is_empty() {
            slots[octant] = Some(Source::Points(chunk.select(indices)));
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::build::build_octree;
    use crate::octree::node::NodeType;
    use crate::storage::memory::MemoryBlobStore;
    use glam::DVec3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn store() -> Arc<dyn BlobStore> {
        Arc::new(MemoryBlobStore::new())
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    /// Random points snapped to a dyadic grid so the cell-relative storage
    /// is exact and multisets can be compared without tolerance.
    fn dyadic_points(rng: &mut StdRng, count: usize, offset: DVec3) -> Vec<DVec3> {
        (0..count)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0..1024) as f64 / 1024.0,
                    rng.gen_range(0..1024) as f64 / 1024.0,
                    rng.gen_range(0..1024) as f64 / 1024.0,
                ) + offset
            })
            .collect()
    }

    fn collect_points(node: &Node, out: &mut Vec<DVec3>) {
        out.extend(node.absolute_positions().unwrap());
        for child_ref in node.subnodes().iter().flatten() {
            collect_points(&child_ref.node().unwrap(), out);
        }
    }

    fn sorted_points(node: &Node) -> Vec<(u64, u64, u64)> {
        let mut points = Vec::new();
        collect_points(node, &mut points);
        let mut keys: Vec<(u64, u64, u64)> = points
            .iter()
            .map(|p| (p.x.to_bits(), p.y.to_bits(), p.z.to_bits()))
            .collect();
        keys.sort_unstable();
        keys
    }

    fn multiset_of(points: &[DVec3]) -> Vec<(u64, u64, u64)> {
        let mut keys: Vec<(u64, u64, u64)> = points
            .iter()
            .map(|p| (p.x.to_bits(), p.y.to_bits(), p.z.to_bits()))
            .collect();
        keys.sort_unstable();
        keys
    }

    fn build(store: &Arc<dyn BlobStore>, points: Vec<DVec3>, split_limit: usize) -> Node {
        build_octree(store, Chunk::new(points).unwrap(), split_limit, &cancel()).unwrap()
    }

    #[test]
    fn merging_small_leaves_concatenates() {
        let store = store();
        let a = build(&store, vec![DVec3::new(0.25, 0.25, 0.25)], 10);
        let b = build(&store, vec![DVec3::new(0.75, 0.75, 0.75)], 10);
        let merged = merge_octrees(&store, a, b, 10, &cancel()).unwrap();
        assert_eq!(merged.point_count_tree(), 2);
        assert_eq!(sorted_points(&merged).len(), 2);
    }

    #[test]
    fn merge_preserves_the_point_multiset() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(5);
        let pa = dyadic_points(&mut rng, 1500, DVec3::ZERO);
        let pb = dyadic_points(&mut rng, 1500, DVec3::splat(0.5));
        let mut expected: Vec<DVec3> = pa.clone();
        expected.extend(&pb);
        let a = build(&store, pa, 100);
        let b = build(&store, pb, 100);
        let merged = merge_octrees(&store, a, b, 100, &cancel()).unwrap();
        assert_eq!(merged.point_count_tree(), 3000);
        assert_eq!(sorted_points(&merged), multiset_of(&expected));
    }

    #[test]
    fn merge_is_commutative_on_the_multiset() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(17);
        let pa = dyadic_points(&mut rng, 400, DVec3::ZERO);
        let pb = dyadic_points(&mut rng, 400, DVec3::splat(0.25));
        let ab = merge_octrees(
            &store,
            build(&store, pa.clone(), 50),
            build(&store, pb.clone(), 50),
            50,
            &cancel(),
        )
        .unwrap();
        let ba = merge_octrees(
            &store,
            build(&store, pb, 50),
            build(&store, pa, 50),
            50,
            &cancel(),
        )
        .unwrap();
        assert_eq!(sorted_points(&ab), sorted_points(&ba));
    }

    #[test]
    fn merge_is_associative_on_the_multiset() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(23);
        let pa = dyadic_points(&mut rng, 300, DVec3::ZERO);
        let pb = dyadic_points(&mut rng, 300, DVec3::new(1.0, 0.0, 0.0));
        let pc = dyadic_points(&mut rng, 300, DVec3::new(0.0, 1.0, 0.0));
        let t = |points: &Vec<DVec3>| build(&store, points.clone(), 64);
        let left = merge_octrees(
            &store,
            merge_octrees(&store, t(&pa), t(&pb), 64, &cancel()).unwrap(),
            t(&pc),
            64,
            &cancel(),
        )
        .unwrap();
        let right = merge_octrees(
            &store,
            t(&pa),
            merge_octrees(&store, t(&pb), t(&pc), 64, &cancel()).unwrap(),
            64,
            &cancel(),
        )
        .unwrap();
        assert_eq!(sorted_points(&left), sorted_points(&right));
    }

    #[test]
    fn disjoint_trees_are_lifted_with_linked_nodes() {
        let store = store();
        // two dense clusters in far-apart cells: neither side is rebuilt
        let a = build(
            &store,
            (0..20).map(|i| DVec3::new(i as f64 / 64.0, 0.0, 0.0)).collect(),
            8,
        );
        let b = build(
            &store,
            (0..20)
                .map(|i| DVec3::new(64.0 + i as f64 / 64.0, 0.0, 0.0))
                .collect(),
            8,
        );
        let merged = merge_octrees(&store, a, b, 8, &cancel()).unwrap();
        assert_eq!(merged.point_count_tree(), 40);
        // somewhere below the root there must be forwarding wrappers
        fn has_linked(node: &Node) -> bool {
            node.node_type() == NodeType::LinkedNode
                || node
                    .subnodes()
                    .iter()
                    .flatten()
                    .any(|r| has_linked(&r.node().unwrap()))
        }
        assert!(has_linked(&merged));
    }

    #[test]
    fn opposite_sides_of_the_origin_merge_under_a_centered_root() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(31);
        let pa = dyadic_points(&mut rng, 200, DVec3::ZERO);
        let pb = dyadic_points(&mut rng, 200, DVec3::splat(-2.0));
        let mut expected = pa.clone();
        expected.extend(&pb);
        let merged = merge_octrees(
            &store,
            build(&store, pa, 32),
            build(&store, pb, 32),
            32,
            &cancel(),
        )
        .unwrap();
        assert!(merged.cell().is_centered());
        assert_eq!(sorted_points(&merged), multiset_of(&expected));
    }

    #[test]
    fn overflowing_leaves_resplit() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(37);
        // both sides fit their split limit alone, together they must split
        let pa = dyadic_points(&mut rng, 60, DVec3::ZERO);
        let pb = dyadic_points(&mut rng, 60, DVec3::ZERO);
        let mut expected = pa.clone();
        expected.extend(&pb);
        let merged = merge_octrees(
            &store,
            build(&store, pa, 100),
            build(&store, pb, 100),
            100,
            &cancel(),
        )
        .unwrap();
        assert!(!merged.is_leaf());
        assert_eq!(merged.point_count_tree(), 120);
        assert_eq!(sorted_points(&merged), multiset_of(&expected));
    }

    #[test]
    fn merging_with_the_empty_sentinel_is_identity() {
        let store = store();
        let empty = build(&store, Vec::new(), 10);
        let tree = build(&store, vec![DVec3::splat(0.5)], 10);
        let merged = merge_octrees(&store, empty.clone(), tree.clone(), 10, &cancel()).unwrap();
        assert_eq!(merged.id(), tree.id());
        let merged = merge_octrees(&store, tree.clone(), empty.clone(), 10, &cancel()).unwrap();
        assert_eq!(merged.id(), tree.id());
        let merged = merge_octrees(&store, empty.clone(), empty, 10, &cancel()).unwrap();
        assert_eq!(merged.point_count_tree(), 0);
    }
}
