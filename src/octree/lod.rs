use crate::error::Result;
use crate::kdtree::KdTree;
use crate::octree::node::{to_absolute, to_relative, AttributeArrays, Node, NodeType};
use crate::progress::CancellationToken;
use glam::{DVec3, Vec3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// Bottom-up LoD pass: every inner node is republished under its id with a
/// representative sample of at most `split_limit` points drawn from its
/// children, stratified by subtree size. Leaves already are their own LoD.
/// Sampling is deterministic: the RNG seed derives from the node id.
pub fn generate_lod(root: Node, split_limit: usize, cancel: &CancellationToken) -> Result<Node> {
    lod_node(root, split_limit, cancel)
}

fn lod_node(node: Node, split_limit: usize, cancel: &CancellationToken) -> Result<Node> {
    cancel.check()?;
    if node.is_leaf() {
        return Ok(node);
    }
    let mut children: [Option<Node>; 8] = Default::default();
    for (octant, child_ref) in node.subnodes().iter().enumerate() {
        if let Some(child_ref) = child_ref {
            children[octant] = Some(lod_node(child_ref.node()?, split_limit, cancel)?);
        }
    }
    if node.lod_data().has_positions() && node.node_type() == NodeType::PointCloudNode {
        // already published in a previous pass
        return Ok(node);
    }

    let mut pools = Vec::new();
    for child in children.iter().flatten() {
        pools.push(Pool::gather(child)?);
    }
    let weights: Vec<u64> = pools.iter().map(|p| p.weight).collect();
    let available: Vec<usize> = pools.iter().map(|p| p.positions.len()).collect();
    let quotas = proportional_quotas(split_limit, &weights, &available);

    let mut rng = StdRng::seed_from_u64(seed_for(node.id()));
    let cell = node.cell();
    let mut positions: Vec<Vec3> = Vec::new();
    let keep_colors = pools.iter().all(|p| p.colors.is_some());
    let keep_normals = pools.iter().all(|p| p.normals.is_some());
    let keep_intensities = pools.iter().all(|p| p.intensities.is_some());
    let keep_classifications = pools.iter().all(|p| p.classifications.is_some());
    let mut colors = keep_colors.then(Vec::new);
    let mut normals = keep_normals.then(Vec::new);
    let mut intensities = keep_intensities.then(Vec::new);
    let mut classifications = keep_classifications.then(Vec::new);
    for (pool, quota) in pools.iter().zip(&quotas) {
        for index in pool.sample_indices(*quota, &mut rng) {
            positions.push(to_relative(pool.positions[index], cell));
            if let (Some(colors), Some(values)) = (colors.as_mut(), &pool.colors) {
                colors.push(values[index]);
            }
            if let (Some(normals), Some(values)) = (normals.as_mut(), &pool.normals) {
                normals.push(values[index]);
            }
            if let (Some(intensities), Some(values)) = (intensities.as_mut(), &pool.intensities) {
                intensities.push(values[index]);
            }
            if let (Some(classifications), Some(values)) =
                (classifications.as_mut(), &pool.classifications)
            {
                classifications.push(values[index]);
            }
        }
    }
    debug!(
        id = %node.id(),
        sampled = positions.len(),
        "publishing LoD sample"
    );
    let kd_tree = KdTree::build(&positions);
    node.republish_with(
        AttributeArrays {
            positions: Some(positions),
            colors,
            normals,
            intensities,
            classifications,
            kd_tree: Some(kd_tree),
        },
        true,
        Some(children),
    )
}

/// One child's LoD pool: its own points for a leaf, its published LoD sample
/// for an inner node, in absolute coordinates.
struct Pool {
    weight: u64,
    positions: Vec<DVec3>,
    colors: Option<Arc<Vec<[u8; 4]>>>,
    normals: Option<Arc<Vec<Vec3>>>,
    intensities: Option<Arc<Vec<i32>>>,
    classifications: Option<Arc<Vec<u8>>>,
}

impl Pool {
    fn gather(child: &Node) -> Result<Pool> {
        let data = if child.is_leaf() {
            child.node_data()
        } else {
            child.lod_data()
        };
        let relative = data.positions()?.unwrap_or_default();
        Ok(Pool {
            weight: child.point_count_tree(),
            positions: to_absolute(&relative, child.cell()),
            colors: data.colors()?,
            normals: data.normals()?,
            intensities: data.intensities()?,
            classifications: data.classifications()?,
        })
    }

    /// `quota` distinct indices, the whole pool when it fits.
    fn sample_indices(&self, quota: usize, rng: &mut StdRng) -> Vec<usize> {
        if quota >= self.positions.len() {
            return (0..self.positions.len()).collect();
        }
        let mut indices = rand::seq::index::sample(rng, self.positions.len(), quota).into_vec();
        indices.sort_unstable();
        indices
    }
}

/// Proportional allocation of `target` slots by subtree weight, clamped to
/// each pool's availability; leftover slots go to the most underfilled pools.
fn proportional_quotas(target: usize, weights: &[u64], available: &[usize]) -> Vec<usize> {
    let total_available: usize = available.iter().sum();
    if total_available <= target {
        return available.to_vec();
    }
    let total_weight: u64 = weights.iter().sum::<u64>().max(1);
    let ideal: Vec<f64> = weights
        .iter()
        .map(|w| target as f64 * *w as f64 / total_weight as f64)
        .collect();
    let mut quotas: Vec<usize> = ideal
        .iter()
        .zip(available)
        .map(|(share, avail)| (share.floor() as usize).min(*avail))
        .collect();
    let mut leftover = target - quotas.iter().sum::<usize>();
    while leftover > 0 {
        let candidate = ideal
            .iter()
            .enumerate()
            .filter(|(i, _)| quotas[*i] < available[*i])
            .max_by(|(i, a), (j, b)| {
                let da = *a - quotas[*i] as f64;
                let db = *b - quotas[*j] as f64;
                da.total_cmp(&db)
            })
            .map(|(i, _)| i);
        let Some(index) = candidate else {
            break;
        };
        quotas[index] += 1;
        leftover -= 1;
    }
    quotas
}

fn seed_for(id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::octree::build::build_octree;
    use crate::storage::memory::MemoryBlobStore;
    use crate::storage::BlobStore;
    use rand::Rng;

    fn store() -> Arc<dyn BlobStore> {
        Arc::new(MemoryBlobStore::new())
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn check_lod(node: &Node, split_limit: usize) {
        if node.is_leaf() {
            assert!(!node.lod_data().has_positions());
            return;
        }
        let lod = node.lod_data().positions().unwrap().expect("inner LoD");
        assert!(!lod.is_empty());
        assert!(lod.len() <= split_limit);
        assert!(node.lod_data().has_kd_tree());
        for p in to_absolute(&lod, node.cell()) {
            assert!(node.cell().contains_point(p));
        }
        for child_ref in node.subnodes().iter().flatten() {
            check_lod(&child_ref.node().unwrap(), split_limit);
        }
    }

    #[test]
    fn every_inner_node_gets_a_bounded_sample() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(3);
        let positions: Vec<DVec3> = (0..3000)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect();
        let root = build_octree(&store, Chunk::new(positions).unwrap(), 100, &cancel()).unwrap();
        let root = generate_lod(root, 100, &cancel()).unwrap();
        check_lod(&root, 100);
    }

    #[test]
    fn lod_pass_is_idempotent() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(9);
        let positions: Vec<DVec3> = (0..500)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect();
        let root = build_octree(&store, Chunk::new(positions).unwrap(), 50, &cancel()).unwrap();
        let once = generate_lod(root, 50, &cancel()).unwrap();
        let first = once.lod_data().positions().unwrap().unwrap();
        let twice = generate_lod(once, 50, &cancel()).unwrap();
        let second = twice.lod_data().positions().unwrap().unwrap();
        assert_eq!(first.as_slice(), second.as_slice());
    }

    #[test]
    fn lod_keeps_attribute_columns_when_all_children_have_them() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(15);
        let positions: Vec<DVec3> = (0..600)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect();
        let intensities: Vec<i32> = (0..600).collect();
        let chunk = Chunk::new(positions)
            .unwrap()
            .with_intensities(intensities)
            .unwrap();
        let root = build_octree(&store, chunk, 64, &cancel()).unwrap();
        let root = generate_lod(root, 64, &cancel()).unwrap();
        let lod_positions = root.lod_data().positions().unwrap().unwrap();
        let lod_intensities = root.lod_data().intensities().unwrap().unwrap();
        assert_eq!(lod_positions.len(), lod_intensities.len());
        assert!(!root.lod_data().has_colors());
    }

    #[test]
    fn republished_nodes_keep_their_ids() {
        let store = store();
        let mut rng = StdRng::seed_from_u64(21);
        let positions: Vec<DVec3> = (0..400)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect();
        let root = build_octree(&store, Chunk::new(positions).unwrap(), 50, &cancel()).unwrap();
        let id = root.id().to_string();
        let root = generate_lod(root, 50, &cancel()).unwrap();
        assert_eq!(root.id(), id);
        // the re-loaded node carries both families
        let loaded = Node::load(&store, &id).unwrap();
        assert!(loaded.lod_data().has_positions());
        assert!(!loaded.is_leaf());
    }
}
