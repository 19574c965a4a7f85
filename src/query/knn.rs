//! k-nearest-neighbour and near-ray queries, dispatching to the per-leaf
//! kd-trees and pruning by node bounding boxes.

use crate::error::{Error, Result};
use crate::octree::aabb::Aabb;
use crate::octree::node::{AttributeRefs, Node};
use crate::progress::CancellationToken;
use glam::{DVec3, Vec3};
use std::collections::BinaryHeap;

/// Per-leaf cap on near-ray hits.
const NEAR_RAY_LEAF_CAP: usize = 1000;

/// A single result point with whatever attributes its node carries.
#[derive(Clone, Debug)]
pub struct PointSample {
    pub position: DVec3,
    pub color: Option<[u8; 4]>,
    pub normal: Option<Vec3>,
    pub intensity: Option<i32>,
    pub classification: Option<u8>,
    pub distance: f64,
}

/// The up-to-`k` closest points to `query` within `radius`, sorted by
/// distance.
pub fn k_nearest(
    root: &Node,
    query: DVec3,
    radius: f64,
    k: usize,
    cancel: &CancellationToken,
) -> Result<Vec<PointSample>> {
    if k == 0 || radius < 0.0 {
        return Ok(Vec::new());
    }
    let mut heap = BinaryHeap::with_capacity(k + 1);
    nearest_in_node(root, query, radius, k, cancel, &mut heap)?;
    Ok(drain_sorted(heap))
}

fn nearest_in_node(
    node: &Node,
    query: DVec3,
    radius: f64,
    k: usize,
    cancel: &CancellationToken,
    heap: &mut BinaryHeap<Candidate>,
) -> Result<()> {
    cancel.check()?;
    let bound = current_bound(heap, k, radius);
    if node.bounding_box().distance_to_point(query) > bound {
        return Ok(());
    }
    if node.is_leaf() {
        let data = node.node_data();
        let Some(relative) = data.positions()? else {
            return Ok(());
        };
        let Some(kd_tree) = data.kd_tree()? else {
            return Ok(());
        };
        let center = node.cell().center();
        let local_query = (query - center).as_vec3();
        // the kd lookup runs in single precision; widen the radius a little
        // and let the double-precision recheck decide the borderline hits
        let kd_radius = (bound * (1.0 + 1e-5)) as f32 + f32::MIN_POSITIVE;
        for (index, _) in kd_tree.k_nearest(&relative, local_query, kd_radius, k) {
            let position = center + relative[index as usize].as_dvec3();
            let distance = (position - query).length();
            if distance > radius {
                continue;
            }
            push_candidate(heap, k, sample_at(data, index as usize, position, distance)?);
        }
        return Ok(());
    }
    // nearest child first, the rest pruned by their box distance
    let mut children = Vec::new();
    for child_ref in node.subnodes().iter().flatten() {
        let child = child_ref.node()?;
        let distance = child.bounding_box().distance_to_point(query);
        children.push((distance, child));
    }
    children.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (distance, child) in children {
        if distance > current_bound(heap, k, radius) {
            break;
        }
        nearest_in_node(&child, query, radius, k, cancel, heap)?;
    }
    Ok(())
}

/// All points within `radius` of the ray from `origin` along `direction`,
/// sorted by distance to the ray segment inside the tree, with a hard cap of
/// 1000 hits per leaf.
pub fn near_ray(
    root: &Node,
    origin: DVec3,
    direction: DVec3,
    radius: f64,
    cancel: &CancellationToken,
) -> Result<Vec<PointSample>> {
    if direction.length_squared() == 0.0 {
        return Err(Error::InvalidConfig(
            "ray direction must be non-zero".to_string(),
        ));
    }
    // clip the ray against the inflated root box; a miss yields nothing
    let bounds = root.bounding_box().inflated(radius);
    let Some((t0, t1)) = clip_ray(&bounds, origin, direction) else {
        return Ok(Vec::new());
    };
    let p0 = origin + direction * t0;
    let p1 = origin + direction * t1;
    let mut samples = Vec::new();
    near_segment_in_node(root, p0, p1, radius, cancel, &mut samples)?;
    samples.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    Ok(samples)
}

fn near_segment_in_node(
    node: &Node,
    p0: DVec3,
    p1: DVec3,
    radius: f64,
    cancel: &CancellationToken,
    samples: &mut Vec<PointSample>,
) -> Result<()> {
    cancel.check()?;
    if !segment_intersects(&node.bounding_box().inflated(radius), p0, p1) {
        return Ok(());
    }
    if node.is_leaf() {
        let data = node.node_data();
        let Some(relative) = data.positions()? else {
            return Ok(());
        };
        let Some(kd_tree) = data.kd_tree()? else {
            return Ok(());
        };
        let center = node.cell().center();
        let local_p0 = (p0 - center).as_vec3();
        let local_p1 = (p1 - center).as_vec3();
        let kd_radius = (radius * (1.0 + 1e-5)) as f32 + f32::MIN_POSITIVE;
        for (index, _) in
            kd_tree.near_line(&relative, local_p0, local_p1, kd_radius, NEAR_RAY_LEAF_CAP)
        {
            let position = center + relative[index as usize].as_dvec3();
            let distance = segment_distance(position, p0, p1);
            if distance > radius {
                continue;
            }
            samples.push(sample_at(data, index as usize, position, distance)?);
        }
        return Ok(());
    }
    for child_ref in node.subnodes().iter().flatten() {
        near_segment_in_node(&child_ref.node()?, p0, p1, radius, cancel, samples)?;
    }
    Ok(())
}

fn sample_at(
    data: &AttributeRefs,
    index: usize,
    position: DVec3,
    distance: f64,
) -> Result<PointSample> {
    Ok(PointSample {
        position,
        color: data.colors()?.map(|v| v[index]),
        normal: data.normals()?.map(|v| v[index]),
        intensity: data.intensities()?.map(|v| v[index]),
        classification: data.classifications()?.map(|v| v[index]),
        distance,
    })
}

struct Candidate(PointSample);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .distance
            .total_cmp(&other.0.distance)
            .then_with(|| {
                let a = self.0.position;
                let b = other.0.position;
                (a.x.to_bits(), a.y.to_bits(), a.z.to_bits()).cmp(&(
                    b.x.to_bits(),
                    b.y.to_bits(),
                    b.z.to_bits(),
                ))
            })
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn push_candidate(heap: &mut BinaryHeap<Candidate>, k: usize, sample: PointSample) {
    heap.push(Candidate(sample));
    if heap.len() > k {
        heap.pop();
    }
}

fn current_bound(heap: &BinaryHeap<Candidate>, k: usize, radius: f64) -> f64 {
    if heap.len() == k {
        heap.peek().expect("non-empty heap").0.distance
    } else {
        radius
    }
}

fn drain_sorted(heap: BinaryHeap<Candidate>) -> Vec<PointSample> {
    heap.into_sorted_vec()
        .into_iter()
        .map(|candidate| candidate.0)
        .collect()
}

/// Slab clipping of the ray `origin + t * direction`, `t >= 0`, against a
/// box. Zero direction components degenerate to an origin-inside-slab test,
/// which also covers rays tangent to a face.
fn clip_ray(bounds: &Aabb, origin: DVec3, direction: DVec3) -> Option<(f64, f64)> {
    let mut t0: f64 = 0.0;
    let mut t1 = f64::INFINITY;
    for axis in 0..3 {
        let d = direction[axis];
        if d == 0.0 {
            if origin[axis] < bounds.min[axis] || origin[axis] > bounds.max[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / d;
        let mut near = (bounds.min[axis] - origin[axis]) * inv;
        let mut far = (bounds.max[axis] - origin[axis]) * inv;
        if near > far {
            std::mem::swap(&mut near, &mut far);
        }
        t0 = t0.max(near);
        t1 = t1.min(far);
        if t1 < t0 {
            return None;
        }
    }
    Some((t0, t1))
}

/// Segment-box intersection via the same slab test on `t` in `[0, 1]`.
fn segment_intersects(bounds: &Aabb, p0: DVec3, p1: DVec3) -> bool {
    let direction = p1 - p0;
    let mut t0: f64 = 0.0;
    let mut t1: f64 = 1.0;
    for axis in 0..3 {
        let d = direction[axis];
        if d == 0.0 {
            if p0[axis] < bounds.min[axis] || p0[axis] > bounds.max[axis] {
                return false;
            }
            continue;
        }
        let inv = 1.0 / d;
        let mut near = (bounds.min[axis] - p0[axis]) * inv;
        let mut far = (bounds.max[axis] - p0[axis]) * inv;
        if near > far {
            std::mem::swap(&mut near, &mut far);
        }
        t0 = t0.max(near);
        t1 = t1.min(far);
        if t1 < t0 {
            return false;
        }
    }
    true
}

fn segment_distance(p: DVec3, a: DVec3, b: DVec3) -> f64 {
    let ab = b - a;
    let length_squared = ab.length_squared();
    if length_squared == 0.0 {
        return (p - a).length();
    }
    let t = ((p - a).dot(ab) / length_squared).clamp(0.0, 1.0);
    (a + ab * t - p).length()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::octree::build::build_octree;
    use crate::storage::memory::MemoryBlobStore;
    use crate::storage::BlobStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn random_cloud(count: usize) -> Vec<DVec3> {
        let mut rng = StdRng::seed_from_u64(71);
        (0..count)
            .map(|_| {
                DVec3::new(
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect()
    }

    fn build(positions: Vec<DVec3>, split_limit: usize) -> Node {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        build_octree(
            &store,
            Chunk::new(positions).unwrap(),
            split_limit,
            &cancel(),
        )
        .unwrap()
    }

    #[test]
    fn k_nearest_matches_brute_force() {
        let positions = random_cloud(1500);
        let root = build(positions.clone(), 100);
        let mut rng = StdRng::seed_from_u64(73);
        for _ in 0..20 {
            let query = DVec3::new(
                rng.gen_range(-0.2..1.2),
                rng.gen_range(-0.2..1.2),
                rng.gen_range(-0.2..1.2),
            );
            let radius = rng.gen_range(0.05..0.7);
            let k = rng.gen_range(1..25);
            let got = k_nearest(&root, query, radius, k, &cancel()).unwrap();
            let mut expected: Vec<f64> = positions
                .iter()
                .map(|p| (*p - query).length())
                .filter(|d| *d <= radius)
                .collect();
            expected.sort_by(|a, b| a.total_cmp(b));
            expected.truncate(k);
            assert_eq!(got.len(), expected.len());
            for (sample, want) in got.iter().zip(&expected) {
                assert!((sample.distance - want).abs() < 1e-6);
            }
            // distances monotone non-decreasing
            for pair in got.windows(2) {
                assert!(pair[0].distance <= pair[1].distance);
            }
        }
    }

    #[test]
    fn k_nearest_carries_attributes() {
        let positions = vec![DVec3::ZERO, DVec3::new(1.0, 0.0, 0.0)];
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let chunk = Chunk::new(positions)
            .unwrap()
            .with_intensities(vec![5, 6])
            .unwrap();
        let root = build_octree(&store, chunk, 10, &cancel()).unwrap();
        let got = k_nearest(&root, DVec3::new(0.9, 0.0, 0.0), 10.0, 1, &cancel()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].intensity, Some(6));
        assert_eq!(got[0].color, None);
    }

    #[test]
    fn near_ray_matches_brute_force() {
        let positions = random_cloud(800);
        let root = build(positions.clone(), 64);
        let origin = DVec3::new(-1.0, 0.5, 0.5);
        let direction = DVec3::new(1.0, 0.0, 0.0);
        let radius = 0.1;
        let got = near_ray(&root, origin, direction, radius, &cancel()).unwrap();
        let expected = positions
            .iter()
            .filter(|p| {
                // inside the cloud the segment spans the whole box, so the
                // ray distance is the distance to the x-axis line
                let dy = p.y - 0.5;
                let dz = p.z - 0.5;
                (dy * dy + dz * dz).sqrt() <= radius
            })
            .count();
        assert_eq!(got.len(), expected);
        for pair in got.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn ray_missing_the_tree_yields_nothing() {
        let root = build(random_cloud(100), 32);
        let got = near_ray(
            &root,
            DVec3::new(0.0, 5.0, 0.0),
            DVec3::new(1.0, 0.0, 0.0),
            0.1,
            &cancel(),
        )
        .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn ray_starting_inside_the_box_is_clipped_to_its_origin() {
        let bounds = Aabb::new(DVec3::ZERO, DVec3::ONE);
        let (t0, t1) = clip_ray(&bounds, DVec3::splat(0.5), DVec3::X).unwrap();
        assert_eq!(t0, 0.0);
        assert!((t1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ray_tangent_to_a_face_still_clips() {
        let bounds = Aabb::new(DVec3::ZERO, DVec3::ONE);
        // runs along the y = 1 face
        assert!(clip_ray(&bounds, DVec3::new(-1.0, 1.0, 0.5), DVec3::X).is_some());
        // and misses one nudged outside
        assert!(clip_ray(&bounds, DVec3::new(-1.0, 1.0 + 1e-9, 0.5), DVec3::X).is_none());
    }
}
