//! Balanced kd-tree over the cell-relative positions of a single node.
//!
//! The tree is a permutation of the point indices in median order plus the
//! split axis chosen per slot; positions themselves stay in the node's
//! `Positions` array, so the serialized tree is regenerable from them.

use crate::error::Result;
use binrw::binrw;
use bytes::Bytes;
use glam::Vec3;
use std::collections::BinaryHeap;

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KdTree {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(perm.len()))]
    count: u32,
    /// Point indices in median-subdivided order: the middle of a range holds
    /// the splitting point, lower range left, upper range right.
    #[br(count = count)]
    perm: Vec<u32>,
    /// Split axis (0..3) per slot; leaf slots keep the default 0.
    #[br(count = count)]
    axes: Vec<u8>,
}

impl KdTree {
    pub fn build(points: &[Vec3]) -> KdTree {
        let mut perm: Vec<u32> = (0..points.len() as u32).collect();
        let mut axes = vec![0u8; points.len()];
        build_range(points, &mut perm, &mut axes, 0, points.len());
        KdTree { perm, axes }
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// Up to `k` points within `radius` of `query`, sorted by distance,
    /// ties broken by lower index.
    pub fn k_nearest(
        &self,
        points: &[Vec3],
        query: Vec3,
        radius: f32,
        k: usize,
    ) -> Vec<(u32, f32)> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.nearest_in_range(points, query, radius, k, 0, self.perm.len(), &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|hit| (hit.index, hit.dist))
            .collect()
    }

    fn nearest_in_range(
        &self,
        points: &[Vec3],
        query: Vec3,
        radius: f32,
        k: usize,
        lo: usize,
        hi: usize,
        heap: &mut BinaryHeap<Hit>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = (lo + hi) / 2;
        let index = self.perm[mid];
        let point = points[index as usize];
        let dist = (point - query).length();
        if dist <= radius {
            heap.push(Hit { dist, index });
            if heap.len() > k {
                heap.pop();
            }
        }
        if hi - lo == 1 {
            return;
        }
        let axis = self.axes[mid] as usize;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.nearest_in_range(points, query, radius, k, near.0, near.1, heap);
        if diff.abs() <= bound(heap, k, radius) {
            self.nearest_in_range(points, query, radius, k, far.0, far.1, heap);
        }
    }

    /// Up to `cap` points within `radius` of the segment `p0..p1`, sorted by
    /// distance to the segment, ties broken by lower index.
    pub fn near_line(
        &self,
        points: &[Vec3],
        p0: Vec3,
        p1: Vec3,
        radius: f32,
        cap: usize,
    ) -> Vec<(u32, f32)> {
        if cap == 0 || self.is_empty() {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(cap + 1);
        self.near_line_in_range(points, p0, p1, radius, cap, 0, self.perm.len(), &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|hit| (hit.index, hit.dist))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn near_line_in_range(
        &self,
        points: &[Vec3],
        p0: Vec3,
        p1: Vec3,
        radius: f32,
        cap: usize,
        lo: usize,
        hi: usize,
        heap: &mut BinaryHeap<Hit>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = (lo + hi) / 2;
        let index = self.perm[mid];
        let point = points[index as usize];
        let dist = segment_distance(point, p0, p1);
        if dist <= radius {
            heap.push(Hit { dist, index });
            if heap.len() > cap {
                heap.pop();
            }
        }
        if hi - lo == 1 {
            return;
        }
        let axis = self.axes[mid] as usize;
        let split = point[axis];
        let seg_min = p0[axis].min(p1[axis]);
        let seg_max = p0[axis].max(p1[axis]);
        // lower bound on the distance from any point of a half-space to the segment
        let left_gap = (seg_min - split).max(0.0);
        let right_gap = (split - seg_max).max(0.0);
        let sides = if left_gap <= right_gap {
            [((lo, mid), left_gap), ((mid + 1, hi), right_gap)]
        } else {
            [((mid + 1, hi), right_gap), ((lo, mid), left_gap)]
        };
        for ((lo, hi), gap) in sides {
            if gap <= bound(heap, cap, radius) {
                self.near_line_in_range(points, p0, p1, radius, cap, lo, hi, heap);
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        binrw::BinWrite::write_le(self, &mut cursor)?;
        Ok(Bytes::from(cursor.into_inner()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<KdTree> {
        use binrw::BinReaderExt;
        Ok(std::io::Cursor::new(bytes).read_le()?)
    }
}

fn build_range(points: &[Vec3], perm: &mut [u32], axes: &mut [u8], lo: usize, hi: usize) {
    if hi - lo <= 1 {
        return;
    }
    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    for &i in &perm[lo..hi] {
        min = min.min(points[i as usize]);
        max = max.max(points[i as usize]);
    }
    let extent = max - min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };
    let mid = (lo + hi) / 2;
    perm[lo..hi].select_nth_unstable_by(mid - lo, |&a, &b| {
        points[a as usize][axis].total_cmp(&points[b as usize][axis])
    });
    axes[mid] = axis as u8;
    build_range(points, perm, axes, lo, mid);
    build_range(points, perm, axes, mid + 1, hi);
}

/// Current pruning bound: the worst kept distance once the heap is full.
fn bound(heap: &BinaryHeap<Hit>, k: usize, radius: f32) -> f32 {
    if heap.len() == k {
        heap.peek().expect("non-empty heap").dist
    } else {
        radius
    }
}

pub(crate) fn segment_distance(p: Vec3, a: Vec3, b: Vec3) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq == 0.0 {
        return (p - a).length();
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    (a + ab * t - p).length()
}

#[derive(PartialEq)]
struct Hit {
    dist: f32,
    index: u32,
}

impl Eq for Hit {}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap: equal distances evict the higher index first
        self.dist
            .total_cmp(&other.dist)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
