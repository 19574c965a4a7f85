//! End-to-end import scenarios over the public surface.

use glam::{DVec3, Vec3};
use pointset::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn memory_store() -> Arc<dyn BlobStore> {
    Arc::new(MemoryBlobStore::new())
}

fn uniform(rng: &mut StdRng, count: usize, offset: DVec3) -> Vec<DVec3> {
    (0..count)
        .map(|_| {
            DVec3::new(
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
            ) + offset
        })
        .collect()
}

fn collect_positions(set: &PointSet) -> Vec<DVec3> {
    set.iter_points()
        .unwrap()
        .flat_map(|chunk| chunk.unwrap().positions)
        .collect()
}

/// Per-axis sorted coordinates, for multiset comparison of clouds that went
/// through the single-precision relative encoding.
fn sorted_axes(points: &[DVec3]) -> [Vec<f64>; 3] {
    let mut axes = [
        points.iter().map(|p| p.x).collect::<Vec<_>>(),
        points.iter().map(|p| p.y).collect::<Vec<_>>(),
        points.iter().map(|p| p.z).collect::<Vec<_>>(),
    ];
    for axis in &mut axes {
        axis.sort_by(|a, b| a.total_cmp(b));
    }
    axes
}

fn assert_same_cloud(a: &[DVec3], b: &[DVec3], tolerance: f64) {
    assert_eq!(a.len(), b.len());
    let (a, b) = (sorted_axes(a), sorted_axes(b));
    for axis in 0..3 {
        for (x, y) in a[axis].iter().zip(&b[axis]) {
            assert!(
                (x - y).abs() <= tolerance,
                "coordinate drift {x} vs {y} on axis {axis}"
            );
        }
    }
}

#[test]
fn trivial_build_is_a_single_leaf() {
    // S1
    let store = memory_store();
    let chunk = Chunk::new(vec![
        DVec3::new(0.0, 0.0, 0.0),
        DVec3::new(1.0, 0.0, 0.0),
        DVec3::new(2.0, 0.0, 0.0),
    ])
    .unwrap();
    let config = ImportConfig {
        split_limit: 10,
        ..ImportConfig::default()
    };
    let set = import_chunks(&store, vec![chunk], &config).unwrap();
    let root = set.root().unwrap();
    assert!(root.is_leaf());
    assert_eq!(root.point_count_tree(), 3);
    assert_eq!(root.bounding_box().min, DVec3::ZERO);
    assert_eq!(root.bounding_box().max, DVec3::new(2.0, 0.0, 0.0));
    assert!(!root.node_data().has_normals());
}

#[test]
fn min_dist_thinning_enforces_the_radius() {
    // S2
    let store = memory_store();
    let mut rng = StdRng::seed_from_u64(2);
    let chunk = Chunk::new(uniform(&mut rng, 100, DVec3::ZERO)).unwrap();
    let config = ImportConfig {
        split_limit: 10,
        min_dist: 0.5,
        ..ImportConfig::default()
    };
    let set = import_chunks(&store, vec![chunk], &config).unwrap();
    assert!(set.point_count().unwrap() < 100);
    assert!(set.point_count().unwrap() > 0);
    let kept = collect_positions(&set);
    for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
            assert!((*a - *b).length() >= 0.5 - 1e-6);
        }
    }
}

#[test]
fn reprojection_shifts_the_bounding_box() {
    // S3
    let store = memory_store();
    let chunk = Chunk::new((0..10).map(|i| DVec3::new(i as f64, 0.0, 0.0)).collect()).unwrap();
    let config = ImportConfig {
        reproject: Some(Arc::new(|p: DVec3| p + DVec3::new(0.0, 1.0, 0.0))),
        ..ImportConfig::default()
    };
    let set = import_chunks(&store, vec![chunk], &config).unwrap();
    let root = set.root().unwrap();
    assert_eq!(root.bounding_box().min, DVec3::new(0.0, 1.0, 0.0));
    assert_eq!(root.bounding_box().max, DVec3::new(9.0, 1.0, 0.0));
}

#[test]
fn normal_estimator_populates_every_leaf() {
    // S4
    let store = memory_store();
    let chunk = Chunk::new((0..10).map(|i| DVec3::new(i as f64, 0.0, 0.0)).collect()).unwrap();
    let config = ImportConfig {
        estimate_normals: Some(Arc::new(|positions: &[DVec3]| {
            vec![Vec3::new(0.0, 0.0, 1.0); positions.len()]
        })),
        ..ImportConfig::default()
    };
    let set = import_chunks(&store, vec![chunk], &config).unwrap();
    let root = set.root().unwrap();
    assert!(root.is_leaf());
    assert!(root.node_data().has_normals());
    let normals = root.node_data().normals().unwrap().unwrap();
    assert_eq!(normals.len(), 10);
    assert!(normals.iter().all(|n| *n == Vec3::new(0.0, 0.0, 1.0)));
}

#[test]
fn merging_two_large_overlapping_clouds_keeps_the_union() {
    // S5
    let store = memory_store();
    let mut rng = StdRng::seed_from_u64(5);
    let pa = uniform(&mut rng, 42_000, DVec3::ZERO);
    let pb = uniform(&mut rng, 42_000, DVec3::splat(0.3));
    let mut expected = pa.clone();
    expected.extend(&pb);
    let cancel = CancellationToken::new();
    let a = build_octree(&store, Chunk::new(pa).unwrap(), 1000, &cancel).unwrap();
    let b = build_octree(&store, Chunk::new(pb).unwrap(), 1000, &cancel).unwrap();
    let merged = merge_octrees(&store, a, b, 1000, &cancel).unwrap();
    assert_eq!(merged.point_count_tree(), 84_000);
    let got: Vec<DVec3> = enumerate(&merged)
        .flat_map(|chunk| chunk.unwrap().positions)
        .collect();
    assert_same_cloud(&got, &expected, 1e-5);
}

#[test]
fn persisted_point_sets_survive_a_store_reopen() {
    // S6
    let dir = std::env::temp_dir().join(format!("pointset-e2e-{}", uuid::Uuid::new_v4()));
    let root_id;
    {
        let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&dir).unwrap());
        let chunk = Chunk::new(vec![
            DVec3::new(0.5, 0.5, 0.5),
            DVec3::new(0.25, 0.5, 0.5),
            DVec3::new(0.75, 0.5, 0.5),
        ])
        .unwrap();
        let config = ImportConfig {
            key: Some("test".to_string()),
            split_limit: 10,
            ..ImportConfig::default()
        };
        let set = import_chunks(&store, vec![chunk], &config).unwrap();
        root_id = set.root_node_id().to_string();
    }
    let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&dir).unwrap());
    let set = PointSet::read(&store, "test").unwrap().expect("handle");
    assert_eq!(set.root_node_id(), root_id);
    assert_eq!(set.point_count().unwrap(), 3);
    let total: usize = set.iter_points().unwrap().map(|c| c.unwrap().len()).sum();
    assert_eq!(total, 3);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn reloaded_trees_enumerate_the_same_multiset() {
    // property 5
    let dir = std::env::temp_dir().join(format!("pointset-reload-{}", uuid::Uuid::new_v4()));
    let mut rng = StdRng::seed_from_u64(55);
    let points = uniform(&mut rng, 3000, DVec3::ZERO);
    let in_memory;
    {
        let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&dir).unwrap());
        let config = ImportConfig {
            key: Some("reload".to_string()),
            split_limit: 128,
            ..ImportConfig::default()
        };
        let set = import_chunks(&store, vec![Chunk::new(points).unwrap()], &config).unwrap();
        in_memory = collect_positions(&set);
    }
    let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&dir).unwrap());
    let set = PointSet::read(&store, "reload").unwrap().unwrap();
    let reloaded = collect_positions(&set);
    assert_same_cloud(&reloaded, &in_memory, 0.0);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn import_of_many_chunks_enumerates_every_point_once() {
    // property 2 across the whole pipeline
    let store = memory_store();
    let mut rng = StdRng::seed_from_u64(77);
    let chunks: Vec<Chunk> = (0..6)
        .map(|i| {
            Chunk::new(uniform(&mut rng, 700, DVec3::splat(i as f64 * 0.35))).unwrap()
        })
        .collect();
    let expected: Vec<DVec3> = chunks
        .iter()
        .flat_map(|c| c.positions().to_vec())
        .collect();
    let config = ImportConfig {
        split_limit: 256,
        max_degree_of_parallelism: 3,
        ..ImportConfig::default()
    };
    let set = import_chunks(&store, chunks, &config).unwrap();
    assert_eq!(set.point_count().unwrap() as usize, expected.len());
    let got = collect_positions(&set);
    assert_same_cloud(&got, &expected, 1e-5);
}

#[test]
fn lod_bearing_trees_keep_their_full_resolution_data() {
    // property 8 end to end: the LoD pass adds samples without disturbing
    // the leaves
    let store = memory_store();
    let mut rng = StdRng::seed_from_u64(88);
    let points = uniform(&mut rng, 2500, DVec3::ZERO);
    let config = ImportConfig {
        split_limit: 100,
        create_octree_lod: true,
        ..ImportConfig::default()
    };
    let set = import_chunks(&store, vec![Chunk::new(points.clone()).unwrap()], &config).unwrap();
    let root = set.root().unwrap();
    assert!(root.lod_data().has_positions());
    assert!(root.lod_data().positions().unwrap().unwrap().len() <= 100);
    let got = collect_positions(&set);
    assert_same_cloud(&got, &points, 1e-5);
}
