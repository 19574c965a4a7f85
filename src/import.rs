//! Map-reduce assembly of a point set: per-chunk builds in parallel, then
//! pairwise merging of the per-chunk octrees, followed by the LoD and normal
//! passes and the final named handle.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::octree::build::build_octree;
use crate::octree::lod::generate_lod;
use crate::octree::merge::merge_octrees;
use crate::octree::node::{new_blob_key, Node};
use crate::octree::normals::NormalEstimator;
use crate::pointset::PointSet;
use crate::progress::{CancellationToken, ProgressCallback, ProgressSink};
use crate::storage::BlobStore;
use glam::DVec3;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub type Reprojection = Arc<dyn Fn(DVec3) -> DVec3 + Send + Sync>;

/// Import configuration. Everything except the storage (passed separately)
/// is optional; the defaults match a plain bulk import.
#[derive(Clone)]
pub struct ImportConfig {
    /// Symbolic key for the final handle; generated when absent.
    pub key: Option<String>,
    /// Maximum number of points per leaf.
    pub split_limit: usize,
    /// Poisson thinning radius; zero disables thinning.
    pub min_dist: f64,
    /// Per-point position transform applied before thinning.
    pub reproject: Option<Reprojection>,
    /// Normal estimator; absent skips the normal pass.
    pub estimate_normals: Option<NormalEstimator>,
    /// Run the LoD pass after construction.
    pub create_octree_lod: bool,
    /// Drop chunks whose content hash was already imported.
    pub deduplicate_chunks: bool,
    /// Upper bound on worker concurrency; zero picks the machine default.
    pub max_degree_of_parallelism: usize,
    /// Monotone progress reporter in `[0, 1]`.
    pub progress_callback: Option<ProgressCallback>,
    /// Raise per-phase status to info-level logging.
    pub verbose: bool,
    pub cancellation_token: CancellationToken,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            key: None,
            split_limit: 8192,
            min_dist: 0.0,
            reproject: None,
            estimate_normals: None,
            create_octree_lod: true,
            deduplicate_chunks: false,
            max_degree_of_parallelism: 0,
            progress_callback: None,
            verbose: false,
            cancellation_token: CancellationToken::new(),
        }
    }
}

impl ImportConfig {
    fn validate(&self) -> Result<()> {
        if self.split_limit == 0 {
            return Err(Error::InvalidConfig(
                "split_limit must be positive".to_string(),
            ));
        }
        if !self.min_dist.is_finite() || self.min_dist < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "min_dist must be finite and non-negative, got {}",
                self.min_dist
            )));
        }
        Ok(())
    }

    fn workers(&self) -> usize {
        if self.max_degree_of_parallelism > 0 {
            self.max_degree_of_parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Builds one octree out of a stream of chunks and persists it under the
/// configured key.
///
/// Mapping (chunk pipeline + per-chunk build) runs in parallel up to the
/// configured degree and reports progress up to 0.5; the pairwise reduce
/// continues to 1.0. The reduction is associative on the resulting point
/// multiset, so pair order does not matter.
pub fn import_chunks<I>(
    store: &Arc<dyn BlobStore>,
    chunks: I,
    config: &ImportConfig,
) -> Result<PointSet>
where
    I: IntoIterator<Item = Chunk> + Send,
    I::IntoIter: Send,
{
    config.validate()?;
    let cancel = &config.cancellation_token;
    let progress = ProgressSink::new(config.progress_callback.clone());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers())
        .build()
        .map_err(|err| Error::InvalidConfig(format!("worker pool: {err}")))?;

    // map: pipeline + per-chunk octree, in parallel over the chunk stream
    let seen_hashes = Mutex::new(HashSet::new());
    let mapped = AtomicUsize::new(0);
    let roots: Vec<Node> = pool.install(|| {
        chunks
            .into_iter()
            .par_bridge()
            .map(|chunk| -> Result<Option<Node>> {
                cancel.check()?;
                if config.deduplicate_chunks {
                    let hash = chunk.content_hash();
                    let fresh = seen_hashes.lock().expect("hash lock poisoned").insert(hash);
                    if !fresh {
                        debug!(hash, "dropping duplicate chunk");
                        return Ok(None);
                    }
                }
                let chunk = match &config.reproject {
                    Some(transform) => chunk.reprojected(|p| transform(p))?,
                    None => chunk,
                };
                let chunk = chunk.thinned(config.min_dist);
                let node = build_octree(store, chunk, config.split_limit, cancel)?;
                // the chunk total is unknown for a stream, report
                // asymptotically towards the 50% mapping share
                let done = mapped.fetch_add(1, Ordering::Relaxed) + 1;
                progress.report(0.5 * done as f64 / (done + 1) as f64);
                Ok(Some(node))
            })
            .filter_map(Result::transpose)
            .collect::<Result<Vec<Node>>>()
    })?;
    if config.verbose {
        info!(chunks = roots.len(), "mapping finished");
    }
    progress.report(0.5);

    // reduce: fold pairwise until a single tree remains
    let total_merges = roots.len().saturating_sub(1).max(1);
    let merged_count = AtomicUsize::new(0);
    let mut trees = roots;
    if trees.is_empty() {
        trees.push(build_octree(
            store,
            Chunk::default(),
            config.split_limit,
            cancel,
        )?);
    }
    while trees.len() > 1 {
        trees = pool.install(|| {
            trees
                .par_chunks(2)
                .map(|pair| -> Result<Node> {
                    match pair {
                        [single] => Ok(single.clone()),
                        [a, b] => {
                            let merged = merge_octrees(
                                store,
                                a.clone(),
                                b.clone(),
                                config.split_limit,
                                cancel,
                            )?;
                            let done = merged_count.fetch_add(1, Ordering::Relaxed) + 1;
                            progress.report(0.5 + 0.5 * done as f64 / total_merges as f64);
                            Ok(merged)
                        }
                        _ => unreachable!("par_chunks(2) yields one or two trees"),
                    }
                })
                .collect::<Result<Vec<Node>>>()
        })?;
    }
    let mut root = trees.pop().expect("reduce keeps at least one tree");
    if config.verbose {
        info!(
            points = root.point_count_tree(),
            root = %root.id(),
            "reduction finished"
        );
    }

    if config.create_octree_lod {
        root = generate_lod(root, config.split_limit, cancel)?;
        if config.verbose {
            info!("LoD pass finished");
        }
    }
    if let Some(estimator) = &config.estimate_normals {
        root = crate::octree::normals::generate_normals(root, estimator, cancel)?;
        if config.verbose {
            info!("normal pass finished");
        }
    }

    let key = config.key.clone().unwrap_or_else(new_blob_key);
    let point_set = PointSet::write(store, &key, &root, config.split_limit)?;
    progress.report(1.0);
    if config.verbose {
        info!(key = %point_set.key(), id = %point_set.id(), "point set persisted");
    }
    Ok(point_set)
}
