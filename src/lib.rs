//! Out-of-core spatial index for massive point clouds.
//!
//! Unordered chunks of samples are assembled into a content-addressed octree
//! whose nodes carry positions, colors, normals, intensities and a per-node
//! kd-tree, persisted immutably in a [`storage::BlobStore`] and resolved
//! through weakly cached references so the working set can exceed RAM.
//! Independently built subtrees merge pairwise, inner nodes carry bounded
//! LoD samples, and the query engine streams nearest-neighbour, range,
//! frustum, plane, polygon and convex-hull results over trees of any size.

pub mod chunk;
pub mod error;
pub mod import;
pub mod kdtree;
pub mod octree;
pub mod pointset;
pub mod prelude;
pub mod progress;
pub mod query;
pub mod storage;

pub use chunk::Chunk;
pub use error::{Error, Result};
pub use import::{import_chunks, ImportConfig};
pub use pointset::PointSet;
pub use progress::CancellationToken;
