pub use crate::chunk::Chunk;
pub use crate::import::{import_chunks, ImportConfig};
pub use crate::octree::{build_octree, generate_lod, generate_normals, merge_octrees};
pub use crate::octree::{Aabb, Cell, Node, NodeType, PointAttribute};
pub use crate::pointset::PointSet;
pub use crate::progress::CancellationToken;
pub use crate::query::filters::{ConvexHull, NearPlane, NearPlanes, NearPolygon, Plane};
pub use crate::query::knn::{k_nearest, near_ray};
pub use crate::query::{enumerate, query, FilterState, QueryChunk, QueryOptions, SpatialFilter};
pub use crate::storage::file::FileBlobStore;
pub use crate::storage::memory::MemoryBlobStore;
pub use crate::storage::{BlobStore, BlobStoreExt, PersistentRef};

// Error types
pub use crate::error::{Error, Result, StoreError};
