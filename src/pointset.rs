use crate::error::Result;
use crate::octree::node::Node;
use crate::query::{enumerate, Everything, QueryIter};
use crate::storage::{BlobStore, BlobStoreExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Persisted JSON form of the named handle.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct PointSetBlob {
    id: String,
    root_node_id: String,
    split_limit: u64,
}

/// Named handle over a persisted octree: downstream consumers look a tree up
/// by symbolic key instead of a raw node id. The root is resolved lazily
/// through the store's weak cache.
pub struct PointSet {
    id: String,
    key: String,
    root_node_id: String,
    split_limit: usize,
    store: Arc<dyn BlobStore>,
}

impl PointSet {
    /// Persists a handle for `root` under `key`. Re-writing an existing key
    /// is allowed: the last writer of a named handle wins, the trees both
    /// handles reference stay intact.
    pub fn write(
        store: &Arc<dyn BlobStore>,
        key: &str,
        root: &Node,
        split_limit: usize,
    ) -> Result<PointSet> {
        let blob = PointSetBlob {
            id: Uuid::new_v4().to_string(),
            root_node_id: root.id().to_string(),
            split_limit: split_limit as u64,
        };
        let bytes = Bytes::from(serde_json::to_vec(&blob)?);
        store.put_replace(key, bytes)?;
        Ok(PointSet {
            id: blob.id,
            key: key.to_string(),
            root_node_id: blob.root_node_id,
            split_limit,
            store: store.clone(),
        })
    }

    /// Reads the handle stored under `key`; a missing handle is an absent
    /// result, not an error.
    pub fn read(store: &Arc<dyn BlobStore>, key: &str) -> Result<Option<PointSet>> {
        let Some(blob) =
            store.get_typed(key, |bytes| Ok(serde_json::from_slice::<PointSetBlob>(bytes)?))?
        else {
            return Ok(None);
        };
        Ok(Some(PointSet {
            id: blob.id,
            key: key.to_string(),
            root_node_id: blob.root_node_id,
            split_limit: blob.split_limit as usize,
            store: store.clone(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root_node_id(&self) -> &str {
        &self.root_node_id
    }

    pub fn split_limit(&self) -> usize {
        self.split_limit
    }

    pub fn root(&self) -> Result<Node> {
        Node::load(&self.store, &self.root_node_id)
    }

    pub fn point_count(&self) -> Result<u64> {
        Ok(self.root()?.point_count_tree())
    }

    /// Streams every stored point.
    pub fn iter_points(&self) -> Result<QueryIter<Everything>> {
        Ok(enumerate(&self.root()?))
    }

    /// Walks the tree for node/leaf counts and depth.
    pub fn stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        collect_stats(&self.root()?, 0, &mut stats)?;
        Ok(stats)
    }
}

impl std::fmt::Debug for PointSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointSet")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("root_node_id", &self.root_node_id)
            .field("split_limit", &self.split_limit)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub nodes: u64,
    pub leaves: u64,
    pub depth: u32,
}

fn collect_stats(node: &Node, depth: u32, stats: &mut TreeStats) -> Result<()> {
    stats.nodes += 1;
    stats.depth = stats.depth.max(depth);
    if node.is_leaf() {
        stats.leaves += 1;
        return Ok(());
    }
    for child_ref in node.subnodes().iter().flatten() {
        collect_stats(&child_ref.node()?, depth + 1, stats)?;
    }
    Ok(())
}
