use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::kdtree::KdTree;
use crate::octree::aabb::{Aabb, BoundingBox};
use crate::octree::attributes::{
    decode_classifications, decode_colors, decode_intensities, decode_vec3s,
    encode_classifications, encode_colors, encode_intensities, encode_vec3s, PointAttribute,
};
use crate::octree::cell::Cell;
use crate::storage::{get_required, BlobStore, Loader, PersistentRef};
use bytes::Bytes;
use glam::{DVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    /// An octree node carrying point data and/or children.
    PointCloudNode,
    /// A forwarding wrapper written when a tree root is lifted into a larger
    /// enclosing cell during merge; carries a cell and a single child id.
    LinkedNode,
}

/// Persisted JSON form of a node.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct NodeBlob {
    node_type: NodeType,
    id: String,
    cell: Cell,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    bounding_box_exact: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    point_count_tree: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    subnodes: Option<Vec<Option<String>>>,
    attributes: BTreeMap<PointAttribute, String>,
}

/// Immutable octree node, shared via `Arc` and reachable through
/// [`NodeRef`]s. The authoritative owner of a node's bytes is always the
/// blob store; in-memory instances are weakly cached reconstructions.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

pub struct NodeInner {
    id: String,
    node_type: NodeType,
    cell: Cell,
    bounding_box: Aabb,
    point_count_tree: u64,
    subnodes: [Option<NodeRef>; 8],
    attribute_keys: BTreeMap<PointAttribute, String>,
    node_data: AttributeRefs,
    lod_data: AttributeRefs,
    store: Arc<dyn BlobStore>,
}

/// Lazy reference to a child node.
pub struct NodeRef(PersistentRef<NodeInner>);

impl NodeRef {
    fn new(store: Arc<dyn BlobStore>, id: &str) -> NodeRef {
        NodeRef(PersistentRef::new(id, node_loader(store)))
    }

    fn with_value(store: Arc<dyn BlobStore>, node: &Node) -> NodeRef {
        NodeRef(PersistentRef::with_value(
            node.id(),
            node_loader(store),
            &node.0,
        ))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn node(&self) -> Result<Node> {
        Ok(Node(self.0.value()?))
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeRef({})", self.id())
    }
}

fn node_loader(store: Arc<dyn BlobStore>) -> Loader<NodeInner> {
    Arc::new(move |id| Node::load(&store, id).map(|node| node.0))
}

/// The typed lazy references of one attribute family (node-level or LoD).
#[derive(Default)]
pub struct AttributeRefs {
    positions: Option<PersistentRef<Vec<Vec3>>>,
    colors: Option<PersistentRef<Vec<[u8; 4]>>>,
    normals: Option<PersistentRef<Vec<Vec3>>>,
    intensities: Option<PersistentRef<Vec<i32>>>,
    classifications: Option<PersistentRef<Vec<u8>>>,
    kd_tree: Option<PersistentRef<KdTree>>,
}

macro_rules! attribute_accessor {
    ($name:ident, $has:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<Option<Arc<$ty>>> {
            self.$name.as_ref().map(|r| r.value()).transpose()
        }

        pub fn $has(&self) -> bool {
            self.$name.is_some()
        }
    };
}

impl AttributeRefs {
    attribute_accessor!(positions, has_positions, Vec<Vec3>);
    attribute_accessor!(colors, has_colors, Vec<[u8; 4]>);
    attribute_accessor!(normals, has_normals, Vec<Vec3>);
    attribute_accessor!(intensities, has_intensities, Vec<i32>);
    attribute_accessor!(classifications, has_classifications, Vec<u8>);
    attribute_accessor!(kd_tree, has_kd_tree, KdTree);

    fn from_keys(
        store: &Arc<dyn BlobStore>,
        keys: &BTreeMap<PointAttribute, String>,
        lod: bool,
    ) -> AttributeRefs {
        let key = |name: PointAttribute| {
            let name = if lod { name.lod() } else { name };
            keys.get(&name).cloned()
        };
        AttributeRefs {
            positions: key(PointAttribute::Positions)
                .map(|k| blob_ref(store.clone(), k, decode_vec3s)),
            colors: key(PointAttribute::Colors)
                .map(|k| blob_ref(store.clone(), k, decode_colors)),
            normals: key(PointAttribute::Normals)
                .map(|k| blob_ref(store.clone(), k, decode_vec3s)),
            intensities: key(PointAttribute::Intensities)
                .map(|k| blob_ref(store.clone(), k, decode_intensities)),
            classifications: key(PointAttribute::Classifications)
                .map(|k| blob_ref(store.clone(), k, decode_classifications)),
            kd_tree: key(PointAttribute::KdTree)
                .map(|k| blob_ref(store.clone(), k, KdTree::from_bytes)),
        }
    }

    /// Field-wise overlay: freshly written references win over re-derived
    /// ones so the still-loaded values stay reachable.
    fn overlaid(self, add: AttributeRefs) -> AttributeRefs {
        AttributeRefs {
            positions: add.positions.or(self.positions),
            colors: add.colors.or(self.colors),
            normals: add.normals.or(self.normals),
            intensities: add.intensities.or(self.intensities),
            classifications: add.classifications.or(self.classifications),
            kd_tree: add.kd_tree.or(self.kd_tree),
        }
    }
}

fn blob_ref<T: Send + Sync + 'static>(
    store: Arc<dyn BlobStore>,
    key: String,
    decode: fn(&[u8]) -> Result<T>,
) -> PersistentRef<T> {
    let loader: Loader<T> = Arc::new(move |id| {
        let bytes = get_required(store.as_ref(), id)?;
        Ok(Arc::new(decode(&bytes)?))
    });
    PersistentRef::new(key, loader)
}

/// Attribute arrays of one family, about to be persisted.
#[derive(Default)]
pub(crate) struct AttributeArrays {
    pub positions: Option<Vec<Vec3>>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub normals: Option<Vec<Vec3>>,
    pub intensities: Option<Vec<i32>>,
    pub classifications: Option<Vec<u8>>,
    pub kd_tree: Option<KdTree>,
}

impl AttributeArrays {
    /// Writes every present array under a fresh key and returns references
    /// seeded with the still-loaded values. `keys` receives the blob keys
    /// under node-level or LoD names.
    fn persist(
        self,
        store: &Arc<dyn BlobStore>,
        lod: bool,
        keys: &mut BTreeMap<PointAttribute, String>,
    ) -> Result<AttributeRefs> {
        fn write<T: Send + Sync + 'static>(
            store: &Arc<dyn BlobStore>,
            keys: &mut BTreeMap<PointAttribute, String>,
            name: PointAttribute,
            value: Option<T>,
            encode: impl FnOnce(&T) -> Result<Bytes>,
            decode: fn(&[u8]) -> Result<T>,
        ) -> Result<Option<PersistentRef<T>>> {
            let Some(value) = value else {
                return Ok(None);
            };
            let key = new_blob_key();
            store.put(&key, encode(&value)?)?;
            keys.insert(name, key.clone());
            let value = Arc::new(value);
            let loader: Loader<T> = {
                let store = store.clone();
                Arc::new(move |id| {
                    let bytes = get_required(store.as_ref(), id)?;
                    Ok(Arc::new(decode(&bytes)?))
                })
            };
            Ok(Some(PersistentRef::with_value(key, loader, &value)))
        }

        let name = |n: PointAttribute| if lod { n.lod() } else { n };
        Ok(AttributeRefs {
            positions: write(
                store,
                keys,
                name(PointAttribute::Positions),
                self.positions,
                |v| encode_vec3s(v),
                decode_vec3s,
            )?,
            colors: write(
                store,
                keys,
                name(PointAttribute::Colors),
                self.colors,
                |v| encode_colors(v),
                decode_colors,
            )?,
            normals: write(
                store,
                keys,
                name(PointAttribute::Normals),
                self.normals,
                |v| encode_vec3s(v),
                decode_vec3s,
            )?,
            intensities: write(
                store,
                keys,
                name(PointAttribute::Intensities),
                self.intensities,
                |v| encode_intensities(v),
                decode_intensities,
            )?,
            classifications: write(
                store,
                keys,
                name(PointAttribute::Classifications),
                self.classifications,
                |v| encode_classifications(v),
                decode_classifications,
            )?,
            kd_tree: write(
                store,
                keys,
                name(PointAttribute::KdTree),
                self.kd_tree,
                |v| v.to_bytes(),
                |bytes| KdTree::from_bytes(bytes),
            )?,
        })
    }
}

pub(crate) fn new_blob_key() -> String {
    Uuid::new_v4().to_string()
}

impl Node {
    /// Loads a node by id, going through the store's weak cache.
    pub fn load(store: &Arc<dyn BlobStore>, id: &str) -> Result<Node> {
        if let Some(cached) = store.cache_get(id) {
            if let Ok(inner) = cached.downcast::<NodeInner>() {
                return Ok(Node(inner));
            }
        }
        let bytes = get_required(store.as_ref(), id)?;
        let blob: NodeBlob = serde_json::from_slice(&bytes)?;
        let inner = Arc::new(NodeInner::from_blob(store, blob)?);
        store.cache_put(id, inner.clone() as Arc<dyn Any + Send + Sync>);
        Ok(Node(inner))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn node_type(&self) -> NodeType {
        self.0.node_type
    }

    pub fn cell(&self) -> Cell {
        self.0.cell
    }

    pub fn bounding_box(&self) -> Aabb {
        self.0.bounding_box
    }

    /// Total points in this subtree.
    pub fn point_count_tree(&self) -> u64 {
        self.0.point_count_tree
    }

    /// Points stored directly at this node: the leaf payload, zero for inner
    /// nodes (their LoD sample is accounted separately).
    pub fn point_count_node(&self) -> u64 {
        if self.is_leaf() {
            self.0.point_count_tree
        } else {
            0
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.0.subnodes.iter().all(|child| child.is_none())
    }

    pub fn subnodes(&self) -> &[Option<NodeRef>; 8] {
        &self.0.subnodes
    }

    pub fn attribute_key(&self, name: PointAttribute) -> Option<&str> {
        self.0.attribute_keys.get(&name).map(String::as_str)
    }

    /// Node-level attribute family (`Positions`, `Colors`, ...).
    pub fn node_data(&self) -> &AttributeRefs {
        &self.0.node_data
    }

    /// LoD attribute family (`LodPositions`, ...), present on inner nodes
    /// after the LoD pass.
    pub fn lod_data(&self) -> &AttributeRefs {
        &self.0.lod_data
    }

    pub(crate) fn store(&self) -> &Arc<dyn BlobStore> {
        &self.0.store
    }

    /// Absolute positions of the node-level payload.
    pub fn absolute_positions(&self) -> Result<Vec<DVec3>> {
        let Some(relative) = self.node_data().positions()? else {
            return Ok(Vec::new());
        };
        Ok(to_absolute(&relative, self.cell()))
    }

    /// The node-level payload as a chunk of absolute samples; used when a
    /// merge re-splits a leaf.
    pub(crate) fn extract_chunk(&self) -> Result<Chunk> {
        let positions = self.absolute_positions()?;
        let data = self.node_data();
        Ok(Chunk::from_parts(
            positions,
            data.colors()?.map(|v| v.to_vec()),
            data.normals()?.map(|v| v.to_vec()),
            data.intensities()?.map(|v| v.to_vec()),
            data.classifications()?.map(|v| v.to_vec()),
        ))
    }

    /// Writes a leaf node holding the chunk's samples relative to `cell`.
    pub(crate) fn write_leaf(
        store: &Arc<dyn BlobStore>,
        cell: Cell,
        chunk: &Chunk,
    ) -> Result<Node> {
        let positions: Vec<Vec3> = chunk
            .positions()
            .iter()
            .map(|p| to_relative(*p, cell))
            .collect();
        let kd_tree = KdTree::build(&positions);
        let arrays = AttributeArrays {
            positions: Some(positions),
            colors: chunk.colors().map(|v| v.to_vec()),
            normals: chunk.normals().map(|v| v.to_vec()),
            intensities: chunk.intensities().map(|v| v.to_vec()),
            classifications: chunk.classifications().map(|v| v.to_vec()),
            kd_tree: Some(kd_tree),
        };
        let mut keys = BTreeMap::new();
        let node_data = arrays.persist(store, false, &mut keys)?;
        let inner = NodeInner {
            id: new_blob_key(),
            node_type: NodeType::PointCloudNode,
            cell,
            bounding_box: *chunk.bounds(),
            point_count_tree: chunk.len() as u64,
            subnodes: Default::default(),
            attribute_keys: keys,
            node_data,
            lod_data: AttributeRefs::default(),
            store: store.clone(),
        };
        persist_inner(store, inner, false)
    }

    /// Writes an inner node over already persisted children (post-order: all
    /// child blobs exist before the parent blob is written).
    pub(crate) fn write_inner(
        store: &Arc<dyn BlobStore>,
        cell: Cell,
        children: [Option<Node>; 8],
    ) -> Result<Node> {
        let mut bounding_box: Option<Aabb> = None;
        let mut point_count_tree = 0u64;
        let mut subnodes: [Option<NodeRef>; 8] = Default::default();
        for (slot, child) in children.iter().enumerate() {
            let Some(child) = child else {
                continue;
            };
            point_count_tree += child.point_count_tree();
            bounding_box = Some(match bounding_box {
                Some(bounds) => bounds.union(&child.bounding_box()),
                None => child.bounding_box(),
            });
            subnodes[slot] = Some(NodeRef::with_value(store.clone(), child));
        }
        let bounding_box = bounding_box.ok_or_else(|| {
            Error::InvariantViolation("inner node without any child".to_string())
        })?;
        let inner = NodeInner {
            id: new_blob_key(),
            node_type: NodeType::PointCloudNode,
            cell,
            bounding_box,
            point_count_tree,
            subnodes,
            attribute_keys: BTreeMap::new(),
            node_data: AttributeRefs::default(),
            lod_data: AttributeRefs::default(),
            store: store.clone(),
        };
        persist_inner(store, inner, false)
    }

    /// Writes a forwarding wrapper: `target` must occupy a direct child cell
    /// of `cell`. The persisted blob carries only the cell and the child id;
    /// bounding box and counts live on the target.
    pub(crate) fn write_linked(
        store: &Arc<dyn BlobStore>,
        cell: Cell,
        target: &Node,
    ) -> Result<Node> {
        let slot = cell.octant_of_cell(&target.cell());
        debug_assert_eq!(cell.child(slot), target.cell());
        let mut subnodes: [Option<NodeRef>; 8] = Default::default();
        subnodes[slot] = Some(NodeRef::with_value(store.clone(), target));
        let inner = NodeInner {
            id: new_blob_key(),
            node_type: NodeType::LinkedNode,
            cell,
            bounding_box: target.bounding_box(),
            point_count_tree: target.point_count_tree(),
            subnodes,
            attribute_keys: BTreeMap::new(),
            node_data: AttributeRefs::default(),
            lod_data: AttributeRefs::default(),
            store: store.clone(),
        };
        persist_inner(store, inner, false)
    }

    /// Republishes this node under the same id with an additional attribute
    /// family — the single admitted mutation. `lod` selects the family; a
    /// LinkedNode gaining attributes becomes a PointCloudNode. `children`
    /// replaces the in-memory child handles (their ids must be unchanged).
    pub(crate) fn republish_with(
        &self,
        arrays: AttributeArrays,
        lod: bool,
        children: Option<[Option<Node>; 8]>,
    ) -> Result<Node> {
        let store = self.store().clone();
        let mut keys = self.0.attribute_keys.clone();
        let written = arrays.persist(&store, lod, &mut keys)?;
        let subnodes = match children {
            Some(children) => {
                let mut subnodes: [Option<NodeRef>; 8] = Default::default();
                for (slot, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        debug_assert_eq!(
                            Some(child.id()),
                            self.0.subnodes[slot].as_ref().map(NodeRef::id)
                        );
                        subnodes[slot] = Some(NodeRef::with_value(store.clone(), child));
                    }
                }
                subnodes
            }
            None => clone_refs(&store, &self.0.subnodes),
        };
        let mut node_data = AttributeRefs::from_keys(&store, &keys, false);
        let mut lod_data = AttributeRefs::from_keys(&store, &keys, true);
        if lod {
            lod_data = lod_data.overlaid(written);
        } else {
            node_data = node_data.overlaid(written);
        }
        let inner = NodeInner {
            id: self.0.id.clone(),
            node_type: NodeType::PointCloudNode,
            cell: self.0.cell,
            bounding_box: self.0.bounding_box,
            point_count_tree: self.0.point_count_tree,
            subnodes,
            attribute_keys: keys,
            node_data,
            lod_data,
            store,
        };
        persist_inner(self.store(), inner, true)
    }
}

fn clone_refs(store: &Arc<dyn BlobStore>, refs: &[Option<NodeRef>; 8]) -> [Option<NodeRef>; 8] {
    let mut out: [Option<NodeRef>; 8] = Default::default();
    for (slot, node_ref) in refs.iter().enumerate() {
        if let Some(node_ref) = node_ref {
            out[slot] = Some(match node_ref.0.try_value() {
                Some(value) => NodeRef(PersistentRef::with_value(
                    node_ref.id(),
                    node_loader(store.clone()),
                    &value,
                )),
                None => NodeRef::new(store.clone(), node_ref.id()),
            });
        }
    }
    out
}

/// Serializes and writes the node blob, refreshes the weak cache, and hands
/// out the in-memory handle.
fn persist_inner(
    store: &Arc<dyn BlobStore>,
    inner: NodeInner,
    replace: bool,
) -> Result<Node> {
    let blob = inner.to_blob();
    let bytes = Bytes::from(serde_json::to_vec(&blob)?);
    if replace {
        store.put_replace(&inner.id, bytes)?;
    } else {
        store.put(&inner.id, bytes)?;
    }
    let inner = Arc::new(inner);
    store.cache_put(&inner.id, inner.clone() as Arc<dyn Any + Send + Sync>);
    Ok(Node(inner))
}

impl NodeInner {
    fn to_blob(&self) -> NodeBlob {
        let subnodes = if self.subnodes.iter().any(Option::is_some) {
            Some(
                self.subnodes
                    .iter()
                    .map(|child| child.as_ref().map(|r| r.id().to_string()))
                    .collect(),
            )
        } else {
            None
        };
        let (bounding_box_exact, point_count_tree) = match self.node_type {
            NodeType::PointCloudNode => (
                Some((&self.bounding_box).into()),
                Some(self.point_count_tree),
            ),
            NodeType::LinkedNode => (None, None),
        };
        NodeBlob {
            node_type: self.node_type,
            id: self.id.clone(),
            cell: self.cell,
            bounding_box_exact,
            point_count_tree,
            subnodes,
            attributes: self.attribute_keys.clone(),
        }
    }

    fn from_blob(store: &Arc<dyn BlobStore>, blob: NodeBlob) -> Result<NodeInner> {
        let mut subnodes: [Option<NodeRef>; 8] = Default::default();
        if let Some(ids) = &blob.subnodes {
            if ids.len() != 8 {
                return Err(Error::InvariantViolation(format!(
                    "node {} has {} subnode slots",
                    blob.id,
                    ids.len()
                )));
            }
            for (slot, id) in ids.iter().enumerate() {
                if let Some(id) = id {
                    subnodes[slot] = Some(NodeRef::new(store.clone(), id));
                }
            }
        }
        match blob.node_type {
            NodeType::PointCloudNode => {
                let bounding_box = blob.bounding_box_exact.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "node {} lacks its bounding box",
                        blob.id
                    ))
                })?;
                let point_count_tree = blob.point_count_tree.ok_or_else(|| {
                    Error::InvariantViolation(format!("node {} lacks its point count", blob.id))
                })?;
                Ok(NodeInner {
                    id: blob.id,
                    node_type: NodeType::PointCloudNode,
                    cell: blob.cell,
                    bounding_box: bounding_box.into(),
                    point_count_tree,
                    subnodes,
                    node_data: AttributeRefs::from_keys(store, &blob.attributes, false),
                    lod_data: AttributeRefs::from_keys(store, &blob.attributes, true),
                    attribute_keys: blob.attributes,
                    store: store.clone(),
                })
            }
            NodeType::LinkedNode => {
                // a forwarder persists nothing but cell and child id; counts
                // and bounds are resolved from the target
                let mut targets = subnodes.iter().flatten();
                let target_ref = targets.next().ok_or_else(|| {
                    Error::InvariantViolation(format!("linked node {} has no target", blob.id))
                })?;
                if targets.next().is_some() {
                    return Err(Error::InvariantViolation(format!(
                        "linked node {} has more than one target",
                        blob.id
                    )));
                }
                let target = target_ref.node()?;
                Ok(NodeInner {
                    id: blob.id,
                    node_type: NodeType::LinkedNode,
                    cell: blob.cell,
                    bounding_box: target.bounding_box(),
                    point_count_tree: target.point_count_tree(),
                    subnodes,
                    attribute_keys: blob.attributes,
                    node_data: AttributeRefs::default(),
                    lod_data: AttributeRefs::default(),
                    store: store.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.0.id)
            .field("node_type", &self.0.node_type)
            .field("cell", &self.0.cell)
            .field("point_count_tree", &self.0.point_count_tree)
            .field("is_leaf", &self.is_leaf())
            .finish()
    }
}

/// Recovers absolute positions from the cell-relative storage form.
pub fn to_absolute(relative: &[Vec3], cell: Cell) -> Vec<DVec3> {
    let center = cell.center();
    relative
        .iter()
        .map(|p| center + p.as_dvec3())
        .collect()
}

/// Converts an absolute position to the cell-relative storage form. The
/// rounding to single precision must not push the recovered position onto or
/// past the half-open cell faces, so offending components are nudged back by
/// an ulp.
pub(crate) fn to_relative(p: DVec3, cell: Cell) -> Vec3 {
    let center = cell.center();
    let bounds = cell.bounds();
    let mut relative = (p - center).as_vec3();
    for axis in 0..3 {
        while center[axis] + relative[axis] as f64 >= bounds.max[axis] {
            relative[axis] = relative[axis].next_down();
        }
        while center[axis] + (relative[axis] as f64) < bounds.min[axis] {
            relative[axis] = relative[axis].next_up();
        }
    }
    relative
}
