pub mod aabb;
pub mod attributes;
pub mod build;
pub mod cell;
pub mod lod;
pub mod merge;
pub mod node;
pub mod normals;

pub use aabb::Aabb;
pub use attributes::PointAttribute;
pub use build::build_octree;
pub use cell::Cell;
pub use lod::generate_lod;
pub use merge::merge_octrees;
pub use node::{Node, NodeRef, NodeType};
pub use normals::{generate_normals, plane_fit_estimator, NormalEstimator};
