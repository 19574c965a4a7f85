use crate::error::{Error, Result};
use crate::kdtree::KdTree;
use crate::octree::node::{AttributeArrays, Node};
use crate::progress::CancellationToken;
use glam::{DVec3, Vec3};
use std::sync::Arc;
use tracing::debug;

/// Per-point normal estimator over absolute positions. The returned array
/// must be parallel to the input.
pub type NormalEstimator = Arc<dyn Fn(&[DVec3]) -> Vec<Vec3> + Send + Sync>;

/// Bottom-up normal pass: every node that has positions but no normals gets
/// an estimated normal per position and is republished under its id. Inner
/// nodes are estimated over their LoD sample. Cancellable between nodes.
pub fn generate_normals(
    root: Node,
    estimator: &NormalEstimator,
    cancel: &CancellationToken,
) -> Result<Node> {
    cancel.check()?;
    let mut children: [Option<Node>; 8] = Default::default();
    let mut any_child = false;
    for (octant, child_ref) in root.subnodes().iter().enumerate() {
        if let Some(child_ref) = child_ref {
            children[octant] = Some(generate_normals(child_ref.node()?, estimator, cancel)?);
            any_child = true;
        }
    }
    let (data, lod) = if root.is_leaf() {
        (root.node_data(), false)
    } else {
        (root.lod_data(), true)
    };
    if data.has_normals() || !data.has_positions() {
        return Ok(root);
    }
    let Some(relative) = data.positions()? else {
        return Ok(root);
    };
    if relative.is_empty() {
        return Ok(root);
    }
    let positions = crate::octree::node::to_absolute(&relative, root.cell());
    let normals = estimator(&positions);
    if normals.len() != positions.len() {
        return Err(Error::InvariantViolation(format!(
            "normal estimator returned {} normals for {} positions",
            normals.len(),
            positions.len()
        )));
    }
    debug!(id = %root.id(), count = normals.len(), lod, "publishing normals");
    root.republish_with(
        AttributeArrays {
            normals: Some(normals),
            ..Default::default()
        },
        lod,
        any_child.then_some(children),
    )
}

/// Reference estimator: fits a plane through the `k` nearest neighbours of
/// each point and takes the plane normal (smallest eigenvector of the local
/// covariance). Orientation is arbitrary but deterministic: the normal points
/// towards positive z, then y, then x.
pub fn plane_fit_estimator(k: usize) -> NormalEstimator {
    Arc::new(move |positions: &[DVec3]| {
        if positions.is_empty() {
            return Vec::new();
        }
        // work relative to the centroid so single precision suffices
        let centroid = positions.iter().sum::<DVec3>() / positions.len() as f64;
        let local: Vec<Vec3> = positions.iter().map(|p| (*p - centroid).as_vec3()).collect();
        let tree = KdTree::build(&local);
        local
            .iter()
            .map(|p| {
                let hits = tree.k_nearest(&local, *p, f32::INFINITY, k.max(3));
                let neighbours: Vec<Vec3> = hits.iter().map(|(i, _)| local[*i as usize]).collect();
                plane_normal(&neighbours)
            })
            .collect()
    })
}

fn plane_normal(points: &[Vec3]) -> Vec3 {
    if points.len() < 3 {
        return Vec3::Z;
    }
    let mean = points.iter().copied().sum::<Vec3>() / points.len() as f32;
    let mut cov = [[0.0f64; 3]; 3];
    for p in points {
        let d = (*p - mean).as_dvec3();
        let d = [d.x, d.y, d.z];
        for (i, di) in d.iter().enumerate() {
            for (j, dj) in d.iter().enumerate() {
                cov[i][j] += di * dj;
            }
        }
    }
    let (eigenvalues, eigenvectors) = jacobi_eigen(cov);
    let mut smallest = 0;
    for i in 1..3 {
        if eigenvalues[i] < eigenvalues[smallest] {
            smallest = i;
        }
    }
    let n = DVec3::new(
        eigenvectors[0][smallest],
        eigenvectors[1][smallest],
        eigenvectors[2][smallest],
    );
    let n = n.normalize_or_zero();
    let n = if n == DVec3::ZERO { DVec3::Z } else { n };
    let flip = n.z < 0.0 || (n.z == 0.0 && (n.y < 0.0 || (n.y == 0.0 && n.x < 0.0)));
    (if flip { -n } else { n }).as_vec3()
}

/// Cyclic Jacobi iteration on a symmetric 3x3 matrix. Returns eigenvalues
/// and the matrix whose columns are the corresponding eigenvectors.
fn jacobi_eigen(mut a: [[f64; 3]; 3]) -> ([f64; 3], [[f64; 3]; 3]) {
    let mut v = [[0.0; 3]; 3];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    for _ in 0..32 {
        let off = a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2];
        if off < 1e-30 {
            break;
        }
        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            if a[p][q].abs() < 1e-300 {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;
            for r in 0..3 {
                let (arp, arq) = (a[r][p], a[r][q]);
                a[r][p] = c * arp - s * arq;
                a[r][q] = s * arp + c * arq;
            }
            for col in 0..3 {
                let (apc, aqc) = (a[p][col], a[q][col]);
                a[p][col] = c * apc - s * aqc;
                a[q][col] = s * apc + c * aqc;
            }
            for r in 0..3 {
                let (vrp, vrq) = (v[r][p], v[r][q]);
                v[r][p] = c * vrp - s * vrq;
                v[r][q] = s * vrp + c * vrq;
            }
        }
    }
    ([a[0][0], a[1][1], a[2][2]], v)
}
