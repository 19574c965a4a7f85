//! Geometric filters for the uniform traversal: plane slabs, convex hulls,
//! boxes, view frustums and padded polygons.

use crate::octree::aabb::Aabb;
use crate::query::{FilterState, SpatialFilter};
use glam::{DMat4, DVec3, DVec4};

/// Oriented plane `normal · p = distance` with unit normal; `height` is the
/// signed distance of a point.
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    normal: DVec3,
    distance: f64,
}

impl Plane {
    pub fn new(normal: DVec3, distance: f64) -> Plane {
        let length = normal.length();
        Plane {
            normal: normal / length,
            distance: distance / length,
        }
    }

    pub fn from_point_normal(point: DVec3, normal: DVec3) -> Plane {
        let normal = normal.normalize();
        Plane {
            normal,
            distance: normal.dot(point),
        }
    }

    fn from_points(a: DVec3, b: DVec3, c: DVec3) -> Plane {
        Plane::from_point_normal(a, (b - a).cross(c - a))
    }

    pub fn normal(&self) -> DVec3 {
        self.normal
    }

    pub fn height(&self, p: DVec3) -> f64 {
        self.normal.dot(p) - self.distance
    }

    fn flipped(self) -> Plane {
        Plane {
            normal: -self.normal,
            distance: -self.distance,
        }
    }

    /// Range of `height` over a box.
    fn height_interval(&self, bounds: &Aabb) -> (f64, f64) {
        let center_height = self.height(bounds.center());
        let radius = self.normal.abs().dot(bounds.size() * 0.5);
        (center_height - radius, center_height + radius)
    }
}

/// Points within `max_distance` of the plane.
pub struct NearPlane {
    plane: Plane,
    max_distance: f64,
}

impl NearPlane {
    pub fn new(plane: Plane, max_distance: f64) -> NearPlane {
        NearPlane {
            plane,
            max_distance,
        }
    }
}

impl SpatialFilter for NearPlane {
    fn classify(&self, bounds: &Aabb) -> FilterState {
        let (lo, hi) = self.plane.height_interval(bounds);
        if lo >= -self.max_distance && hi <= self.max_distance {
            FilterState::FullyInside
        } else if lo > self.max_distance || hi < -self.max_distance {
            FilterState::FullyOutside
        } else {
            FilterState::Partial
        }
    }

    fn contains(&self, point: DVec3) -> bool {
        self.plane.height(point).abs() <= self.max_distance
    }
}

/// Complement of another filter; the point predicates partition exactly.
pub struct Complement<F>(pub F);

impl<F: SpatialFilter> SpatialFilter for Complement<F> {
    fn classify(&self, bounds: &Aabb) -> FilterState {
        match self.0.classify(bounds) {
            FilterState::FullyInside => FilterState::FullyOutside,
            FilterState::FullyOutside => FilterState::FullyInside,
            FilterState::Partial => FilterState::Partial,
        }
    }

    fn contains(&self, point: DVec3) -> bool {
        !self.0.contains(point)
    }
}

/// Points farther than `min_distance` from the plane.
pub fn not_near_plane(plane: Plane, min_distance: f64) -> Complement<NearPlane> {
    Complement(NearPlane::new(plane, min_distance))
}

/// Points within `max_distance` of any of the planes.
pub struct NearPlanes {
    planes: Vec<Plane>,
    max_distance: f64,
}

impl NearPlanes {
    pub fn new(planes: Vec<Plane>, max_distance: f64) -> NearPlanes {
        NearPlanes {
            planes,
            max_distance,
        }
    }
}

impl SpatialFilter for NearPlanes {
    fn classify(&self, bounds: &Aabb) -> FilterState {
        let mut all_outside = true;
        for plane in &self.planes {
            let (lo, hi) = plane.height_interval(bounds);
            if lo >= -self.max_distance && hi <= self.max_distance {
                return FilterState::FullyInside;
            }
            if !(lo > self.max_distance || hi < -self.max_distance) {
                all_outside = false;
            }
        }
        if all_outside {
            FilterState::FullyOutside
        } else {
            FilterState::Partial
        }
    }

    fn contains(&self, point: DVec3) -> bool {
        self.planes
            .iter()
            .any(|plane| plane.height(point).abs() <= self.max_distance)
    }
}

/// Intersection of half-spaces `height(p) <= 0`; also the box and frustum
/// filter in hull form.
pub struct ConvexHull {
    planes: Vec<Plane>,
}

impl ConvexHull {
    pub fn new(planes: Vec<Plane>) -> ConvexHull {
        ConvexHull { planes }
    }

    /// The axis-aligned box as six half-spaces.
    pub fn from_box(bounds: &Aabb) -> ConvexHull {
        ConvexHull {
            planes: vec![
                Plane::from_point_normal(bounds.min, -DVec3::X),
                Plane::from_point_normal(bounds.min, -DVec3::Y),
                Plane::from_point_normal(bounds.min, -DVec3::Z),
                Plane::from_point_normal(bounds.max, DVec3::X),
                Plane::from_point_normal(bounds.max, DVec3::Y),
                Plane::from_point_normal(bounds.max, DVec3::Z),
            ],
        }
    }

    /// The view frustum of a view-projection matrix: the canonical NDC cube
    /// corners are unprojected and the six face planes oriented inwards.
    pub fn from_view_projection(view_projection: DMat4) -> ConvexHull {
        let inverse = view_projection.inverse();
        let unproject = |x: f64, y: f64, z: f64| {
            let v = inverse * DVec4::new(x, y, z, 1.0);
            v.truncate() / v.w
        };
        let corners = [
            unproject(-1.0, -1.0, -1.0),
            unproject(1.0, -1.0, -1.0),
            unproject(-1.0, 1.0, -1.0),
            unproject(1.0, 1.0, -1.0),
            unproject(-1.0, -1.0, 1.0),
            unproject(1.0, -1.0, 1.0),
            unproject(-1.0, 1.0, 1.0),
            unproject(1.0, 1.0, 1.0),
        ];
        let center = corners.iter().sum::<DVec3>() / 8.0;
        let faces = [
            [0, 1, 2], // near
            [4, 6, 5], // far
            [0, 2, 4], // left
            [1, 5, 3], // right
            [2, 3, 6], // top
            [0, 4, 1], // bottom
        ];
        let planes = faces
            .iter()
            .map(|[a, b, c]| {
                let plane = Plane::from_points(corners[*a], corners[*b], corners[*c]);
                if plane.height(center) > 0.0 {
                    plane.flipped()
                } else {
                    plane
                }
            })
            .collect();
        ConvexHull { planes }
    }

    pub fn contains(&self, point: DVec3) -> bool {
        self.planes.iter().all(|plane| plane.height(point) <= 0.0)
    }
}

impl SpatialFilter for ConvexHull {
    fn classify(&self, bounds: &Aabb) -> FilterState {
        let mut fully_inside = true;
        for plane in &self.planes {
            let (lo, hi) = plane.height_interval(bounds);
            if lo > 0.0 {
                return FilterState::FullyOutside;
            }
            if hi > 0.0 {
                fully_inside = false;
            }
        }
        if fully_inside {
            FilterState::FullyInside
        } else {
            FilterState::Partial
        }
    }

    fn contains(&self, point: DVec3) -> bool {
        ConvexHull::contains(self, point)
    }
}

/// Points within `max_distance` of a planar polygon.
///
/// Nodes are only ever pruned against the polygon's padded bounds; the exact
/// test runs per point.
pub struct NearPolygon {
    vertices: Vec<DVec3>,
    plane: Plane,
    padded_bounds: Aabb,
    max_distance: f64,
}

impl NearPolygon {
    pub fn new(vertices: Vec<DVec3>, max_distance: f64) -> Option<NearPolygon> {
        if vertices.len() < 3 {
            return None;
        }
        let a = vertices[0];
        let mut normal = DVec3::ZERO;
        for i in 1..vertices.len() - 1 {
            normal = (vertices[i] - a).cross(vertices[i + 1] - a);
            if normal.length_squared() > 0.0 {
                break;
            }
        }
        if normal.length_squared() == 0.0 {
            return None;
        }
        let plane = Plane::from_point_normal(a, normal);
        let padded_bounds = Aabb::from_points(vertices.iter()).inflated(max_distance);
        Some(NearPolygon {
            vertices,
            plane,
            padded_bounds,
            max_distance,
        })
    }

    pub fn distance(&self, point: DVec3) -> f64 {
        let height = self.plane.height(point);
        let projected = point - self.plane.normal() * height;
        if self.projection_is_inside(projected) {
            return height.abs();
        }
        let mut best = f64::INFINITY;
        for (i, a) in self.vertices.iter().enumerate() {
            let b = self.vertices[(i + 1) % self.vertices.len()];
            best = best.min(segment_distance(point, *a, b));
        }
        best
    }

    /// 2D even-odd test in the dominant plane of the polygon normal.
    fn projection_is_inside(&self, p: DVec3) -> bool {
        let n = self.plane.normal().abs();
        let (u, v) = if n.x >= n.y && n.x >= n.z {
            (1, 2)
        } else if n.y >= n.z {
            (0, 2)
        } else {
            (0, 1)
        };
        let mut inside = false;
        for (i, a) in self.vertices.iter().enumerate() {
            let b = self.vertices[(i + 1) % self.vertices.len()];
            let (ax, ay) = (a[u], a[v]);
            let (bx, by) = (b[u], b[v]);
            let (px, py) = (p[u], p[v]);
            if (ay > py) != (by > py) {
                let x = ax + (py - ay) / (by - ay) * (bx - ax);
                if px < x {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

impl SpatialFilter for NearPolygon {
    fn classify(&self, bounds: &Aabb) -> FilterState {
        if !self.padded_bounds.intersects(bounds) {
            FilterState::FullyOutside
        } else {
            FilterState::Partial
        }
    }

    fn contains(&self, point: DVec3) -> bool {
        self.distance(point) <= self.max_distance
    }
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
