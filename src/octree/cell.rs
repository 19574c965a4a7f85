use crate::octree::aabb::Aabb;
use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Coordinate sentinel marking a cell centered at the origin. Keeps the wire
/// form at `{x, y, z, e}` without a separate flag.
const CENTERED: i64 = i64::MIN;

/// An axis-aligned cube of the octree grid with side length `2^e` and min
/// corner `(x, y, z) * 2^e`. Cells are half-open: a point on the upper face
/// belongs to the neighbouring cell.
///
/// The centered cell of exponent `e` spans `[-2^(e-1), +2^(e-1))` on every
/// axis; it is the only kind of cell that straddles the origin and exists to
/// contain bounding boxes that do.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cell {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    #[serde(rename = "e")]
    pub exponent: i32,
}

impl Cell {
    pub fn new(x: i64, y: i64, z: i64, exponent: i32) -> Self {
        Self { x, y, z, exponent }
    }

    pub fn centered(exponent: i32) -> Self {
        Self {
            x: CENTERED,
            y: CENTERED,
            z: CENTERED,
            exponent,
        }
    }

    pub fn is_centered(&self) -> bool {
        self.x == CENTERED
    }

    pub fn size(&self) -> f64 {
        2f64.powi(self.exponent)
    }

    pub fn bounds(&self) -> Aabb {
        if self.is_centered() {
            let half = 2f64.powi(self.exponent - 1);
            Aabb::new(DVec3::splat(-half), DVec3::splat(half))
        } else {
            let size = self.size();
            let min = DVec3::new(self.x as f64, self.y as f64, self.z as f64) * size;
            Aabb::new(min, min + DVec3::splat(size))
        }
    }

    pub fn center(&self) -> DVec3 {
        if self.is_centered() {
            DVec3::ZERO
        } else {
            let size = self.size();
            DVec3::new(
                (self.x as f64 + 0.5) * size,
                (self.y as f64 + 0.5) * size,
                (self.z as f64 + 0.5) * size,
            )
        }
    }

    /// Half-open containment test.
    pub fn contains_point(&self, p: DVec3) -> bool {
        let b = self.bounds();
        p.cmpge(b.min).all() && p.cmplt(b.max).all()
    }

    /// True if every point of `bounds` lies inside the cell, counting the
    /// upper faces of `bounds` as points.
    pub fn contains_bounds(&self, bounds: &Aabb) -> bool {
        let b = self.bounds();
        bounds.min.cmpge(b.min).all() && bounds.max.cmplt(b.max).all()
    }

    /// Exact integer containment of another cell.
    pub fn contains_cell(&self, other: &Cell) -> bool {
        if self == other {
            return true;
        }
        match (self.is_centered(), other.is_centered()) {
            (true, true) => other.exponent <= self.exponent,
            // an ordinary cell never straddles the origin
            (false, true) => false,
            (true, false) => {
                // half-extent of the centered cell in units of the other cell
                let shift = (self.exponent - 1) - other.exponent;
                if shift < 0 {
                    return false;
                }
                if shift >= 62 {
                    return true;
                }
                let half = 1i64 << shift;
                let inside = |c: i64| -half <= c && c < half;
                inside(other.x) && inside(other.y) && inside(other.z)
            }
            (false, false) => {
                let shift = self.exponent - other.exponent;
                if shift <= 0 {
                    return false;
                }
                shr_floor(other.x, shift) == self.x
                    && shr_floor(other.y, shift) == self.y
                    && shr_floor(other.z, shift) == self.z
            }
        }
    }

    pub fn parent(&self) -> Cell {
        if self.is_centered() {
            Cell::centered(self.exponent + 1)
        } else {
            Cell::new(self.x >> 1, self.y >> 1, self.z >> 1, self.exponent + 1)
        }
    }

    /// The child cell for an octant index `0..8` encoded as `x + 2y + 4z`
    /// where each bit selects the upper half of the corresponding axis.
    pub fn child(&self, octant: usize) -> Cell {
        debug_assert!(octant < 8);
        let bx = (octant & 1) as i64;
        let by = ((octant >> 1) & 1) as i64;
        let bz = ((octant >> 2) & 1) as i64;
        if self.is_centered() {
            // the eight origin-corner cells one exponent down
            Cell::new(bx - 1, by - 1, bz - 1, self.exponent - 1)
        } else {
            Cell::new(
                self.x * 2 + bx,
                self.y * 2 + by,
                self.z * 2 + bz,
                self.exponent - 1,
            )
        }
    }

    /// Octant index of the child cell a point falls into, by comparison
    /// against the cell centre.
    pub fn octant_of_point(&self, p: DVec3) -> usize {
        let c = self.center();
        (p.x >= c.x) as usize | ((p.y >= c.y) as usize) << 1 | ((p.z >= c.z) as usize) << 2
    }

    /// Octant slot of a strictly smaller contained cell.
    pub fn octant_of_cell(&self, sub: &Cell) -> usize {
        debug_assert!(self.contains_cell(sub) && self != sub);
        self.octant_of_point(sub.center())
    }

    /// The unique smallest cell containing `bounds`. A box that straddles the
    /// origin on any axis gets the centered cell of sufficient exponent.
    pub fn containing(bounds: &Aabb) -> Cell {
        let (min, max) = (bounds.min, bounds.max);
        let magnitude = min.abs().max(max.abs()).max_element();
        if magnitude == 0.0 {
            return Cell::new(0, 0, 0, 0);
        }
        let straddles = |lo: f64, hi: f64| lo < 0.0 && hi >= 0.0;
        if straddles(min.x, max.x) || straddles(min.y, max.y) || straddles(min.z, max.z) {
            let mut exponent = magnitude.log2().ceil() as i32 + 1;
            loop {
                let cell = Cell::centered(exponent);
                if cell.contains_bounds(bounds) {
                    return cell;
                }
                exponent += 1;
            }
        }
        let extent = (max - min).max_element();
        // never descend below the resolution of the coordinates themselves
        let floor_size = magnitude * f64::EPSILON;
        let mut exponent = extent.max(floor_size).log2().ceil() as i32;
        loop {
            let size = 2f64.powi(exponent);
            let cell = Cell::new(
                (min.x / size).floor() as i64,
                (min.y / size).floor() as i64,
                (min.z / size).floor() as i64,
                exponent,
            );
            if cell.contains_bounds(bounds) {
                return cell;
            }
            exponent += 1;
        }
    }

    /// Smallest cell enclosing both arguments. If either cell is centered, or
    /// the cells lie on opposite sides of the origin on some axis, the result
    /// is the smaller centered cell of sufficient exponent.
    pub fn common_root(a: &Cell, b: &Cell) -> Cell {
        if a.contains_cell(b) {
            return *a;
        }
        if b.contains_cell(a) {
            return *b;
        }
        let opposite = |p: i64, q: i64| (p < 0) != (q < 0);
        if a.is_centered()
            || b.is_centered()
            || opposite(a.x, b.x)
            || opposite(a.y, b.y)
            || opposite(a.z, b.z)
        {
            let mut exponent = a.exponent.max(b.exponent) + 1;
            loop {
                let cell = Cell::centered(exponent);
                if cell.contains_cell(a) && cell.contains_cell(b) {
                    return cell;
                }
                exponent += 1;
            }
        }
        let (mut a, mut b) = (*a, *b);
        while a.exponent < b.exponent {
            a = a.parent();
        }
        while b.exponent < a.exponent {
            b = b.parent();
        }
        while a != b {
            a = a.parent();
            b = b.parent();
        }
        a
    }
}

/// Floor division by `2^shift`; arithmetic shift right keeps floor semantics
/// for negative coordinates.
fn shr_floor(v: i64, shift: i32) -> i64 {
    if shift >= 63 {
        if v < 0 {
            -1
        } else {
            0
        }
    } else {
        v >> shift
    }
}
