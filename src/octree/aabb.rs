use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in absolute double precision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub const ZERO: Aabb = Aabb {
        min: DVec3::ZERO,
        max: DVec3::ZERO,
    };

    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Tight box of a point set. Returns `Aabb::ZERO` for an empty set.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a DVec3>) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return Aabb::ZERO;
        };
        let mut bounds = Aabb::new(*first, *first);
        for p in iter {
            bounds.extend(*p);
        }
        bounds
    }

    pub fn extend(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// Inclusive containment; exact bounding boxes carry points on their faces.
    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn contains_box(&self, other: &Aabb) -> bool {
        other.min.cmpge(self.min).all() && other.max.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    pub fn inflated(&self, amount: f64) -> Aabb {
        Aabb::new(
            self.min - DVec3::splat(amount),
            self.max + DVec3::splat(amount),
        )
    }

    /// Distance from a point to the box, zero inside.
    pub fn distance_to_point(&self, p: DVec3) -> f64 {
        (p.clamp(self.min, self.max) - p).length()
    }

    pub fn corners(&self) -> [DVec3; 8] {
        let (min, max) = (self.min, self.max);
        [
            DVec3::new(min.x, min.y, min.z),
            DVec3::new(max.x, min.y, min.z),
            DVec3::new(min.x, max.y, min.z),
            DVec3::new(max.x, max.y, min.z),
            DVec3::new(min.x, min.y, max.z),
            DVec3::new(max.x, min.y, max.z),
            DVec3::new(min.x, max.y, max.z),
            DVec3::new(max.x, max.y, max.z),
        ]
    }
}

/// Wire form of an [`Aabb`] inside the persisted node blob.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl From<&Aabb> for BoundingBox {
    fn from(aabb: &Aabb) -> Self {
        Self {
            min: aabb.min.into(),
            max: aabb.max.into(),
        }
    }
}

impl From<BoundingBox> for Aabb {
    fn from(b: BoundingBox) -> Self {
        Aabb {
            min: b.min.into(),
            max: b.max.into(),
        }
    }
}
