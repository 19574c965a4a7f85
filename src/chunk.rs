use crate::error::{Error, Result};
use crate::octree::aabb::Aabb;
use glam::{DVec3, Vec3};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// A batch of raw samples: parallel arrays of absolute double-precision
/// positions and optional per-point attributes, with a cached bounding box.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    positions: Vec<DVec3>,
    colors: Option<Vec<[u8; 4]>>,
    normals: Option<Vec<Vec3>>,
    intensities: Option<Vec<i32>>,
    classifications: Option<Vec<u8>>,
    bounds: Aabb,
}

impl Chunk {
    pub fn new(positions: Vec<DVec3>) -> Result<Chunk> {
        if let Some(index) = positions.iter().position(|p| !p.is_finite()) {
            return Err(Error::InvalidChunk(format!(
                "non-finite position at index {index}"
            )));
        }
        let bounds = Aabb::from_points(positions.iter());
        Ok(Chunk {
            positions,
            bounds,
            ..Chunk::default()
        })
    }

    pub fn with_colors(mut self, colors: Vec<[u8; 4]>) -> Result<Chunk> {
        check_len("colors", colors.len(), self.positions.len())?;
        self.colors = Some(colors);
        Ok(self)
    }

    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Result<Chunk> {
        check_len("normals", normals.len(), self.positions.len())?;
        self.normals = Some(normals);
        Ok(self)
    }

    pub fn with_intensities(mut self, intensities: Vec<i32>) -> Result<Chunk> {
        check_len("intensities", intensities.len(), self.positions.len())?;
        self.intensities = Some(intensities);
        Ok(self)
    }

    pub fn with_classifications(mut self, classifications: Vec<u8>) -> Result<Chunk> {
        check_len(
            "classifications",
            classifications.len(),
            self.positions.len(),
        )?;
        self.classifications = Some(classifications);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[DVec3] {
        &self.positions
    }

    pub fn colors(&self) -> Option<&[[u8; 4]]> {
        self.colors.as_deref()
    }

    pub fn normals(&self) -> Option<&[Vec3]> {
        self.normals.as_deref()
    }

    pub fn intensities(&self) -> Option<&[i32]> {
        self.intensities.as_deref()
    }

    pub fn classifications(&self) -> Option<&[u8]> {
        self.classifications.as_deref()
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// Pure per-point position transform; bounds are recomputed and the
    /// result re-validated.
    pub fn reprojected(self, transform: impl Fn(DVec3) -> DVec3) -> Result<Chunk> {
        let positions = self.positions.into_iter().map(transform).collect();
        let reprojected = Chunk::new(positions)?;
        Ok(Chunk {
            colors: self.colors,
            normals: self.normals,
            intensities: self.intensities,
            classifications: self.classifications,
            ..reprojected
        })
    }

    /// Minimum-distance thinning: keeps a subset whose pairwise distance is
    /// `>= min_dist`, deterministically in input order. A grid with cell side
    /// `min_dist` buckets the kept points; acceptance checks the 27-cell
    /// neighbourhood.
    pub fn thinned(self, min_dist: f64) -> Chunk {
        if min_dist <= 0.0 || self.is_empty() {
            return self;
        }
        let inv = 1.0 / min_dist;
        let limit_sq = min_dist * min_dist;
        let cell_of = |p: &DVec3| {
            (
                (p.x * inv).floor() as i64,
                (p.y * inv).floor() as i64,
                (p.z * inv).floor() as i64,
            )
        };
        let mut grid: HashMap<(i64, i64, i64), Vec<u32>> = HashMap::new();
        let mut kept: Vec<u32> = Vec::new();
        'candidates: for (index, p) in self.positions.iter().enumerate() {
            let (cx, cy, cz) = cell_of(p);
            for dx in -1..=1 {
                for dy in -1..=1 {
                    for dz in -1..=1 {
                        let Some(bucket) = grid.get(&(cx + dx, cy + dy, cz + dz)) else {
                            continue;
                        };
                        for &j in bucket {
                            let d = self.positions[j as usize] - *p;
                            if d.length_squared() < limit_sq {
                                continue 'candidates;
                            }
                        }
                    }
                }
            }
            grid.entry((cx, cy, cz)).or_default().push(index as u32);
            kept.push(index as u32);
        }
        if kept.len() == self.len() {
            self
        } else {
            self.select(&kept)
        }
    }

    /// Content hash over all parallel arrays, for chunk deduplication.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.positions.len().hash(&mut hasher);
        for p in &self.positions {
            p.x.to_bits().hash(&mut hasher);
            p.y.to_bits().hash(&mut hasher);
            p.z.to_bits().hash(&mut hasher);
        }
        self.colors.hash(&mut hasher);
        if let Some(normals) = &self.normals {
            for n in normals {
                n.x.to_bits().hash(&mut hasher);
                n.y.to_bits().hash(&mut hasher);
                n.z.to_bits().hash(&mut hasher);
            }
        }
        self.intensities.hash(&mut hasher);
        self.classifications.hash(&mut hasher);
        hasher.finish()
    }

    /// Subset by point indices, keeping attribute columns parallel.
    pub(crate) fn select(&self, indices: &[u32]) -> Chunk {
        fn pick<T: Copy>(values: &Option<Vec<T>>, indices: &[u32]) -> Option<Vec<T>> {
            values
                .as_ref()
                .map(|v| indices.iter().map(|&i| v[i as usize]).collect())
        }
        let positions: Vec<DVec3> = indices
            .iter()
            .map(|&i| self.positions[i as usize])
            .collect();
        let bounds = Aabb::from_points(positions.iter());
        Chunk {
            positions,
            colors: pick(&self.colors, indices),
            normals: pick(&self.normals, indices),
            intensities: pick(&self.intensities, indices),
            classifications: pick(&self.classifications, indices),
            bounds,
        }
    }

    /// Concatenation for merges. An optional column survives only if both
    /// sides carry it; fabricating filler values for one side would present
    /// invented data to queries.
    pub(crate) fn concat(mut self, other: Chunk) -> Chunk {
        fn join<T>(a: &mut Option<Vec<T>>, b: Option<Vec<T>>) {
            match (a.as_mut(), b) {
                (Some(a), Some(mut b)) => a.append(&mut b),
                (Some(_), None) => *a = None,
                (None, _) => {}
            }
        }
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        self.bounds = self.bounds.union(&other.bounds);
        self.positions.extend(other.positions);
        join(&mut self.colors, other.colors);
        join(&mut self.normals, other.normals);
        join(&mut self.intensities, other.intensities);
        join(&mut self.classifications, other.classifications);
        self
    }

    pub(crate) fn from_parts(
        positions: Vec<DVec3>,
        colors: Option<Vec<[u8; 4]>>,
        normals: Option<Vec<Vec3>>,
        intensities: Option<Vec<i32>>,
        classifications: Option<Vec<u8>>,
    ) -> Chunk {
        let bounds = Aabb::from_points(positions.iter());
        Chunk {
            positions,
            colors,
            normals,
            intensities,
            classifications,
            bounds,
        }
    }
}

fn check_len(name: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::InvalidChunk(format!(
            "{name} length {got} does not match {expected} positions"
        )));
    }
    Ok(())
}
