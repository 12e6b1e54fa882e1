use glam::Vec3;

pub(crate) const MAX_DIST: f32 = 1e30;

/// Axis-aligned bounding box. A valid box has `min <= max` componentwise;
/// [`Aabb::EMPTY`] is the identity for [`Aabb::union`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(MAX_DIST),
        max: Vec3::splat(-MAX_DIST),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(self, rhs: Self) -> Self {
        Self {
            min: self.min.min(rhs.min),
            max: self.max.max(rhs.max),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    pub fn center(&self) -> Vec3 {
        0.5 * (self.min + self.max)
    }

    pub fn area(&self) -> f32 {
        if !self.is_valid() {
            return 0.;
        }
        let d = self.max - self.min;
        2. * (d.x * d.y + d.x * d.z + d.y * d.z)
    }

    /// Slab test against a ray with precomputed inverse direction. Returns the
    /// entry distance, or `None` when the box misses, lies fully behind the
    /// origin, or cannot beat `t_min`. Zero direction components produce
    /// infinities in `inv_dir` and fall out of the min/max reduction.
    pub fn hit_distance(&self, orig: Vec3, inv_dir: Vec3, t_min: f32) -> Option<f32> {
        let t1 = (self.min - orig) * inv_dir;
        let t2 = (self.max - orig) * inv_dir;
        let start = t1.min(t2).max_element();
        let end = t1.max(t2).min_element();
        if start > end || end < 0. || start > t_min {
            None
        } else {
            Some(start)
        }
    }
}
