use std::sync::Arc;

use glam::{Mat3, Vec2, Vec3, Vec4};

use bvh::Aabb;

/// Position/normal/texcoord/color vertex, the layout triangle records carry.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub color: Vec4,
}

impl Vertex {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// Surface description owned by the mesh layer; triangles only hold a shared
/// handle to it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Material {
    pub diffuse: Vec4,
}

/// A triangle with its Woop intersection transform baked in.
///
/// The transform maps world space into a frame where the triangle is the unit
/// right triangle at the origin with its normal along +z, so intersection is
/// two matrix-vector multiplies and a plane solve. It is recomputed whenever
/// the geometry is set and never at query time.
#[derive(Clone, Debug)]
pub struct RtTriangle {
    vertices: [Vertex; 3],
    /// Non-owning reference into the mesh's material table.
    pub material: Option<Arc<Material>>,
    unit_from_world: Mat3,
    unit_offset: Vec3,
}

impl RtTriangle {
    pub fn new(v0: Vertex, v1: Vertex, v2: Vertex) -> Self {
        let mut tri = Self {
            vertices: [v0, v1, v2],
            material: None,
            unit_from_world: Mat3::IDENTITY,
            unit_offset: Vec3::ZERO,
        };
        tri.recompute_transform();
        tri
    }

    pub fn from_positions(p0: Vec3, p1: Vec3, p2: Vec3) -> Self {
        Self::new(
            Vertex::from_position(p0),
            Vertex::from_position(p1),
            Vertex::from_position(p2),
        )
    }

    pub fn with_material(mut self, material: Arc<Material>) -> Self {
        self.material = Some(material);
        self
    }

    pub fn vertices(&self) -> &[Vertex; 3] {
        &self.vertices
    }

    /// Replaces the geometry and rebuilds the intersection transform.
    pub fn set_vertices(&mut self, vertices: [Vertex; 3]) {
        self.vertices = vertices;
        self.recompute_transform();
    }

    fn recompute_transform(&mut self) {
        let [v0, v1, v2] = self.positions();
        // Degenerate triangles make this singular; the non-finite transform
        // then fails the u/v acceptance test on every query.
        let m = Mat3::from_cols(v1 - v0, v2 - v0, self.normal()).inverse();
        self.unit_from_world = m;
        self.unit_offset = -(m * v0);
    }

    pub fn positions(&self) -> [Vec3; 3] {
        [
            self.vertices[0].position,
            self.vertices[1].position,
            self.vertices[2].position,
        ]
    }

    pub fn min(&self) -> Vec3 {
        let [p0, p1, p2] = self.positions();
        p0.min(p1).min(p2)
    }

    pub fn max(&self) -> Vec3 {
        let [p0, p1, p2] = self.positions();
        p0.max(p1).max(p2)
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::new(self.min(), self.max())
    }

    pub fn centroid(&self) -> Vec3 {
        let [p0, p1, p2] = self.positions();
        (p0 + p1 + p2) / 3.
    }

    pub fn bb_center(&self) -> Vec3 {
        0.5 * (self.min() + self.max())
    }

    pub fn area(&self) -> f32 {
        let [p0, p1, p2] = self.positions();
        (p1 - p0).cross(p2 - p0).length() * 0.5
    }

    pub fn normal(&self) -> Vec3 {
        let [p0, p1, p2] = self.positions();
        (p1 - p0).cross(p2 - p0).normalize()
    }

    /// Woop intersection [Woop04]: transform the ray into the canonical
    /// triangle frame, solve the z plane for `t`, then point-in-triangle in
    /// 2D. Returns `(t, u, v)` when `u > 0`, `v > 0`, `u + v < 1`; the caller
    /// filters `t` against its own range.
    pub fn intersect_woop(&self, orig: Vec3, dir: Vec3) -> Option<(f32, f32, f32)> {
        let o = self.unit_from_world * orig + self.unit_offset;
        let d = self.unit_from_world * dir;

        let t = -o.z / d.z;
        let u = o.x + d.x * t;
        let v = o.y + d.y * t;

        (u > 0. && v > 0. && u + v < 1.).then_some((t, u, v))
    }
}
