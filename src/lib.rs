//! Spatial-acceleration ray-tracing core: triangle records with precomputed
//! Woop intersection transforms, a SAH-built bounding volume hierarchy, a
//! digest-gated binary cache for it, and nearest-hit traversal.

pub mod digest;
pub mod tracer;
pub mod triangle;

pub use bvh::{Aabb, Bvh, BvhNode, SplitMethod, StoreError};
pub use digest::GeometryDigest;
pub use tracer::{HierarchySource, RayTracer, RaycastResult, TracerError};
pub use triangle::{Material, RtTriangle, Vertex};

use glam::{Mat3, Vec3};

/// Orthonormal basis with `n` as its local z axis, for callers that sample
/// directions around a hit normal.
pub fn form_basis(n: Vec3) -> Mat3 {
    let mut q = n;
    let min_axis = (0..3).fold(0, |best, i| if n[best].abs() > n[i].abs() { i } else { best });
    q[min_axis] = 1.;

    let t = q.cross(n).normalize();
    let b = n.cross(t).normalize();
    Mat3::from_cols(t, b, n)
}
