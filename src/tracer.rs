use std::{
    fs::File,
    io::{self, BufReader, BufWriter},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use glam::Vec3;

use bvh::{Bvh, SplitMethod, StoreError};

use crate::{digest::GeometryDigest, triangle::RtTriangle};

/// Nearest intersection found by [`RayTracer::raycast`]. `t` is strictly
/// positive and measured in units of the query direction; barycentrics `u`,
/// `v` weight the second and third vertex, with `1 - u - v` on the first.
#[derive(Clone, Debug)]
pub struct RaycastResult<'a> {
    pub tri: &'a RtTriangle,
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub point: Vec3,
    pub orig: Vec3,
    pub dir: Vec3,
}

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    /// Soft failure: the stored hierarchy was built for different geometry.
    /// The expected reaction is a rebuild, not an abort.
    #[error("stored hierarchy is stale: built for {stored}, current geometry is {current}")]
    StaleHierarchy {
        stored: GeometryDigest,
        current: GeometryDigest,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to open hierarchy file")]
    Io(#[from] io::Error),
}

/// Where [`RayTracer::load_or_construct`] got its hierarchy from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HierarchySource {
    Loaded,
    Rebuilt,
}

/// Ray-tracing façade: owns the triangle buffer and its hierarchy, answers
/// nearest-hit queries and keeps a thread-safe count of rays cast.
///
/// Build/load is a distinct exclusive phase (`&mut self`); afterwards any
/// number of threads may call [`RayTracer::raycast`] concurrently — the ray
/// counter is the only mutable state it touches.
#[derive(Default)]
pub struct RayTracer {
    triangles: Vec<RtTriangle>,
    bvh: Bvh,
    ray_count: AtomicU64,
}

impl RayTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triangles(&self) -> &[RtTriangle] {
        &self.triangles
    }

    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    pub fn ray_count(&self) -> u64 {
        self.ray_count.load(Ordering::Relaxed)
    }

    pub fn reset_ray_counter(&self) {
        self.ray_count.store(0, Ordering::Relaxed);
    }

    /// Builds a fresh hierarchy over `triangles` with the given split policy.
    /// An empty triangle set yields the documented empty hierarchy: every
    /// raycast reports no hit.
    pub fn construct_hierarchy(&mut self, triangles: Vec<RtTriangle>, method: SplitMethod) {
        let boxes: Vec<_> = triangles.iter().map(RtTriangle::aabb).collect();
        let centroids: Vec<_> = triangles.iter().map(RtTriangle::centroid).collect();
        self.bvh = Bvh::build(&boxes, &centroids, method);
        self.triangles = triangles;
    }

    /// Saves the current hierarchy, embedding the digest of the current
    /// triangle buffer so a later load can verify it still matches.
    pub fn save_hierarchy(&self, path: impl AsRef<Path>) -> Result<(), TracerError> {
        let digest = GeometryDigest::of_triangles(&self.triangles);
        let mut writer = BufWriter::new(File::create(path)?);
        self.bvh.save(&mut writer, digest.to_bytes())?;
        Ok(())
    }

    /// Loads a stored hierarchy for `triangles`, verifying the embedded
    /// digest against the buffer. On any error (including the soft
    /// [`TracerError::StaleHierarchy`]) the tracer keeps its previous state.
    pub fn load_hierarchy(
        &mut self,
        path: impl AsRef<Path>,
        triangles: Vec<RtTriangle>,
    ) -> Result<(), TracerError> {
        let bvh = Self::try_load(path.as_ref(), &triangles)?;
        self.bvh = bvh;
        self.triangles = triangles;
        Ok(())
    }

    /// The original cache-gating loop in one call: load when the stored
    /// hierarchy matches the geometry, otherwise rebuild and re-save.
    pub fn load_or_construct(
        &mut self,
        path: impl AsRef<Path>,
        triangles: Vec<RtTriangle>,
        method: SplitMethod,
    ) -> Result<HierarchySource, TracerError> {
        let path = path.as_ref();
        match Self::try_load(path, &triangles) {
            Ok(bvh) => {
                self.bvh = bvh;
                self.triangles = triangles;
                Ok(HierarchySource::Loaded)
            }
            Err(err) => {
                log::info!("rebuilding hierarchy ({err})");
                self.construct_hierarchy(triangles, method);
                self.save_hierarchy(path)?;
                Ok(HierarchySource::Rebuilt)
            }
        }
    }

    fn try_load(path: &Path, triangles: &[RtTriangle]) -> Result<Bvh, TracerError> {
        let mut reader = BufReader::new(File::open(path)?);
        let (bvh, stored) = Bvh::load(&mut reader)?;
        let stored = GeometryDigest::from_bytes(stored);
        let current = GeometryDigest::of_triangles(triangles);
        if stored != current {
            return Err(TracerError::StaleHierarchy { stored, current });
        }
        if bvh.indices().len() != triangles.len() {
            return Err(StoreError::Malformed("primitive count mismatch").into());
        }
        Ok(bvh)
    }

    /// Nearest-hit query. `t` is searched in `(0, 1]`: the direction's scale
    /// encodes the probe length, so a unit direction limits the query to a
    /// unit-length segment. Returns `None` when nothing is hit in range.
    pub fn raycast(&self, orig: Vec3, dir: Vec3) -> Option<RaycastResult<'_>> {
        self.ray_count.fetch_add(1, Ordering::Relaxed);
        if self.bvh.is_empty() {
            return None;
        }

        let nodes = self.bvh.nodes();
        let inv_dir = dir.recip();
        let mut t_min = 1.0f32;
        let mut best: Option<(u32, f32, f32)> = None;

        // Iterative traversal, nearer child first. Deferred subtrees carry
        // their box entry distance so they can be skipped on pop once t_min
        // has shrunk past them.
        let mut stack: Vec<(u32, f32)> = Vec::with_capacity(64);
        let mut current = 0u32;
        if nodes[0].aabb().hit_distance(orig, inv_dir, t_min).is_none() {
            return None;
        }
        'walk: loop {
            let node = &nodes[current as usize];
            if node.is_leaf() {
                for &tri_idx in self.bvh.leaf_indices(node) {
                    let tri = &self.triangles[tri_idx as usize];
                    // `t` is searched on the closed upper bound so a hit at
                    // exactly tMax still counts.
                    if let Some((t, u, v)) = tri.intersect_woop(orig, dir) {
                        if t > 0. && t <= t_min {
                            t_min = t;
                            best = Some((tri_idx, u, v));
                        }
                    }
                }
            } else {
                let near = node.left_first;
                let far = near + 1;
                let d_near = nodes[near as usize].aabb().hit_distance(orig, inv_dir, t_min);
                let d_far = nodes[far as usize].aabb().hit_distance(orig, inv_dir, t_min);
                let ((near, d_near), (far, d_far)) = match (d_near, d_far) {
                    (Some(a), Some(b)) if b < a => ((far, d_far), (near, d_near)),
                    (None, Some(_)) => ((far, d_far), (near, d_near)),
                    _ => ((near, d_near), (far, d_far)),
                };
                if d_near.is_some() {
                    if let Some(d) = d_far {
                        stack.push((far, d));
                    }
                    current = near;
                    continue 'walk;
                }
            }

            // Pop the next deferred subtree that can still beat the best hit.
            loop {
                let Some((idx, entry)) = stack.pop() else {
                    break 'walk;
                };
                if entry > t_min {
                    continue;
                }
                current = idx;
                continue 'walk;
            }
        }

        best.map(|(tri_idx, u, v)| RaycastResult {
            tri: &self.triangles[tri_idx as usize],
            t: t_min,
            u,
            v,
            point: orig + t_min * dir,
            orig,
            dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triangle::RtTriangle;
    use glam::vec3;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn unit_triangle_scene() -> RayTracer {
        let mut rt = RayTracer::new();
        rt.construct_hierarchy(
            vec![RtTriangle::from_positions(Vec3::ZERO, Vec3::X, Vec3::Y)],
            SplitMethod::Sah,
        );
        rt
    }

    fn random_triangles(n: usize, seed: u64) -> Vec<RtTriangle> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut rand_vec = |lo: f32, hi: f32| {
            vec3(
                rng.gen_range(lo..hi),
                rng.gen_range(lo..hi),
                rng.gen_range(lo..hi),
            )
        };
        (0..n)
            .map(|_| {
                let p0 = rand_vec(-5., 5.);
                (p0, rand_vec(0., 1.), rand_vec(0., 1.))
            })
            .map(|(p0, e1, e2)| RtTriangle::from_positions(p0, p0 + e1, p0 + e2))
            .collect()
    }

    #[test]
    fn hits_unit_triangle_at_known_point() {
        let rt = unit_triangle_scene();
        let hit = rt.raycast(vec3(0.25, 0.25, 1.), vec3(0., 0., -1.)).unwrap();
        assert!((hit.t - 1.).abs() < 1e-6);
        assert!((hit.u - 0.25).abs() < 1e-5);
        assert!((hit.v - 0.25).abs() < 1e-5);
        assert!(hit.point.distance(vec3(0.25, 0.25, 0.)) < 1e-5);
    }

    #[test]
    fn misses_inside_bounding_box() {
        let rt = unit_triangle_scene();
        assert!(rt.raycast(vec3(0.9, 0.9, 1.), vec3(0., 0., -1.)).is_none());
    }

    #[test]
    fn direction_scale_limits_range() {
        let rt = unit_triangle_scene();
        // Triangle sits 2 units away but the direction only reaches 1.
        assert!(rt.raycast(vec3(0.25, 0.25, 2.), vec3(0., 0., -1.)).is_none());
        assert!(rt.raycast(vec3(0.25, 0.25, 2.), vec3(0., 0., -2.)).is_some());
    }

    #[test]
    fn reports_nearest_of_stacked_triangles() {
        for method in [SplitMethod::Sah, SplitMethod::SingleLeaf] {
            let triangles: Vec<_> = [0.8, 0.2, 0.5, 0.35]
                .iter()
                .map(|&z| {
                    RtTriangle::from_positions(
                        vec3(0., 0., z),
                        vec3(1., 0., z),
                        vec3(0., 1., z),
                    )
                })
                .collect();
            let mut rt = RayTracer::new();
            rt.construct_hierarchy(triangles, method);

            let hit = rt.raycast(vec3(0.25, 0.25, 1.), vec3(0., 0., -1.)).unwrap();
            assert!((hit.t - 0.2).abs() < 1e-6);
            assert!((hit.point.z - 0.8).abs() < 1e-5);
        }
    }

    #[test]
    fn empty_scene_always_misses() {
        let rt = RayTracer::new();
        assert!(rt.raycast(Vec3::ZERO, vec3(0., 0., -1.)).is_none());
        assert_eq!(rt.ray_count(), 1);
    }

    #[test]
    fn ray_counter_counts_and_resets() {
        let rt = unit_triangle_scene();
        for _ in 0..5 {
            rt.raycast(vec3(0.25, 0.25, 1.), vec3(0., 0., -1.));
        }
        assert_eq!(rt.ray_count(), 5);
        rt.reset_ray_counter();
        assert_eq!(rt.ray_count(), 0);
    }

    #[test]
    fn concurrent_raycasts_share_one_counter() {
        const THREADS: usize = 8;
        const RAYS_PER_THREAD: usize = 250;

        let rt = unit_triangle_scene();
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for i in 0..RAYS_PER_THREAD {
                        let x = 0.1 + 0.2 * i as f32 / RAYS_PER_THREAD as f32;
                        let hit = rt.raycast(vec3(x, 0.25, 1.), vec3(0., 0., -1.)).unwrap();
                        assert!((hit.t - 1.).abs() < 1e-6);
                    }
                });
            }
        });
        assert_eq!(rt.ray_count(), (THREADS * RAYS_PER_THREAD) as u64);
    }

    #[test]
    fn random_scene_matches_brute_force() {
        let triangles = random_triangles(300, 11);
        let mut sah = RayTracer::new();
        sah.construct_hierarchy(triangles.clone(), SplitMethod::Sah);
        let mut brute = RayTracer::new();
        brute.construct_hierarchy(triangles, SplitMethod::SingleLeaf);

        let mut rng = SmallRng::seed_from_u64(23);
        for _ in 0..200 {
            let orig = vec3(
                rng.gen_range(-6. ..6.),
                rng.gen_range(-6. ..6.),
                rng.gen_range(-6. ..6.),
            );
            let dir = (vec3(
                rng.gen_range(-1. ..1.),
                rng.gen_range(-1. ..1.),
                rng.gen_range(-1. ..1.),
            )) * 12.;

            let a = sah.raycast(orig, dir);
            let b = brute.raycast(orig, dir);
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    assert!((a.t - b.t).abs() < 1e-5);
                    assert!((a.u - b.u).abs() < 1e-4);
                    assert!((a.v - b.v).abs() < 1e-4);
                }
                (a, b) => panic!(
                    "hierarchy disagreement: sah={:?} brute={:?}",
                    a.map(|r| r.t),
                    b.map(|r| r.t)
                ),
            }
        }
    }

    #[test]
    fn save_load_round_trip_preserves_results() {
        let path = std::env::temp_dir().join("rt-core-test-roundtrip.bvh");
        let triangles = random_triangles(500, 3);

        let mut built = RayTracer::new();
        built.construct_hierarchy(triangles.clone(), SplitMethod::Sah);
        built.save_hierarchy(&path).unwrap();

        let mut loaded = RayTracer::new();
        loaded.load_hierarchy(&path, triangles).unwrap();
        assert_eq!(built.bvh(), loaded.bvh());

        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..100 {
            let orig = vec3(
                rng.gen_range(-6. ..6.),
                rng.gen_range(-6. ..6.),
                rng.gen_range(-6. ..6.),
            );
            let dir_v = vec3(
                rng.gen_range(-1. ..1.),
                rng.gen_range(-1. ..1.),
                rng.gen_range(-1. ..1.),
            ) * 12.;
            let a = built.raycast(orig, dir_v);
            let b = loaded.raycast(orig, dir_v);
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    assert_eq!(a.t, b.t);
                    assert_eq!(a.u, b.u);
                    assert_eq!(a.v, b.v);
                }
                _ => panic!("loaded hierarchy disagrees with the one saved"),
            }
        }
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stale_digest_is_a_soft_error() {
        let path = std::env::temp_dir().join("rt-core-test-stale.bvh");
        let triangles = random_triangles(50, 9);

        let mut rt = RayTracer::new();
        rt.construct_hierarchy(triangles, SplitMethod::Sah);
        rt.save_hierarchy(&path).unwrap();

        // One vertex moved: the digest must no longer match.
        let mut tweaked = random_triangles(50, 9);
        let mut vertices = *tweaked[0].vertices();
        vertices[0].position.x += 1e-4;
        tweaked[0].set_vertices(vertices);

        let mut fresh = RayTracer::new();
        let err = fresh.load_hierarchy(&path, tweaked.clone()).unwrap_err();
        assert!(matches!(err, TracerError::StaleHierarchy { .. }));

        // load_or_construct treats staleness as a rebuild signal.
        let source = fresh
            .load_or_construct(&path, tweaked.clone(), SplitMethod::Sah)
            .unwrap();
        assert_eq!(source, HierarchySource::Rebuilt);

        // And the re-saved file now loads cleanly.
        let mut again = RayTracer::new();
        again.load_hierarchy(&path, tweaked).unwrap();
        let _ = std::fs::remove_file(path);
    }
}
