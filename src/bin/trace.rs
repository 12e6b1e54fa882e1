use std::{array, time::Instant};

use color_eyre::Result;
use glam::{vec3, Vec3};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use rt_core::{HierarchySource, RayTracer, RtTriangle, SplitMethod};

const TRIANGLES: usize = 10_000;
const WIDTH: usize = 256;
const HEIGHT: usize = 256;

fn random_soup(n: usize, seed: u64) -> Vec<RtTriangle> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let v0 = Vec3::from_array(array::from_fn(|_| rng.gen_range(0. ..1.)));
            let e1 = Vec3::from_array(array::from_fn(|_| rng.gen_range(0. ..1.)));
            let e2 = Vec3::from_array(array::from_fn(|_| rng.gen_range(0. ..1.)));
            let v0 = v0 * 9. - vec3(5., 5., 0.);
            RtTriangle::from_positions(v0, v0 + e1, v0 + e2)
        })
        .collect()
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let triangles = random_soup(TRIANGLES, 42);
    let cache = std::env::temp_dir().join("trace-demo.bvh");

    let mut tracer = RayTracer::new();
    let start = Instant::now();
    let source = tracer.load_or_construct(&cache, triangles, SplitMethod::Sah)?;
    match source {
        HierarchySource::Loaded => println!("hierarchy loaded from {}", cache.display()),
        HierarchySource::Rebuilt => println!("hierarchy rebuilt and cached in {:.2?}", start.elapsed()),
    }

    // Orthographic ray grid shot down -z through the soup; the direction
    // length bounds the probe at 20 units.
    let start = Instant::now();
    let mut hits = 0usize;
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let orig = vec3(
                -6. + 12. * x as f32 / WIDTH as f32,
                -6. + 12. * y as f32 / HEIGHT as f32,
                10.,
            );
            if tracer.raycast(orig, vec3(0., 0., -20.)).is_some() {
                hits += 1;
            }
        }
    }
    let elapsed = start.elapsed();

    let rays = tracer.ray_count();
    println!(
        "{rays} rays, {hits} hits, {:.2?} total, {:.0} rays/s",
        elapsed,
        rays as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
