use std::fmt;
use std::hash::BuildHasher;

use ahash::RandomState;
use glam::Vec3;

use crate::triangle::RtTriangle;

// Fixed seeds keep the fingerprint deterministic across runs; two
// independently seeded states give the full 128 bits.
const SEEDS_LO: [u64; 4] = [0x243f_6a88, 0x85a3_08d3, 0x1319_8a2e, 0x0370_7344];
const SEEDS_HI: [u64; 4] = [0xa409_3822, 0x299f_31d0, 0x082e_fa98, 0xec4e_6c89];

/// 128-bit content fingerprint of a vertex position buffer, used to decide
/// whether a stored hierarchy still matches the current mesh. Deterministic
/// for identical buffers; not a cryptographic digest.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct GeometryDigest([u8; 16]);

impl GeometryDigest {
    /// Hashes the raw bytes of a contiguous position buffer.
    pub fn of_positions(positions: &[Vec3]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(positions);
        let lo = RandomState::with_seeds(SEEDS_LO[0], SEEDS_LO[1], SEEDS_LO[2], SEEDS_LO[3])
            .hash_one(bytes);
        let hi = RandomState::with_seeds(SEEDS_HI[0], SEEDS_HI[1], SEEDS_HI[2], SEEDS_HI[3])
            .hash_one(bytes);

        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&lo.to_le_bytes());
        out[8..].copy_from_slice(&hi.to_le_bytes());
        Self(out)
    }

    /// Fingerprint of a triangle set, laid out as its 3N vertex positions.
    pub fn of_triangles(triangles: &[RtTriangle]) -> Self {
        let positions: Vec<Vec3> = triangles.iter().flat_map(|t| t.positions()).collect();
        Self::of_positions(&positions)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for GeometryDigest {
    /// 32 lowercase hex digits, fit for use as a cache/file key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GeometryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeometryDigest({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::vec3;

    fn positions() -> Vec<Vec3> {
        (0..30)
            .map(|i| vec3(i as f32, (i * 7 % 5) as f32, -(i as f32) * 0.5))
            .collect()
    }

    #[test]
    fn identical_buffers_hash_identically() {
        let a = GeometryDigest::of_positions(&positions());
        let b = GeometryDigest::of_positions(&positions());
        assert_eq!(a, b);
    }

    #[test]
    fn single_coordinate_change_alters_digest() {
        let base = positions();
        let reference = GeometryDigest::of_positions(&base);
        for i in 0..base.len() {
            let mut tweaked = base.clone();
            tweaked[i].y += 1e-3;
            assert_ne!(reference, GeometryDigest::of_positions(&tweaked));
        }
    }

    #[test]
    fn hex_rendering_is_fixed_width_lowercase() {
        let hex = GeometryDigest::of_positions(&positions()).to_string();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn digest_round_trips_through_bytes() {
        let digest = GeometryDigest::of_positions(&positions());
        assert_eq!(digest, GeometryDigest::from_bytes(digest.to_bytes()));
    }
}
