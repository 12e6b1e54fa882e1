use std::io::{self, Read, Write};

use crate::{Bvh, BvhNode};

const MAGIC: [u8; 4] = *b"BVH1";

/// Failures while persisting or restoring a hierarchy. A load that returns an
/// error installs nothing: there is no partially usable tree.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read or write hierarchy stream")]
    Io(#[from] io::Error),
    #[error("stream is not a serialized hierarchy (bad magic)")]
    BadMagic,
    #[error("malformed hierarchy stream: {0}")]
    Malformed(&'static str),
}

fn read_u32(r: &mut impl Read) -> Result<u32, StoreError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

const READ_CHUNK: usize = 1 << 16;

/// Reads `count` Pod records in bounded chunks. `count` comes from an
/// untrusted header, so the buffer grows only as payload bytes actually
/// arrive; a lying count fails with an I/O error at the first missing chunk
/// instead of attempting one huge up-front allocation.
fn read_pod_records<T: bytemuck::Pod, R: Read>(
    r: &mut R,
    count: usize,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    let mut chunk = vec![T::zeroed(); READ_CHUNK.min(count)];
    let mut remaining = count;
    while remaining > 0 {
        let take = remaining.min(READ_CHUNK);
        r.read_exact(bytemuck::cast_slice_mut(&mut chunk[..take]))?;
        out.extend_from_slice(&chunk[..take]);
        remaining -= take;
    }
    Ok(out)
}

impl Bvh {
    /// Writes the hierarchy plus the caller's 16-byte geometry digest.
    ///
    /// Layout: magic, digest, index count (LE u32), raw index words, node
    /// count (LE u32), raw 32-byte node records. Node and index records are
    /// in-memory byte images; the format round-trips bit-exactly on one
    /// machine but is not a cross-machine interchange format.
    pub fn save<W: Write>(&self, w: &mut W, digest: [u8; 16]) -> Result<(), StoreError> {
        w.write_all(&MAGIC)?;
        w.write_all(&digest)?;
        w.write_all(&(self.indices.len() as u32).to_le_bytes())?;
        w.write_all(bytemuck::cast_slice(&self.indices))?;
        w.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        w.write_all(bytemuck::cast_slice(&self.nodes))?;
        log::debug!(
            "saved hierarchy: {} nodes, {} indices",
            self.nodes.len(),
            self.indices.len()
        );
        Ok(())
    }

    /// Reads a hierarchy saved by [`Bvh::save`] and the digest embedded with
    /// it. The node topology is validated before anything is returned.
    pub fn load<R: Read>(r: &mut R) -> Result<(Bvh, [u8; 16]), StoreError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let mut digest = [0u8; 16];
        r.read_exact(&mut digest)?;

        let index_count = read_u32(r)? as usize;
        let indices: Vec<u32> = read_pod_records(r, index_count)?;

        let node_count = read_u32(r)? as usize;
        let nodes: Vec<BvhNode> = read_pod_records(r, node_count)?;

        let bvh = Bvh { nodes, indices };
        bvh.validate()?;
        log::debug!(
            "loaded hierarchy: {} nodes, {} indices",
            bvh.nodes.len(),
            bvh.indices.len()
        );
        Ok((bvh, digest))
    }

    /// Structural integrity check for untrusted streams: the index array must
    /// be a permutation, every node must be reachable from the root exactly
    /// once, child links and leaf ranges must be in bounds, and the leaves
    /// must account for every primitive.
    fn validate(&self) -> Result<(), StoreError> {
        if self.nodes.is_empty() {
            return if self.indices.is_empty() {
                Ok(())
            } else {
                Err(StoreError::Malformed("primitives present without a root"))
            };
        }
        if self.indices.is_empty() {
            return Err(StoreError::Malformed("root present without primitives"));
        }

        let mut seen = vec![false; self.indices.len()];
        for &i in &self.indices {
            match seen.get_mut(i as usize) {
                Some(flag @ false) => *flag = true,
                _ => return Err(StoreError::Malformed("index array is not a permutation")),
            }
        }

        // Flags, not counters: a shared subtree plus compensating unreachable
        // leaves could balance the totals while leaving part of the
        // permutation untested by traversal.
        let mut node_seen = vec![false; self.nodes.len()];
        let mut covered = vec![false; self.indices.len()];
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let node = self
                .nodes
                .get(idx)
                .ok_or(StoreError::Malformed("child link out of bounds"))?;
            if node_seen[idx] {
                return Err(StoreError::Malformed("node is reachable more than once"));
            }
            node_seen[idx] = true;
            if node.is_leaf() {
                let start = node.left_first as usize;
                let end = start + node.count as usize;
                if end > self.indices.len() {
                    return Err(StoreError::Malformed("leaf range out of bounds"));
                }
                for flag in &mut covered[start..end] {
                    if *flag {
                        return Err(StoreError::Malformed("leaf ranges overlap"));
                    }
                    *flag = true;
                }
            } else {
                let left = node.left_first as usize;
                stack.push(left);
                stack.push(left + 1);
            }
        }
        if node_seen.iter().any(|&seen| !seen) {
            return Err(StoreError::Malformed("unreachable nodes in stream"));
        }
        if covered.iter().any(|&hit| !hit) {
            return Err(StoreError::Malformed(
                "leaf ranges do not cover the primitive set",
            ));
        }
        Ok(())
    }
}
