//! Bounding volume hierarchy over a triangle soup.
//!
//! The tree is stored as a flat pool of [`BvhNode`]s: the root sits at index
//! 0 and an interior node's two children always occupy the adjacent pair
//! starting at `left_first`. Leaves reference a contiguous slice of the
//! shared primitive permutation instead of owning geometry, so building only
//! ever reorders indices.

mod aabb;
mod builder;
mod store;

pub use aabb::Aabb;
pub use builder::SplitMethod;
pub use store::StoreError;

use glam::Vec3;

/// One 32-byte node of the flattened hierarchy.
///
/// `count > 0` marks a leaf spanning `indices[left_first..left_first + count]`;
/// for interior nodes `count` is 0 and `left_first` is the index of the left
/// child (the right child is `left_first + 1`).
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BvhNode {
    pub min: Vec3,
    pub left_first: u32,
    pub max: Vec3,
    pub count: u32,
}

impl BvhNode {
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::new(self.min, self.max)
    }
}

/// The hierarchy: a node pool plus the primitive index permutation all leaf
/// ranges point into. Populated by exactly one of [`Bvh::build`] or
/// [`Bvh::load`]. An empty scene yields an empty `Bvh` with no nodes.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    indices: Vec<u32>,
}

impl Bvh {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<&BvhNode> {
        self.nodes.first()
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    /// The permutation of primitive indices, spatially clustered by the build.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// The slice of the permutation a leaf spans.
    pub fn leaf_indices(&self, node: &BvhNode) -> &[u32] {
        &self.indices[node.left_first as usize..][..node.count as usize]
    }
}
