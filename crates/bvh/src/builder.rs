use std::time::Instant;

use glam::Vec3;

use crate::{Aabb, Bvh, BvhNode};

/// Split-selection policy for hierarchy construction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SplitMethod {
    /// Binned surface-area-heuristic splits.
    #[default]
    Sah,
    /// No acceleration: one leaf spanning every primitive.
    SingleLeaf,
}

const BINS: u32 = 8;
const LEAF_SIZE: u32 = 3;
const COST_TRAVERSAL: f32 = 2.0;
const COST_INTERSECTION: f32 = 0.6;

impl Bvh {
    /// Builds a hierarchy over primitives described by their bounding boxes
    /// and split keys (centroids). Zero primitives produce an empty `Bvh`
    /// whose traversal reports no hit.
    ///
    /// # Panics
    /// Panics if `boxes` and `centroids` differ in length.
    pub fn build(boxes: &[Aabb], centroids: &[Vec3], method: SplitMethod) -> Bvh {
        assert_eq!(boxes.len(), centroids.len());
        if boxes.is_empty() {
            return Bvh::default();
        }

        let start = Instant::now();
        let count = boxes.len() as u32;
        let indices: Vec<u32> = (0..count).collect();

        let bvh = match method {
            SplitMethod::SingleLeaf => {
                let bounds = boxes.iter().copied().fold(Aabb::EMPTY, Aabb::union);
                Bvh {
                    nodes: vec![BvhNode {
                        min: bounds.min,
                        left_first: 0,
                        max: bounds.max,
                        count,
                    }],
                    indices,
                }
            }
            SplitMethod::Sah => {
                let mut builder = Builder {
                    boxes,
                    centroids,
                    indices,
                    nodes: vec![BvhNode::default(); 2 * boxes.len()],
                };
                let bounds = builder.prim_bounds(0, count);
                builder.nodes[0] = BvhNode {
                    min: bounds.min,
                    left_first: 0,
                    max: bounds.max,
                    count,
                };
                let mut pool = 1;
                builder.subdivide(0, 0, &mut pool);
                builder.nodes.truncate(pool as usize);
                Bvh {
                    nodes: builder.nodes,
                    indices: builder.indices,
                }
            }
        };

        log::debug!(
            "built {} nodes over {count} primitives in {:.2?}",
            bvh.nodes.len(),
            start.elapsed()
        );
        bvh
    }
}

struct Builder<'a> {
    boxes: &'a [Aabb],
    centroids: &'a [Vec3],
    indices: Vec<u32>,
    nodes: Vec<BvhNode>,
}

impl Builder<'_> {
    /// Recursively splits `nodes[node_idx]`, which spans
    /// `indices[start..start + count]`. `pool` is the next free node slot;
    /// children are always allocated as an adjacent pair.
    fn subdivide(&mut self, node_idx: usize, start: u32, pool: &mut u32) {
        let count = self.nodes[node_idx].count;
        if count <= LEAF_SIZE {
            self.nodes[node_idx].left_first = start;
            return;
        }

        let parent = self.nodes[node_idx].aabb();
        let Some(pivot) = self.choose_split(start, count, &parent) else {
            // No candidate beats the leaf cost.
            self.nodes[node_idx].left_first = start;
            return;
        };

        let left = *pool;
        *pool += 2;
        self.nodes[node_idx].left_first = left;
        self.nodes[node_idx].count = 0;

        let left_count = pivot - start;
        let bounds = self.prim_bounds(start, left_count);
        self.nodes[left as usize] = BvhNode {
            min: bounds.min,
            left_first: 0,
            max: bounds.max,
            count: left_count,
        };

        let right_count = count - left_count;
        let bounds = self.prim_bounds(pivot, right_count);
        self.nodes[left as usize + 1] = BvhNode {
            min: bounds.min,
            left_first: 0,
            max: bounds.max,
            count: right_count,
        };

        self.subdivide(left as usize, start, pool);
        self.subdivide(left as usize + 1, pivot, pool);
    }

    /// Evaluates binned SAH candidates over all three axes and partitions the
    /// index range by the winning plane. Returns `None` when keeping the range
    /// as one leaf is at least as cheap as every candidate; ties between
    /// candidates go to the first one in axis-major enumeration order.
    fn choose_split(&mut self, start: u32, count: u32, parent: &Aabb) -> Option<u32> {
        let parent_area = parent.area();
        if !(parent_area > 0.) || !parent_area.is_finite() {
            // Degenerate bounds (e.g. all primitives coincident): the cost
            // model divides by zero, so fall back to a median split.
            return Some(start + count / 2);
        }

        let centroid_bounds = self.split_key_bounds(start, count);
        let mut best_cost = count as f32 * COST_INTERSECTION;
        let mut best_plane = None;
        for axis in 0..3 {
            for bin in 1..BINS {
                let pos = centroid_bounds
                    .min
                    .lerp(centroid_bounds.max, bin as f32 / BINS as f32)[axis];
                let pivot = self.partition(axis, pos, start, count);

                let left_count = pivot - start;
                let right_count = count - left_count;
                if left_count == 0 || right_count == 0 {
                    continue;
                }

                let left_area = self.prim_bounds(start, left_count).area();
                let right_area = self.prim_bounds(pivot, right_count).area();
                let cost = COST_TRAVERSAL
                    + (left_area * left_count as f32 + right_area * right_count as f32)
                        / parent_area
                        * COST_INTERSECTION;
                if cost < best_cost {
                    best_cost = cost;
                    best_plane = Some((axis, pos));
                }
            }
        }

        let (axis, pos) = best_plane?;
        Some(self.partition(axis, pos, start, count))
    }

    /// In-place partition of `indices[start..start + count]`: split keys below
    /// `pos` on `axis` end up left of the returned pivot.
    fn partition(&mut self, axis: usize, pos: f32, start: u32, count: u32) -> u32 {
        let mut end = (start + count - 1) as usize;
        let mut i = start as usize;
        while i < end {
            if self.centroids[self.indices[i] as usize][axis] < pos {
                i += 1;
            } else {
                self.indices.swap(i, end);
                end -= 1;
            }
        }
        if self.centroids[self.indices[i] as usize][axis] < pos {
            i += 1;
        }
        i as u32
    }

    fn prim_bounds(&self, start: u32, count: u32) -> Aabb {
        self.indices[start as usize..][..count as usize]
            .iter()
            .fold(Aabb::EMPTY, |acc, &i| acc.union(self.boxes[i as usize]))
    }

    fn split_key_bounds(&self, start: u32, count: u32) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        for &i in &self.indices[start as usize..][..count as usize] {
            bounds.grow(self.centroids[i as usize]);
        }
        bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::vec3;

    fn boxes_along_x(n: usize) -> (Vec<Aabb>, Vec<Vec3>) {
        let boxes: Vec<Aabb> = (0..n)
            .map(|i| {
                let lo = vec3(i as f32 * 2., 0., 0.);
                Aabb::new(lo, lo + Vec3::ONE)
            })
            .collect();
        let centroids = boxes.iter().map(Aabb::center).collect();
        (boxes, centroids)
    }

    /// Walks the tree verifying structural invariants and that the leaves
    /// cover every primitive exactly once.
    fn check_tree(bvh: &Bvh, prim_count: usize) {
        assert_eq!(bvh.indices().len(), prim_count);
        let mut sorted: Vec<u32> = bvh.indices().to_vec();
        sorted.sort_unstable();
        assert!(sorted.iter().enumerate().all(|(i, &v)| i as u32 == v));

        let mut covered = 0usize;
        let mut stack = vec![0u32];
        while let Some(idx) = stack.pop() {
            let node = &bvh.nodes()[idx as usize];
            if node.is_leaf() {
                covered += node.count as usize;
                assert!(node.left_first as usize + node.count as usize <= prim_count);
            } else {
                stack.push(node.left_first);
                stack.push(node.left_first + 1);
            }
        }
        assert_eq!(covered, prim_count);
    }

    #[test]
    fn empty_input_builds_empty_hierarchy() {
        let bvh = Bvh::build(&[], &[], SplitMethod::Sah);
        assert!(bvh.is_empty());
        assert!(bvh.root().is_none());
    }

    #[test]
    fn single_primitive_is_one_leaf() {
        let (boxes, centroids) = boxes_along_x(1);
        let bvh = Bvh::build(&boxes, &centroids, SplitMethod::Sah);
        assert_eq!(bvh.nodes().len(), 1);
        assert!(bvh.root().unwrap().is_leaf());
        check_tree(&bvh, 1);
    }

    #[test]
    fn sah_splits_spread_out_boxes() {
        let (boxes, centroids) = boxes_along_x(64);
        let bvh = Bvh::build(&boxes, &centroids, SplitMethod::Sah);
        assert!(!bvh.root().unwrap().is_leaf());
        check_tree(&bvh, 64);

        // Root bounds must enclose everything.
        let root = bvh.root().unwrap().aabb();
        assert_eq!(root.min, Vec3::ZERO);
        assert_eq!(root.max, vec3(127., 1., 1.));
    }

    #[test]
    fn coincident_primitives_fall_back_to_median_split() {
        let boxes = vec![Aabb::new(Vec3::ZERO, Vec3::ZERO); 32];
        let centroids = vec![Vec3::ZERO; 32];
        let bvh = Bvh::build(&boxes, &centroids, SplitMethod::Sah);
        check_tree(&bvh, 32);
        for node in bvh.nodes() {
            if node.is_leaf() {
                assert!(node.count <= LEAF_SIZE);
            }
        }
    }

    #[test]
    fn single_leaf_method_builds_one_node() {
        let (boxes, centroids) = boxes_along_x(100);
        let bvh = Bvh::build(&boxes, &centroids, SplitMethod::SingleLeaf);
        assert_eq!(bvh.nodes().len(), 1);
        let root = bvh.root().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.count, 100);
        check_tree(&bvh, 100);
    }

    #[test]
    fn partition_groups_split_keys() {
        let (boxes, centroids) = boxes_along_x(10);
        let bvh = Bvh::build(&boxes, &centroids, SplitMethod::Sah);
        // Every leaf's primitives must be contiguous along x given this input.
        let mut stack = vec![0u32];
        while let Some(idx) = stack.pop() {
            let node = &bvh.nodes()[idx as usize];
            if node.is_leaf() {
                let mut xs: Vec<u32> = bvh.leaf_indices(node).to_vec();
                xs.sort_unstable();
                let first = xs[0];
                assert!(xs.iter().enumerate().all(|(i, &v)| v == first + i as u32));
            } else {
                stack.push(node.left_first);
                stack.push(node.left_first + 1);
            }
        }
    }
}
