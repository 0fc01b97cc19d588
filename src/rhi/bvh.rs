//! CPU-built bounding volume hierarchy backing the wgpu adapter's
//! acceleration structures.
//!
//! Median-split build over triangle centroids; children are appended after
//! their parent, so a reverse iteration visits children before parents and
//! refit can run bottom-up in place without touching the tree shape.

use bytemuck::{Pod, Zeroable};

const LEAF_SIZE: usize = 4;

/// Axis-aligned bounding box.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: [f32::INFINITY; 3],
            max: [f32::NEG_INFINITY; 3],
        }
    }

    pub fn expand_point(&mut self, point: [f32; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
    }

    pub fn expand_aabb(&mut self, other: &Aabb) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
    }

    pub fn extent(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        (0..3).all(|axis| self.min[axis] <= other.min[axis] && self.max[axis] >= other.max[axis])
    }

    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.min[axis] <= self.max[axis])
    }
}

/// GPU node layout (matches the traversal shader's struct).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BvhNode {
    pub min: [f32; 3],
    /// Internal: left child index.
    pub left: u32,
    pub max: [f32; 3],
    /// Internal: right child index.
    pub right: u32,
    /// Leaf: first entry in the triangle order array.
    pub first: u32,
    /// Leaf when non-zero: number of triangles.
    pub count: u32,
    pub _pad: [u32; 2],
}

impl BvhNode {
    fn aabb(&self) -> Aabb {
        Aabb {
            min: self.min,
            max: self.max,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Built hierarchy plus the leaf-order triangle permutation.
pub struct CpuBvh {
    pub nodes: Vec<BvhNode>,
    pub tri_order: Vec<u32>,
    pub world_aabb: Aabb,
}

impl CpuBvh {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn triangle_aabb(positions: &[[f32; 3]], triangle: [u32; 3]) -> Aabb {
    let mut aabb = Aabb::empty();
    for &index in &triangle {
        aabb.expand_point(positions[index as usize]);
    }
    aabb
}

fn triangle_centroid(positions: &[[f32; 3]], triangle: [u32; 3]) -> [f32; 3] {
    let a = positions[triangle[0] as usize];
    let b = positions[triangle[1] as usize];
    let c = positions[triangle[2] as usize];
    [
        (a[0] + b[0] + c[0]) / 3.0,
        (a[1] + b[1] + c[1]) / 3.0,
        (a[2] + b[2] + c[2]) / 3.0,
    ]
}

/// Build a hierarchy over the given triangles.
pub fn build_bvh(positions: &[[f32; 3]], triangles: &[[u32; 3]]) -> CpuBvh {
    let mut tri_order: Vec<u32> = (0..triangles.len() as u32).collect();
    let mut nodes = Vec::new();

    if triangles.is_empty() {
        nodes.push(BvhNode {
            min: [0.0; 3],
            left: 0,
            max: [0.0; 3],
            right: 0,
            first: 0,
            count: 0,
            _pad: [0; 2],
        });
        return CpuBvh {
            nodes,
            tri_order,
            world_aabb: Aabb::empty(),
        };
    }

    let centroids: Vec<[f32; 3]> = triangles
        .iter()
        .map(|&t| triangle_centroid(positions, t))
        .collect();

    build_range(
        &mut nodes,
        &mut tri_order,
        0,
        triangles.len(),
        positions,
        triangles,
        &centroids,
    );

    let world_aabb = nodes[0].aabb();
    CpuBvh {
        nodes,
        tri_order,
        world_aabb,
    }
}

fn build_range(
    nodes: &mut Vec<BvhNode>,
    tri_order: &mut [u32],
    start: usize,
    end: usize,
    positions: &[[f32; 3]],
    triangles: &[[u32; 3]],
    centroids: &[[f32; 3]],
) -> u32 {
    let node_index = nodes.len() as u32;
    nodes.push(BvhNode::zeroed());

    let mut aabb = Aabb::empty();
    let mut centroid_bounds = Aabb::empty();
    for &tri in &tri_order[start..end] {
        aabb.expand_aabb(&triangle_aabb(positions, triangles[tri as usize]));
        centroid_bounds.expand_point(centroids[tri as usize]);
    }

    let count = end - start;
    let extent = centroid_bounds.extent();
    let axis = if extent[0] >= extent[1] && extent[0] >= extent[2] {
        0
    } else if extent[1] >= extent[2] {
        1
    } else {
        2
    };

    // Degenerate centroid spread cannot be split meaningfully.
    if count <= LEAF_SIZE || extent[axis] <= 0.0 {
        nodes[node_index as usize] = BvhNode {
            min: aabb.min,
            left: 0,
            max: aabb.max,
            right: 0,
            first: start as u32,
            count: count as u32,
            _pad: [0; 2],
        };
        return node_index;
    }

    tri_order[start..end].sort_unstable_by(|&a, &b| {
        centroids[a as usize][axis]
            .partial_cmp(&centroids[b as usize][axis])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mid = start + count / 2;

    let left = build_range(nodes, tri_order, start, mid, positions, triangles, centroids);
    let right = build_range(nodes, tri_order, mid, end, positions, triangles, centroids);

    nodes[node_index as usize] = BvhNode {
        min: aabb.min,
        left,
        max: aabb.max,
        right,
        first: 0,
        count: 0,
        _pad: [0; 2],
    };
    node_index
}

/// Update node bounds in place for moved vertex positions. The tree shape,
/// node count, and triangle permutation are untouched; nothing allocates.
pub fn refit_bvh(bvh: &mut CpuBvh, positions: &[[f32; 3]], triangles: &[[u32; 3]]) {
    for index in (0..bvh.nodes.len()).rev() {
        let node = bvh.nodes[index];
        let mut aabb = Aabb::empty();
        if node.is_leaf() {
            for &tri in &bvh.tri_order[node.first as usize..(node.first + node.count) as usize] {
                aabb.expand_aabb(&triangle_aabb(positions, triangles[tri as usize]));
            }
        } else if !triangles.is_empty() {
            aabb.expand_aabb(&bvh.nodes[node.left as usize].aabb());
            aabb.expand_aabb(&bvh.nodes[node.right as usize].aabb());
        } else {
            continue;
        }
        bvh.nodes[index].min = aabb.min;
        bvh.nodes[index].max = aabb.max;
    }
    bvh.world_aabb = bvh.nodes[0].aabb();
}
