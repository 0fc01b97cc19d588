//! Smooth normal computation for meshes without authored normals.
//!
//! Per-face normals are taken with Newell's method, whose magnitude is
//! proportional to face area, so summing the raw face normals at each vertex
//! gives the area-weighted accumulation directly. Accumulation follows the
//! adjacency's fixed face order; given identical (points, topology) input the
//! result is bit-identical across calls.

use super::adjacency::VertexAdjacency;
use crate::scene::MeshTopology;
use glam::Vec3;

/// Unnormalized face normals in authored face order.
pub fn face_normals(points: &[[f32; 3]], topology: &MeshTopology) -> Vec<Vec3> {
    let mut normals = Vec::with_capacity(topology.face_count());
    let mut offset = 0usize;

    for &count in &topology.face_vertex_counts {
        let count = count as usize;
        let mut normal = Vec3::ZERO;
        if count >= 3 {
            // Newell's method over the polygon loop.
            for corner in 0..count {
                let a = vertex(points, topology, offset + corner);
                let b = vertex(points, topology, offset + (corner + 1) % count);
                normal.x += (a.y - b.y) * (a.z + b.z);
                normal.y += (a.z - b.z) * (a.x + b.x);
                normal.z += (a.x - b.x) * (a.y + b.y);
            }
        }
        normals.push(normal);
        offset += count;
    }

    normals
}

/// Area-weighted vertex normals. Pure function of (points, topology); the
/// adjacency must have been built from the same topology.
pub fn compute_smooth_normals(
    points: &[[f32; 3]],
    topology: &MeshTopology,
    adjacency: &VertexAdjacency,
) -> Vec<[f32; 3]> {
    let per_face = face_normals(points, topology);
    let mut out = Vec::with_capacity(points.len());

    for vertex in 0..points.len() {
        let mut sum = Vec3::ZERO;
        for &face in adjacency.faces_of(vertex) {
            sum += per_face[face as usize];
        }
        out.push(sum.normalize_or_zero().to_array());
    }

    out
}

fn vertex(points: &[[f32; 3]], topology: &MeshTopology, slot: usize) -> Vec3 {
    let index = topology.face_vertex_indices[slot] as usize;
    Vec3::from_array(points[index])
}
