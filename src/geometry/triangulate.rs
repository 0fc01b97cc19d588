//! Polygon-to-triangle conversion.
//!
//! Faces are fanned around their first vertex, preserving the authored
//! winding. Each output triangle records the face it came from so
//! face-varying primvars and picking can map back through the triangulation.

use crate::scene::MeshTopology;

/// Triangulated index buffer plus the per-triangle primitive-parameter map.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Triangulation {
    /// Triangle vertex indices, consistent winding with the source faces.
    pub indices: Vec<[u32; 3]>,
    /// For each triangle, the index of the face it was fanned from.
    pub primitive_params: Vec<u32>,
}

impl Triangulation {
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Source face for a triangle, used by face-varying lookup and picking.
    pub fn source_face(&self, triangle: usize) -> Option<u32> {
        self.primitive_params.get(triangle).copied()
    }
}

/// Fan-triangulate authored polygons. Faces with fewer than three vertices
/// produce no triangles.
pub fn triangulate_fan(topology: &MeshTopology) -> Triangulation {
    let mut out = Triangulation::default();
    let mut offset = 0usize;

    for (face, &count) in topology.face_vertex_counts.iter().enumerate() {
        let count = count as usize;
        if count >= 3 {
            let anchor = topology.face_vertex_indices[offset];
            for corner in 1..count - 1 {
                out.indices.push([
                    anchor,
                    topology.face_vertex_indices[offset + corner],
                    topology.face_vertex_indices[offset + corner + 1],
                ]);
                out.primitive_params.push(face as u32);
            }
        }
        offset += count;
    }

    out
}

/// For each output triangle corner, the face-varying source index it reads
/// from. Fan order matches `triangulate_fan`, so a face-varying primvar of
/// length `index_count()` can be flattened into a per-corner buffer with one
/// gather.
pub fn face_varying_corners(topology: &MeshTopology) -> Vec<u32> {
    let mut corners = Vec::new();
    let mut offset = 0u32;

    for &count in &topology.face_vertex_counts {
        if count >= 3 {
            for corner in 1..count - 1 {
                corners.push(offset);
                corners.push(offset + corner);
                corners.push(offset + corner + 1);
            }
        }
        offset += count;
    }

    corners
}
