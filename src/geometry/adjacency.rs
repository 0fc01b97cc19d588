//! Vertex-to-face adjacency in CSR layout.
//!
//! Built once per topology change and reused by normal computation. Face
//! lists per vertex are stored in ascending face order; that fixed order is
//! what makes downstream accumulation reproducible.

use crate::scene::MeshTopology;

/// Compressed mapping from vertex index to the faces that reference it.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VertexAdjacency {
    offsets: Vec<u32>,
    faces: Vec<u32>,
}

impl VertexAdjacency {
    /// Two-pass CSR construction over the authored faces.
    pub fn build(topology: &MeshTopology, point_count: usize) -> Self {
        let mut counts = vec![0u32; point_count];
        let mut offset = 0usize;
        for &face_size in &topology.face_vertex_counts {
            let face_size = face_size as usize;
            for &vertex in &topology.face_vertex_indices[offset..offset + face_size] {
                if (vertex as usize) < point_count {
                    counts[vertex as usize] += 1;
                }
            }
            offset += face_size;
        }

        let mut offsets = Vec::with_capacity(point_count + 1);
        let mut running = 0u32;
        offsets.push(0);
        for &count in &counts {
            running += count;
            offsets.push(running);
        }

        let mut cursor: Vec<u32> = offsets[..point_count].to_vec();
        let mut faces = vec![0u32; running as usize];
        let mut offset = 0usize;
        for (face, &face_size) in topology.face_vertex_counts.iter().enumerate() {
            let face_size = face_size as usize;
            for &vertex in &topology.face_vertex_indices[offset..offset + face_size] {
                let vertex = vertex as usize;
                if vertex < point_count {
                    faces[cursor[vertex] as usize] = face as u32;
                    cursor[vertex] += 1;
                }
            }
            offset += face_size;
        }

        Self { offsets, faces }
    }

    pub fn vertex_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Faces referencing `vertex`, in ascending face order. A vertex used
    /// more than once by the same face lists that face once per use.
    pub fn faces_of(&self, vertex: usize) -> &[u32] {
        if vertex + 1 >= self.offsets.len() {
            return &[];
        }
        let start = self.offsets[vertex] as usize;
        let end = self.offsets[vertex + 1] as usize;
        &self.faces[start..end]
    }
}
