// src/geometry/mod.rs
// CPU mesh processing for the sync engine: triangulation, vertex adjacency,
// and smooth normal computation. All functions here are pure and deterministic.

pub mod adjacency;
pub mod normals;
pub mod triangulate;

pub use adjacency::VertexAdjacency;
pub use normals::compute_smooth_normals;
pub use triangulate::{face_varying_corners, triangulate_fan, Triangulation};

use crate::error::{RenderError, RenderResult};
use crate::scene::MeshTopology;

/// Validate authored topology against the current point count.
///
/// Out-of-range indices are fatal; degenerate faces (fewer than three
/// vertices) are only logged, matching how the renderer tolerates sloppy
/// authoring without dropping the whole prim.
pub fn validate_topology(topology: &MeshTopology, point_count: usize) -> RenderResult<()> {
    let mut offset = 0usize;
    for (face, &count) in topology.face_vertex_counts.iter().enumerate() {
        let count = count as usize;
        if offset + count > topology.face_vertex_indices.len() {
            return Err(RenderError::device(format!(
                "face {} runs past the face-vertex index list ({} + {} > {})",
                face,
                offset,
                count,
                topology.face_vertex_indices.len()
            )));
        }
        offset += count;
    }

    if offset != topology.face_vertex_indices.len() {
        return Err(RenderError::device(format!(
            "face-vertex counts cover {} indices but {} were authored",
            offset,
            topology.face_vertex_indices.len()
        )));
    }

    if let Some(max) = topology.max_index() {
        if max as usize >= point_count {
            return Err(RenderError::device(format!(
                "topology references vertex {} but only {} points are authored",
                max, point_count
            )));
        }
    }

    let degenerate = topology
        .face_vertex_counts
        .iter()
        .filter(|&&c| c < 3)
        .count();
    if degenerate > 0 {
        log::warn!("topology contains {} degenerate faces", degenerate);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_accepts_quad() {
        let topo = MeshTopology::new(vec![4], vec![0, 1, 2, 3]);
        assert!(validate_topology(&topo, 4).is_ok());
    }

    #[test]
    fn validation_rejects_out_of_range_index() {
        let topo = MeshTopology::new(vec![3], vec![0, 1, 5]);
        assert!(validate_topology(&topo, 4).is_err());
    }

    #[test]
    fn validation_rejects_short_index_list() {
        let topo = MeshTopology::new(vec![4], vec![0, 1, 2]);
        assert!(validate_topology(&topo, 4).is_err());
    }

    #[test]
    fn validation_rejects_trailing_indices() {
        let topo = MeshTopology::new(vec![3], vec![0, 1, 2, 3]);
        assert!(validate_topology(&topo, 4).is_err());
    }
}
