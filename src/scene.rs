//! Scene-delegate contract consumed by the sync engine.
//!
//! The delegate hands out read-only snapshots of authored scene data: mesh
//! topology, point positions, arbitrary primvars, transforms, and material
//! bindings. Every snapshot carries a version stamp that is bumped on actual
//! value change; the sync engine compares stamps to absorb redundant dirty
//! notifications without touching the GPU.

use crate::sync::dirty::DirtyBits;
use glam::Mat4;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Stable identity of a renderable entity (a scene-graph path).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EntityId(String);

impl EntityId {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared immutable value snapshot with a generation stamp.
///
/// The stamp contract: two snapshots of the same attribute with equal
/// versions hold equal values. The payload is never mutated in place; a
/// change produces a fresh `Versioned` with a higher stamp.
pub struct Versioned<T> {
    pub version: u64,
    pub value: Arc<T>,
}

impl<T> Versioned<T> {
    pub fn new(version: u64, value: T) -> Self {
        Self {
            version,
            value: Arc::new(value),
        }
    }

    pub fn from_shared(version: u64, value: Arc<T>) -> Self {
        Self { version, value }
    }
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

/// How a primvar maps onto mesh elements.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interpolation {
    Constant,
    Uniform,
    Vertex,
    FaceVarying,
}

/// Polygonal mesh topology: per-face vertex counts plus the flattened
/// face-vertex index list, exactly as authored.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct MeshTopology {
    pub face_vertex_counts: Vec<u32>,
    pub face_vertex_indices: Vec<u32>,
}

impl MeshTopology {
    pub fn new(face_vertex_counts: Vec<u32>, face_vertex_indices: Vec<u32>) -> Self {
        Self {
            face_vertex_counts,
            face_vertex_indices,
        }
    }

    pub fn face_count(&self) -> usize {
        self.face_vertex_counts.len()
    }

    pub fn index_count(&self) -> usize {
        self.face_vertex_indices.len()
    }

    pub fn max_index(&self) -> Option<u32> {
        self.face_vertex_indices.iter().copied().max()
    }
}

/// Typed primvar payload.
#[derive(Clone, PartialEq, Debug)]
pub enum PrimvarData {
    Float(Vec<f32>),
    Vec2(Vec<[f32; 2]>),
    Vec3(Vec<[f32; 3]>),
}

impl PrimvarData {
    pub fn len(&self) -> usize {
        match self {
            PrimvarData::Float(v) => v.len(),
            PrimvarData::Vec2(v) => v.len(),
            PrimvarData::Vec3(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_vec2s(&self) -> Option<&[[f32; 2]]> {
        match self {
            PrimvarData::Vec2(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vec3s(&self) -> Option<&[[f32; 3]]> {
        match self {
            PrimvarData::Vec3(v) => Some(v),
            _ => None,
        }
    }
}

/// A primvar snapshot: versioned payload plus interpolation mode.
#[derive(Clone)]
pub struct Primvar {
    pub data: Versioned<PrimvarData>,
    pub interpolation: Interpolation,
}

/// Well-known primvar names.
pub const PRIMVAR_NORMALS: &str = "normals";
pub const PRIMVAR_TEXCOORDS: &str = "st";

/// The retained-mode scene delegate the sync engine pulls from.
///
/// All results are read-only snapshots valid for the duration of one sync
/// call. The engine only queries ids it has been asked to sync; a delegate
/// may return empty defaults for unknown ids.
pub trait SceneDelegate {
    /// Attribute categories the delegate reports dirty for `id`. Reporting a
    /// category whose value did not actually change is permitted; the engine
    /// absorbs it via version comparison.
    fn dirty_bits(&self, id: &EntityId) -> DirtyBits;

    fn topology(&self, id: &EntityId) -> Versioned<MeshTopology>;

    fn points(&self, id: &EntityId) -> Versioned<Vec<[f32; 3]>>;

    fn primvar(&self, id: &EntityId, name: &str) -> Option<Primvar>;

    fn transform(&self, id: &EntityId) -> Mat4;

    fn material_binding(&self, id: &EntityId) -> Option<EntityId>;
}

// ---------- test delegate ----------

#[derive(Clone)]
struct TestMesh {
    topology: Versioned<MeshTopology>,
    points: Versioned<Vec<[f32; 3]>>,
    primvars: HashMap<String, Primvar>,
    transform: Mat4,
    material: Option<EntityId>,
    dirty: DirtyBits,
}

/// In-memory scene delegate for tests and examples.
///
/// Every mutation bumps a delegate-wide version counter and sets the matching
/// dirty flag, so redundant-notification behavior can be exercised with
/// `set_dirty` (flag without value change).
#[derive(Default)]
pub struct TestSceneDelegate {
    meshes: HashMap<EntityId, TestMesh>,
    next_version: u64,
}

impl TestSceneDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    pub fn add_mesh(&mut self, id: &EntityId, topology: MeshTopology, points: Vec<[f32; 3]>) {
        let topo_version = self.bump();
        let points_version = self.bump();
        self.meshes.insert(
            id.clone(),
            TestMesh {
                topology: Versioned::new(topo_version, topology),
                points: Versioned::new(points_version, points),
                primvars: HashMap::new(),
                transform: Mat4::IDENTITY,
                material: None,
                dirty: DirtyBits::ALL,
            },
        );
    }

    pub fn set_points(&mut self, id: &EntityId, points: Vec<[f32; 3]>) {
        let version = self.bump();
        let mesh = self.mesh_mut(id);
        mesh.points = Versioned::new(version, points);
        mesh.dirty.insert(DirtyBits::POINTS);
    }

    pub fn set_topology(&mut self, id: &EntityId, topology: MeshTopology) {
        let version = self.bump();
        let mesh = self.mesh_mut(id);
        mesh.topology = Versioned::new(version, topology);
        mesh.dirty.insert(DirtyBits::TOPOLOGY);
    }

    pub fn set_primvar(
        &mut self,
        id: &EntityId,
        name: &str,
        data: PrimvarData,
        interpolation: Interpolation,
        dirty: DirtyBits,
    ) {
        let version = self.bump();
        let mesh = self.mesh_mut(id);
        mesh.primvars.insert(
            name.to_string(),
            Primvar {
                data: Versioned::new(version, data),
                interpolation,
            },
        );
        mesh.dirty.insert(dirty);
    }

    pub fn set_transform(&mut self, id: &EntityId, transform: Mat4) {
        let mesh = self.mesh_mut(id);
        mesh.transform = transform;
        mesh.dirty.insert(DirtyBits::TRANSFORM);
    }

    pub fn set_material(&mut self, id: &EntityId, material: Option<EntityId>) {
        let mesh = self.mesh_mut(id);
        mesh.material = material;
        mesh.dirty.insert(DirtyBits::MATERIAL);
    }

    /// Flag categories dirty without changing any value: the redundant
    /// notification case the engine must absorb.
    pub fn set_dirty(&mut self, id: &EntityId, bits: DirtyBits) {
        self.mesh_mut(id).dirty.insert(bits);
    }

    pub fn clear_dirty(&mut self, id: &EntityId) {
        self.mesh_mut(id).dirty = DirtyBits::empty();
    }

    fn mesh_mut(&mut self, id: &EntityId) -> &mut TestMesh {
        self.meshes
            .get_mut(id)
            .unwrap_or_else(|| panic!("unknown test mesh {}", id))
    }
}

impl SceneDelegate for TestSceneDelegate {
    fn dirty_bits(&self, id: &EntityId) -> DirtyBits {
        self.meshes.get(id).map(|m| m.dirty).unwrap_or_default()
    }

    fn topology(&self, id: &EntityId) -> Versioned<MeshTopology> {
        self.meshes
            .get(id)
            .map(|m| m.topology.clone())
            .unwrap_or_else(|| Versioned::new(0, MeshTopology::default()))
    }

    fn points(&self, id: &EntityId) -> Versioned<Vec<[f32; 3]>> {
        self.meshes
            .get(id)
            .map(|m| m.points.clone())
            .unwrap_or_else(|| Versioned::new(0, Vec::new()))
    }

    fn primvar(&self, id: &EntityId, name: &str) -> Option<Primvar> {
        self.meshes.get(id).and_then(|m| m.primvars.get(name).cloned())
    }

    fn transform(&self, id: &EntityId) -> Mat4 {
        self.meshes
            .get(id)
            .map(|m| m.transform)
            .unwrap_or(Mat4::IDENTITY)
    }

    fn material_binding(&self, id: &EntityId) -> Option<EntityId> {
        self.meshes.get(id).and_then(|m| m.material.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_topology() -> MeshTopology {
        MeshTopology::new(vec![4], vec![0, 1, 2, 3])
    }

    #[test]
    fn versions_increase_per_mutation() {
        let id = EntityId::new("/scene/quad");
        let mut delegate = TestSceneDelegate::new();
        delegate.add_mesh(&id, quad_topology(), vec![[0.0; 3]; 4]);

        let v0 = delegate.points(&id).version;
        delegate.set_points(&id, vec![[1.0; 3]; 4]);
        let v1 = delegate.points(&id).version;
        assert!(v1 > v0);
    }

    #[test]
    fn redundant_dirty_keeps_version() {
        let id = EntityId::new("/scene/quad");
        let mut delegate = TestSceneDelegate::new();
        delegate.add_mesh(&id, quad_topology(), vec![[0.0; 3]; 4]);
        delegate.clear_dirty(&id);

        let before = delegate.points(&id).version;
        delegate.set_dirty(&id, DirtyBits::POINTS);
        assert_eq!(delegate.points(&id).version, before);
        assert!(delegate.dirty_bits(&id).contains(DirtyBits::POINTS));
    }

    #[test]
    fn topology_accessors() {
        let topo = MeshTopology::new(vec![4, 3], vec![0, 1, 2, 3, 0, 2, 4]);
        assert_eq!(topo.face_count(), 2);
        assert_eq!(topo.index_count(), 7);
        assert_eq!(topo.max_index(), Some(4));
    }
}
