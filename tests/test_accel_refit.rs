// tests/test_accel_refit.rs
// Rebuild-vs-refit policy through the engine, and once-per-frame batching of
// top-level structure updates.

use anyhow::Result;
use glam::{Mat4, Vec3};
use trace3d::rhi::MockBackend;
use trace3d::scene::{EntityId, MeshTopology, TestSceneDelegate};
use trace3d::sync::RenderSync;

fn add_quad(delegate: &mut TestSceneDelegate, id: &EntityId) {
    delegate.add_mesh(
        id,
        MeshTopology::new(vec![3, 3], vec![0, 1, 2, 0, 2, 3]),
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
        ],
    );
}

#[test]
fn refit_keeps_the_blas_handle() -> Result<()> {
    let id = EntityId::new("/scene/quad");
    let mut delegate = TestSceneDelegate::new();
    add_quad(&mut delegate, &id);
    let mut engine = RenderSync::new(MockBackend::new())?;

    engine.begin_frame();
    engine.sync_entity(&delegate, &id)?;
    engine.end_frame()?;
    let built = engine.accel().blas(&id).expect("BLAS after first sync");

    delegate.clear_dirty(&id);
    delegate.set_points(
        &id,
        vec![
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ],
    );
    engine.begin_frame();
    engine.sync_entity(&delegate, &id)?;
    engine.end_frame()?;

    assert_eq!(engine.accel().blas(&id), Some(built));
    assert_eq!(engine.accel().refit_count(), 1);
    assert_eq!(engine.accel().rebuild_count(), 1);
    Ok(())
}

#[test]
fn rebuild_replaces_the_blas_handle() -> Result<()> {
    let id = EntityId::new("/scene/quad");
    let mut delegate = TestSceneDelegate::new();
    add_quad(&mut delegate, &id);
    let mut engine = RenderSync::new(MockBackend::new())?;

    engine.begin_frame();
    engine.sync_entity(&delegate, &id)?;
    engine.end_frame()?;
    let built = engine.accel().blas(&id).expect("BLAS after first sync");

    delegate.clear_dirty(&id);
    delegate.set_topology(&id, MeshTopology::new(vec![4], vec![0, 1, 2, 3]));
    engine.begin_frame();
    engine.sync_entity(&delegate, &id)?;
    engine.end_frame()?;

    let rebuilt = engine.accel().blas(&id).expect("BLAS after rebuild");
    assert_ne!(rebuilt, built);
    assert_eq!(engine.accel().rebuild_count(), 2);
    assert_eq!(engine.accel().refit_count(), 0);
    // The old structure is gone.
    assert_eq!(engine.backend().live_blas_count(), 1);
    Ok(())
}

#[test]
fn transform_change_updates_placement_without_blas_work() -> Result<()> {
    let id = EntityId::new("/scene/quad");
    let mut delegate = TestSceneDelegate::new();
    add_quad(&mut delegate, &id);
    let mut engine = RenderSync::new(MockBackend::new())?;

    engine.begin_frame();
    engine.sync_entity(&delegate, &id)?;
    engine.end_frame()?;
    let tlas_before = engine.accel().tlas().expect("TLAS after first frame");

    delegate.clear_dirty(&id);
    delegate.set_transform(&id, Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0)));
    engine.begin_frame();
    engine.sync_entity(&delegate, &id)?;
    engine.end_frame()?;

    assert_eq!(engine.accel().rebuild_count(), 1);
    assert_eq!(engine.accel().refit_count(), 0);
    assert_ne!(engine.accel().tlas(), Some(tlas_before));

    let tlas = engine.accel().tlas().expect("TLAS after placement change");
    let instances = engine.backend().tlas_instances(tlas).expect("instances");
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].transform[3][1], 3.0);
    Ok(())
}

#[test]
fn top_level_updates_batch_into_one_rebuild_per_frame() -> Result<()> {
    let a = EntityId::new("/scene/a");
    let b = EntityId::new("/scene/b");
    let mut delegate = TestSceneDelegate::new();
    add_quad(&mut delegate, &a);
    add_quad(&mut delegate, &b);
    let mut engine = RenderSync::new(MockBackend::new())?;

    // Both entities enter the scene in one frame: one TLAS build.
    engine.begin_frame();
    engine.sync_entity(&delegate, &a)?;
    engine.sync_entity(&delegate, &b)?;
    engine.end_frame()?;
    assert_eq!(engine.backend().counts().tlas_builds, 1);

    let tlas = engine.accel().tlas().expect("TLAS after first frame");
    let instances = engine.backend().tlas_instances(tlas).expect("instances");
    assert_eq!(instances.len(), 2);

    // Both move in the next frame: still exactly one more build.
    delegate.clear_dirty(&a);
    delegate.clear_dirty(&b);
    delegate.set_transform(&a, Mat4::from_translation(Vec3::X));
    delegate.set_transform(&b, Mat4::from_translation(Vec3::Y));
    engine.begin_frame();
    engine.sync_entity(&delegate, &a)?;
    engine.sync_entity(&delegate, &b)?;
    engine.end_frame()?;
    assert_eq!(engine.backend().counts().tlas_builds, 2);

    // A quiet frame rebuilds nothing.
    delegate.clear_dirty(&a);
    delegate.clear_dirty(&b);
    engine.begin_frame();
    engine.sync_entity(&delegate, &a)?;
    engine.sync_entity(&delegate, &b)?;
    engine.end_frame()?;
    assert_eq!(engine.backend().counts().tlas_builds, 2);
    Ok(())
}
