// tests/test_memory_pool.rs
// Pool lifetime rules driven through the engine's frame clock: released
// regions come back only after their frame's fence signals, and device
// allocation failure surfaces as OutOfMemory without corrupting the entity.

use trace3d::rhi::MockBackend;
use trace3d::scene::{EntityId, MeshTopology, TestSceneDelegate};
use trace3d::sync::{RenderSync, SyncConfig, SyncState};
use trace3d::RenderError;

fn quad_points() -> Vec<[f32; 3]> {
    vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
    ]
}

fn delegate_with(ids: &[&EntityId]) -> TestSceneDelegate {
    let mut delegate = TestSceneDelegate::new();
    for id in ids {
        delegate.add_mesh(
            id,
            MeshTopology::new(vec![3, 3], vec![0, 1, 2, 0, 2, 3]),
            quad_points(),
        );
    }
    delegate
}

#[test]
fn released_regions_wait_for_the_frame_fence() {
    let a = EntityId::new("/scene/a");
    let b = EntityId::new("/scene/b");
    let c = EntityId::new("/scene/c");
    let delegate = delegate_with(&[&a, &b, &c]);
    let mut engine = RenderSync::new(MockBackend::new()).unwrap();

    // Frame 1: create and immediately remove A; its regions retire keyed to
    // this frame.
    engine.begin_frame();
    engine.sync_entity(&delegate, &a).unwrap();
    let a_range = engine
        .pools()
        .positions
        .byte_range(engine.entity(&a).unwrap().position_region().unwrap())
        .unwrap();
    engine.remove_entity(&a).unwrap();
    engine.end_frame().unwrap();

    // Frame 2: the fence has not signaled, so B must not land on A's range.
    engine.begin_frame();
    engine.sync_entity(&delegate, &b).unwrap();
    let b_range = engine
        .pools()
        .positions
        .byte_range(engine.entity(&b).unwrap().position_region().unwrap())
        .unwrap();
    assert_ne!(a_range, b_range);
    engine.end_frame().unwrap();

    // GPU drains; frame 1 and 2 retire. C may now reuse A's storage.
    engine.backend_mut().complete_gpu_work();
    engine.begin_frame();
    assert!(engine.completed_frame() >= 1);
    engine.sync_entity(&delegate, &c).unwrap();
    let c_range = engine
        .pools()
        .positions
        .byte_range(engine.entity(&c).unwrap().position_region().unwrap())
        .unwrap();
    assert_eq!(c_range, a_range);
    engine.end_frame().unwrap();
}

#[test]
fn allocation_failure_leaves_entity_in_last_good_state() {
    let id = EntityId::new("/scene/quad");
    let mut delegate = delegate_with(&[&id]);

    // Tight budget: the initial pools fit, growth for a large point set
    // does not.
    let mut engine = RenderSync::with_config(
        MockBackend::with_budget(4000),
        SyncConfig {
            pipeline_depth: 2,
            initial_pool_capacity: 16,
        },
    )
    .unwrap();

    engine.begin_frame();
    engine.sync_entity(&delegate, &id).unwrap();
    engine.end_frame().unwrap();
    assert_eq!(engine.entity(&id).unwrap().state(), SyncState::Synced);

    // 1000 points force the position pool to grow past the budget.
    delegate.clear_dirty(&id);
    delegate.set_points(&id, vec![[0.0, 0.0, 0.0]; 1000]);

    engine.begin_frame();
    let err = engine.sync_entity(&delegate, &id).unwrap_err();
    assert!(matches!(err, RenderError::OutOfMemory(_)));

    // Entity keeps its last-good GPU state and CPU mirror.
    let entity = engine.entity(&id).unwrap();
    assert_eq!(entity.state(), SyncState::Synced);
    assert_eq!(entity.points().len(), 4);
    let range = engine
        .pools()
        .positions
        .byte_range(entity.position_region().unwrap())
        .unwrap();
    assert_eq!(range.end - range.start, 4 * 12);
}

#[test]
fn teardown_returns_all_device_memory() {
    let id = EntityId::new("/scene/quad");
    let delegate = delegate_with(&[&id]);
    let mut engine = RenderSync::new(MockBackend::new()).unwrap();

    engine.begin_frame();
    engine.sync_entity(&delegate, &id).unwrap();
    engine.end_frame().unwrap();

    let backend = engine.destroy();
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_blas_count(), 0);
    assert_eq!(backend.live_tlas_count(), 0);
}
