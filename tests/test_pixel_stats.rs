// tests/test_pixel_stats.rs
// Statistics pipeline state machine: collection, reduction, fenced readback,
// and the double-buffered overlap of collection with a pending readback.

use trace3d::rhi::{MockBackend, RenderBackend};
use trace3d::stats::{PixelCounters, PixelStats, StatsState};
use trace3d::RenderError;

fn write_counters(backend: &mut MockBackend, stats: &PixelStats, records: &[PixelCounters]) {
    backend
        .write_buffer(stats.counters_buffer(), 0, bytemuck::cast_slice(records))
        .unwrap();
}

#[test]
fn stats_are_unavailable_before_any_end_frame() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    assert_eq!(stats.state(), StatsState::Idle);
    assert_eq!(stats.get_stats(&mut backend).unwrap(), None);

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    assert_eq!(stats.get_stats(&mut backend).unwrap(), None);
}

#[test]
fn nested_begin_and_stray_end_are_invalid() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    let err = stats.end_frame(&mut backend).unwrap_err();
    assert!(matches!(err, RenderError::InvalidState(_)));

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    let err = stats.begin_frame(&mut backend, 2, 2).unwrap_err();
    assert!(matches!(err, RenderError::InvalidState(_)));
}

#[test]
fn full_cycle_reduces_and_derives_averages() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    assert_eq!(stats.state(), StatsState::Collecting);

    // Each of the four pixels traced 1 visibility + 2 closest-hit rays over
    // one path vertex.
    let records = [PixelCounters {
        visibility_rays: 1,
        closest_hit_rays: 2,
        path_vertices: 1,
        volume_lookups: 3,
    }; 4];
    write_counters(&mut backend, &stats, &records);

    stats.end_frame(&mut backend).unwrap();
    assert_eq!(stats.state(), StatsState::Reducing);

    // Fence not signaled yet: not an error, just not available.
    assert_eq!(stats.get_stats(&mut backend).unwrap(), None);
    assert_eq!(stats.state(), StatsState::Reducing);

    backend.complete_gpu_work();
    let result = stats.get_stats(&mut backend).unwrap().unwrap();
    assert_eq!(stats.state(), StatsState::Available);

    assert_eq!(result.visibility_rays, 4);
    assert_eq!(result.closest_hit_rays, 8);
    assert_eq!(result.total_rays, 12);
    assert_eq!(result.path_vertices, 4);
    assert_eq!(result.volume_lookups, 12);
    assert_eq!(result.avg_rays_per_path, 3.0);
    assert_eq!(result.avg_path_vertices, 1.0);
}

#[test]
fn zero_path_vertices_yields_zero_average() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    stats.end_frame(&mut backend).unwrap();
    backend.complete_gpu_work();

    let result = stats.get_stats(&mut backend).unwrap().unwrap();
    assert_eq!(result.total_rays, 0);
    assert_eq!(result.avg_rays_per_path, 0.0);
}

#[test]
fn collection_overlaps_a_pending_readback() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    let first_target = stats.counters_buffer();
    let records = [PixelCounters {
        visibility_rays: 1,
        closest_hit_rays: 0,
        path_vertices: 1,
        volume_lookups: 0,
    }; 4];
    write_counters(&mut backend, &stats, &records);
    stats.end_frame(&mut backend).unwrap();

    // The next frame starts while the previous readback is still in flight;
    // it must land in the other buffer of the pair.
    stats.begin_frame(&mut backend, 2, 2).unwrap();
    assert_ne!(stats.counters_buffer(), first_target);
    assert_eq!(stats.state(), StatsState::Collecting);

    // The previous frame's reduction resolves mid-collection.
    backend.complete_gpu_work();
    let result = stats.get_stats(&mut backend).unwrap().unwrap();
    assert_eq!(result.total_rays, 4);

    stats.end_frame(&mut backend).unwrap();
}

#[test]
fn begin_frame_rearms_after_available() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    stats.end_frame(&mut backend).unwrap();
    backend.complete_gpu_work();
    assert!(stats.get_stats(&mut backend).unwrap().is_some());
    assert_eq!(stats.state(), StatsState::Available);

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    assert_eq!(stats.state(), StatsState::Collecting);

    // Last-known stats remain readable while the new frame collects.
    assert!(stats.get_stats(&mut backend).unwrap().is_some());
}

#[test]
fn disabled_pipeline_is_inert() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();
    stats.set_enabled(false);

    stats.begin_frame(&mut backend, 2, 2).unwrap();
    stats.end_frame(&mut backend).unwrap();
    assert_eq!(stats.state(), StatsState::Idle);
    assert_eq!(stats.get_stats(&mut backend).unwrap(), None);
    assert_eq!(backend.counts().reductions, 0);
}

#[test]
fn resize_recreates_the_buffer_pair() {
    let mut backend = MockBackend::new();
    let mut stats = PixelStats::new(&mut backend, 2, 2).unwrap();

    stats.begin_frame(&mut backend, 4, 4).unwrap();
    let records = [PixelCounters {
        visibility_rays: 1,
        closest_hit_rays: 0,
        path_vertices: 1,
        volume_lookups: 0,
    }; 16];
    write_counters(&mut backend, &stats, &records);
    stats.end_frame(&mut backend).unwrap();
    backend.complete_gpu_work();

    let result = stats.get_stats(&mut backend).unwrap().unwrap();
    assert_eq!(result.total_rays, 16);
    assert_eq!(result.avg_path_vertices, 1.0);
}
