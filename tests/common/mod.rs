//! Shared setup for the buffer cache integration tests.

use std::sync::Arc;

use geometry_buffers::backend::dummy::{DummyContext, DummyDevice, DummyResources};
use geometry_buffers::geometry::BoneIds;
use geometry_buffers::{Geometry, GeometryKind};
use glam::{Vec2, Vec3, Vec4};

/// Dummy device, a context recording into it and texture resources.
pub struct TestContext {
    pub device: Arc<DummyDevice>,
    pub ctx: DummyContext,
    pub resources: DummyResources,
}

impl TestContext {
    pub fn new() -> Self {
        init_logging();
        let device = DummyDevice::new();
        Self {
            ctx: DummyContext::new(device.clone()),
            device,
            resources: DummyResources::default(),
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// A unit quad with every vertex attribute filled in.
pub fn quad(kind: GeometryKind) -> Arc<Geometry> {
    let geometry = Geometry::new(kind);
    geometry.set_positions(Some(Arc::new(vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(1.0, 1.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
    ])));
    geometry.set_indices(Some(Arc::new(vec![0, 1, 2, 0, 2, 3])));
    geometry.set_normals(Some(Arc::new(vec![Vec3::Z; 4])));
    geometry.set_texture_coordinates(Some(Arc::new(vec![
        Vec2::new(0.0, 0.0),
        Vec2::new(1.0, 0.0),
        Vec2::new(1.0, 1.0),
        Vec2::new(0.0, 1.0),
    ])));
    geometry.set_colors(Some(Arc::new(vec![Vec4::ONE; 4])));
    geometry.set_bone_ids(Some(Arc::new(vec![BoneIds::single(0); 4])));
    geometry
}
