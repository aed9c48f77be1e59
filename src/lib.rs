//! Geometry Buffers - shared GPU vertex/index buffers for CPU geometry
//!
//! Turns CPU-side [`Geometry`] objects into GPU vertex and index buffers and
//! shares them between every renderable that draws the same geometry with
//! the same buffer layout.
//!
//! # Features
//! - Per-stream dirty tracking: only the streams a geometry change touched
//!   are re-uploaded
//! - Shared cache keyed by buffer model type and geometry id, with
//!   reference-counted teardown
//! - Mesh, dynamic mesh, line, point, billboard and bone-skin layouts
//! - GPU skinning pre-pass with a per-instance skinned vertex buffer
//! - A narrow device seam ([`backend`]) with a recording dummy backend
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use geometry_buffers::backend::dummy::{DummyContext, DummyDevice, DummyResources};
//! use geometry_buffers::prelude::*;
//! use glam::Vec3;
//!
//! let geometry = Geometry::new(GeometryKind::Mesh);
//! geometry.set_positions(Some(Arc::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y])));
//! geometry.set_indices(Some(Arc::new(vec![0, 1, 2])));
//!
//! let manager = GeometryBufferManager::default();
//! let proxy = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
//!
//! let mut ctx = DummyContext::new(DummyDevice::new());
//! let mut slot = 0;
//! assert!(proxy.attach_buffers(&mut ctx, &mut slot, &DummyResources::default()));
//! assert_eq!(slot, 3);
//! ```

pub mod backend;
pub mod buffers;
pub mod config;
pub mod events;
pub mod geometry;
pub mod manager;
pub mod skinning;

pub use buffers::{
    BillboardBufferModel, BoneMatricesBufferModel, BoneSkinMeshBufferModel,
    DynamicMeshGeometryBufferModel, ElementsBufferModel, GeometryBufferModel,
    InstanceBufferModel, LineGeometryBufferModel, MeshGeometryBufferModel,
    PointGeometryBufferModel,
};
pub use config::BufferCacheConfig;
pub use geometry::{Geometry, GeometryId, GeometryKind, GeometryProperty, ModelId};
pub use manager::{GeometryBufferManager, GeometryBufferProxy};
pub use skinning::BoneSkinPreComputeBufferModel;

/// Commonly used types.
pub mod prelude {
    pub use crate::buffers::{
        BillboardBufferModel, BoneSkinMeshBufferModel, BufferLayout,
        DynamicMeshGeometryBufferModel, GeometryBufferModel, InstanceBufferModel,
        LineGeometryBufferModel, MeshGeometryBufferModel, PointGeometryBufferModel, StreamMask,
    };
    pub use crate::config::BufferCacheConfig;
    pub use crate::geometry::{Geometry, GeometryId, GeometryKind, GeometryProperty, ModelId};
    pub use crate::manager::{GeometryBufferManager, GeometryBufferProxy, ManagedBufferModel};
    pub use crate::skinning::{BoneSkinMeshBuffer, BoneSkinPreComputeBufferModel};
}
