//! The closed set of geometry buffer layouts.
//!
//! | Layout | Streams | Index | Topology |
//! |---|---|---|---|
//! | [`DefaultMeshLayout`] | vertex, texcoord, color | u32 | triangle list |
//! | [`DynamicMeshLayout`] | as default mesh, dynamic allocation | u32 | triangle list |
//! | [`LineLayout`] | position/color | u32 | line list |
//! | [`PointLayout`] | position/color | none | point list |
//! | [`BillboardLayout`] | billboard vertex | none | point list |
//! | [`BoneSkinMeshLayout`] | mesh streams + bone ids | u32 | triangle list |

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use parking_lot::Mutex;

use super::model::{BufferLayout, GeometryBufferModel, StreamMask};
use super::proxy::{BufferAllocation, ElementsBufferProxy};
use crate::backend::{
    BackendResult, BufferUsage, DeviceContext, DeviceResources, PrimitiveTopology, TextureHandle,
    TextureManager,
};
use crate::config::BufferCacheConfig;
use crate::geometry::{BoneIds, Geometry, GeometryProperty, GeometryStreams};

pub type MeshGeometryBufferModel = GeometryBufferModel<DefaultMeshLayout>;
pub type DynamicMeshGeometryBufferModel = GeometryBufferModel<DynamicMeshLayout>;
pub type LineGeometryBufferModel = GeometryBufferModel<LineLayout>;
pub type PointGeometryBufferModel = GeometryBufferModel<PointLayout>;
pub type BillboardBufferModel = GeometryBufferModel<BillboardLayout>;
pub type BoneSkinMeshBufferModel = GeometryBufferModel<BoneSkinMeshLayout>;

pub const MESH_VERTEX_STREAM: usize = 0;
pub const TEXCOORD_STREAM: usize = 1;
pub const COLOR_STREAM: usize = 2;
pub const BONE_ID_STREAM: usize = 3;

/// Interleaved per-vertex mesh data (stream 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 4],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub bitangent: [f32; 3],
}

/// Position and color, used by lines and points.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorVertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
}

/// One billboard, expanded to a quad on the GPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BillboardVertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
    pub size: [f32; 2],
    pub uv_min: [f32; 2],
    pub uv_max: [f32; 2],
}

fn slice<T>(stream: &Option<Arc<Vec<T>>>) -> &[T] {
    match stream.as_deref() {
        Some(values) => values.as_slice(),
        None => &[][..],
    }
}

fn attribute<T: Copy>(stream: &Option<Arc<Vec<T>>>, index: usize, default: T) -> T {
    slice(stream).get(index).copied().unwrap_or(default)
}

/// Snapshot of the geometry streams; empty when the geometry is gone.
fn snapshot(geometry: Option<&Geometry>) -> GeometryStreams {
    geometry.map(|g| g.streams().clone()).unwrap_or_default()
}

fn proxy<T>(
    label: &str,
    usage: BufferUsage,
    allocation: BufferAllocation,
    config: &BufferCacheConfig,
) -> ElementsBufferProxy {
    ElementsBufferProxy::new(
        label,
        std::mem::size_of::<T>() as u32,
        usage,
        allocation,
        config,
    )
}

fn mesh_vertex_buffers(
    name: &str,
    allocation: BufferAllocation,
    config: &BufferCacheConfig,
) -> Vec<ElementsBufferProxy> {
    vec![
        proxy::<MeshVertex>(&format!("{name}.vertices"), BufferUsage::VERTEX, allocation, config),
        proxy::<Vec2>(&format!("{name}.texcoords"), BufferUsage::VERTEX, allocation, config),
        proxy::<Vec4>(&format!("{name}.colors"), BufferUsage::VERTEX, allocation, config),
    ]
}

/// Texcoords and colors are emptied with the positions.
const MESH_COUNT_STREAMS: StreamMask = StreamMask::single(TEXCOORD_STREAM).with(COLOR_STREAM);

fn index_buffer(
    name: &str,
    allocation: BufferAllocation,
    config: &BufferCacheConfig,
) -> ElementsBufferProxy {
    proxy::<u32>(&format!("{name}.indices"), BufferUsage::INDEX, allocation, config)
}

fn is_mesh_stream_changed(property: GeometryProperty, stream: usize) -> bool {
    match stream {
        MESH_VERTEX_STREAM => matches!(
            property,
            GeometryProperty::Positions
                | GeometryProperty::Normals
                | GeometryProperty::Tangents
                | GeometryProperty::BiTangents
        ),
        TEXCOORD_STREAM => property == GeometryProperty::TextureCoordinates,
        COLOR_STREAM => property == GeometryProperty::Colors,
        _ => false,
    }
}

pub fn mesh_vertices(streams: &GeometryStreams) -> Vec<MeshVertex> {
    slice(&streams.positions)
        .iter()
        .enumerate()
        .map(|(i, position)| MeshVertex {
            position: position.extend(1.0).to_array(),
            normal: attribute(&streams.normals, i, Vec3::ZERO).to_array(),
            tangent: attribute(&streams.tangents, i, Vec3::ZERO).to_array(),
            bitangent: attribute(&streams.bitangents, i, Vec3::ZERO).to_array(),
        })
        .collect()
}

pub fn color_vertices(streams: &GeometryStreams) -> Vec<ColorVertex> {
    slice(&streams.positions)
        .iter()
        .enumerate()
        .map(|(i, position)| ColorVertex {
            position: position.extend(1.0).to_array(),
            color: attribute(&streams.colors, i, Vec4::ONE).to_array(),
        })
        .collect()
}

pub fn billboard_vertices(streams: &GeometryStreams) -> Vec<BillboardVertex> {
    let default_item = crate::geometry::BillboardItem::new(Vec2::ONE);
    slice(&streams.positions)
        .iter()
        .enumerate()
        .map(|(i, position)| {
            let item = attribute(&streams.billboard_items, i, default_item);
            BillboardVertex {
                position: position.extend(1.0).to_array(),
                color: attribute(&streams.colors, i, Vec4::ONE).to_array(),
                size: item.size.to_array(),
                uv_min: item.uv_min.to_array(),
                uv_max: item.uv_max.to_array(),
            }
        })
        .collect()
}

/// Upload one of the three mesh streams. Every stream is emptied when the
/// geometry has no positions.
fn upload_mesh_stream(
    ctx: &dyn DeviceContext,
    buffer: &mut ElementsBufferProxy,
    stream: usize,
    streams: &GeometryStreams,
) -> BackendResult<()> {
    let empty = streams.vertex_count() == 0;
    match stream {
        MESH_VERTEX_STREAM => buffer.upload_data(ctx, &mesh_vertices(streams)),
        TEXCOORD_STREAM if empty => buffer.upload_data::<Vec2>(ctx, &[]),
        TEXCOORD_STREAM => buffer.upload_data(ctx, slice(&streams.texture_coordinates)),
        COLOR_STREAM if empty => buffer.upload_data::<Vec4>(ctx, &[]),
        COLOR_STREAM => buffer.upload_data(ctx, slice(&streams.colors)),
        _ => Ok(()),
    }
}

/// Static mesh with immutable buffers.
#[derive(Debug, Default)]
pub struct DefaultMeshLayout;

impl BufferLayout for DefaultMeshLayout {
    fn create(_config: &BufferCacheConfig) -> Self {
        Self
    }

    fn name(&self) -> &'static str {
        "MeshGeometryBuffer"
    }

    fn topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::TriangleList
    }

    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
        mesh_vertex_buffers(self.name(), BufferAllocation::Immutable, config)
    }

    fn create_index_buffer(&self, config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
        Some(index_buffer(self.name(), BufferAllocation::Immutable, config))
    }

    fn is_vertex_buffer_changed(&self, property: GeometryProperty, stream: usize) -> bool {
        is_mesh_stream_changed(property, stream)
    }

    fn vertex_count_streams(&self) -> StreamMask {
        MESH_COUNT_STREAMS
    }

    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        stream: usize,
        geometry: Option<&Geometry>,
        _resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        upload_mesh_stream(ctx, buffer, stream, &snapshot(geometry))
    }
}

/// Mesh whose buffers are rewritten in place, for frequently edited geometry.
#[derive(Debug, Default)]
pub struct DynamicMeshLayout;

impl BufferLayout for DynamicMeshLayout {
    fn create(_config: &BufferCacheConfig) -> Self {
        Self
    }

    fn name(&self) -> &'static str {
        "DynamicMeshGeometryBuffer"
    }

    fn topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::TriangleList
    }

    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
        mesh_vertex_buffers(self.name(), BufferAllocation::Dynamic, config)
    }

    fn create_index_buffer(&self, config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
        Some(index_buffer(self.name(), BufferAllocation::Dynamic, config))
    }

    fn is_vertex_buffer_changed(&self, property: GeometryProperty, stream: usize) -> bool {
        is_mesh_stream_changed(property, stream)
    }

    fn vertex_count_streams(&self) -> StreamMask {
        MESH_COUNT_STREAMS
    }

    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        stream: usize,
        geometry: Option<&Geometry>,
        _resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        upload_mesh_stream(ctx, buffer, stream, &snapshot(geometry))
    }
}

#[derive(Debug, Default)]
pub struct LineLayout;

impl BufferLayout for LineLayout {
    fn create(_config: &BufferCacheConfig) -> Self {
        Self
    }

    fn name(&self) -> &'static str {
        "LineGeometryBuffer"
    }

    fn topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::LineList
    }

    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
        vec![proxy::<ColorVertex>(
            "LineGeometryBuffer.vertices",
            BufferUsage::VERTEX,
            BufferAllocation::Immutable,
            config,
        )]
    }

    fn create_index_buffer(&self, config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
        Some(index_buffer(self.name(), BufferAllocation::Immutable, config))
    }

    fn is_vertex_buffer_changed(&self, property: GeometryProperty, _stream: usize) -> bool {
        matches!(property, GeometryProperty::Positions | GeometryProperty::Colors)
    }

    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        _stream: usize,
        geometry: Option<&Geometry>,
        _resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        buffer.upload_data(ctx, &color_vertices(&snapshot(geometry)))
    }
}

#[derive(Debug, Default)]
pub struct PointLayout;

impl BufferLayout for PointLayout {
    fn create(_config: &BufferCacheConfig) -> Self {
        Self
    }

    fn name(&self) -> &'static str {
        "PointGeometryBuffer"
    }

    fn topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::PointList
    }

    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
        vec![proxy::<ColorVertex>(
            "PointGeometryBuffer.vertices",
            BufferUsage::VERTEX,
            BufferAllocation::Immutable,
            config,
        )]
    }

    fn create_index_buffer(&self, _config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
        None
    }

    fn is_vertex_buffer_changed(&self, property: GeometryProperty, _stream: usize) -> bool {
        matches!(property, GeometryProperty::Positions | GeometryProperty::Colors)
    }

    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        _stream: usize,
        geometry: Option<&Geometry>,
        _resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        buffer.upload_data(ctx, &color_vertices(&snapshot(geometry)))
    }
}

struct BoundTexture {
    key: Arc<str>,
    handle: TextureHandle,
    manager: Arc<dyn TextureManager>,
}

/// Billboards; the texture is shared through the device's texture manager.
#[derive(Default)]
pub struct BillboardLayout {
    texture: Mutex<Option<BoundTexture>>,
}

impl BillboardLayout {
    /// The resolved billboard texture.
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture.lock().as_ref().map(|bound| bound.handle)
    }

    fn resolve_texture(&self, key: Option<&Arc<str>>, resources: &dyn DeviceResources) {
        let mut bound = self.texture.lock();
        if bound.as_ref().map(|b| &*b.key) == key.map(|k| &**k) {
            return;
        }
        if let Some(old) = bound.take() {
            old.manager.release(old.handle);
        }
        let Some(key) = key else {
            return;
        };
        let Some(manager) = resources.texture_manager() else {
            log::warn!("BillboardGeometryBuffer: no texture manager for {:?}", key);
            return;
        };
        match manager.acquire(key) {
            Some(handle) => {
                *bound = Some(BoundTexture {
                    key: key.clone(),
                    handle,
                    manager,
                })
            }
            None => log::warn!("BillboardGeometryBuffer: texture {:?} not found", key),
        }
    }
}

impl BufferLayout for BillboardLayout {
    fn create(_config: &BufferCacheConfig) -> Self {
        Self::default()
    }

    fn name(&self) -> &'static str {
        "BillboardGeometryBuffer"
    }

    fn topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::PointList
    }

    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
        vec![proxy::<BillboardVertex>(
            "BillboardGeometryBuffer.vertices",
            BufferUsage::VERTEX,
            BufferAllocation::Dynamic,
            config,
        )]
    }

    fn create_index_buffer(&self, _config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
        None
    }

    fn is_vertex_buffer_changed(&self, property: GeometryProperty, _stream: usize) -> bool {
        matches!(
            property,
            GeometryProperty::Positions
                | GeometryProperty::Colors
                | GeometryProperty::BillboardItems
                | GeometryProperty::Texture
        )
    }

    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        _stream: usize,
        geometry: Option<&Geometry>,
        resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        let streams = snapshot(geometry);
        self.resolve_texture(streams.texture.as_ref(), resources);
        buffer.upload_data(ctx, &billboard_vertices(&streams))
    }

    fn on_dispose(&self) {
        if let Some(bound) = self.texture.lock().take() {
            bound.manager.release(bound.handle);
        }
    }
}

/// Mesh streams plus per-vertex bone ids for skinning.
#[derive(Debug, Default)]
pub struct BoneSkinMeshLayout;

impl BufferLayout for BoneSkinMeshLayout {
    fn create(_config: &BufferCacheConfig) -> Self {
        Self
    }

    fn name(&self) -> &'static str {
        "BoneSkinMeshGeometryBuffer"
    }

    fn topology(&self) -> PrimitiveTopology {
        PrimitiveTopology::TriangleList
    }

    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
        let mut buffers = mesh_vertex_buffers(self.name(), BufferAllocation::Immutable, config);
        // Stream 0 is the copy source for the skinned output buffer.
        buffers[MESH_VERTEX_STREAM] = proxy::<MeshVertex>(
            "BoneSkinMeshGeometryBuffer.vertices",
            BufferUsage::VERTEX | BufferUsage::COPY_SRC,
            BufferAllocation::Immutable,
            config,
        );
        buffers.push(proxy::<BoneIds>(
            "BoneSkinMeshGeometryBuffer.bone_ids",
            BufferUsage::VERTEX,
            BufferAllocation::Immutable,
            config,
        ));
        buffers
    }

    fn create_index_buffer(&self, config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
        Some(index_buffer(self.name(), BufferAllocation::Immutable, config))
    }

    fn is_vertex_buffer_changed(&self, property: GeometryProperty, stream: usize) -> bool {
        match stream {
            BONE_ID_STREAM => property == GeometryProperty::VertexBoneIds,
            _ => is_mesh_stream_changed(property, stream),
        }
    }

    fn vertex_count_streams(&self) -> StreamMask {
        MESH_COUNT_STREAMS.with(BONE_ID_STREAM)
    }

    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        stream: usize,
        geometry: Option<&Geometry>,
        _resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        let streams = snapshot(geometry);
        if stream != BONE_ID_STREAM {
            return upload_mesh_stream(ctx, buffer, stream, &streams);
        }
        let bone_ids: Vec<BoneIds> = (0..streams.vertex_count())
            .map(|i| attribute(&streams.bone_ids, i, BoneIds::zeroed()))
            .collect();
        buffer.upload_data(ctx, &bone_ids)
    }
}
