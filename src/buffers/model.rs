//! Vertex/index buffers derived from one geometry object.
//!
//! [`GeometryBufferModel`] owns the dirty tracking and locking shared by every
//! geometry kind. What a stream contains and how it is formatted for upload
//! is decided by its [`BufferLayout`].
//!
//! # Dirty tracking
//!
//! Each vertex stream has one bit in a 32-bit mask and the index buffer has
//! one flag. A bit is set by geometry change notifications or by assigning a
//! new geometry. [`GeometryBufferModel::update_buffers`] takes the bits
//! before uploading and puts a bit back when its stream fails to upload, so
//! a change arriving during an upload is never lost. Vertex and index
//! dirtiness are independent.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::proxy::ElementsBufferProxy;
use crate::backend::{
    BackendResult, BufferHandle, DeviceContext, DeviceResources, IndexFormat, PrimitiveTopology,
    VertexBufferBinding,
};
use crate::config::BufferCacheConfig;
use crate::events::EventHandlers;
use crate::geometry::{Geometry, GeometryId, GeometryObserver, GeometryProperty, SubscriptionId};

/// Upper bound on vertex streams per model, one dirty bit each.
pub const MAX_VERTEX_STREAMS: usize = 32;

/// Set of vertex stream indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamMask(u32);

impl StreamMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask with streams `0..count` set.
    pub const fn all(count: usize) -> Self {
        if count >= MAX_VERTEX_STREAMS {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    pub const fn single(stream: usize) -> Self {
        Self(1 << stream)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, stream: usize) -> bool {
        stream < MAX_VERTEX_STREAMS && self.0 & (1 << stream) != 0
    }

    pub const fn with(self, stream: usize) -> Self {
        Self(self.0 | 1 << stream)
    }

    pub fn insert(&mut self, stream: usize) {
        self.0 |= 1 << stream;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_VERTEX_STREAMS).filter(|stream| self.contains(*stream))
    }
}

/// Upload formatting for one geometry kind.
///
/// Implementations own only the formatting of stream data; the dirty bits,
/// locks and binding bookkeeping live in [`GeometryBufferModel`].
pub trait BufferLayout: Send + Sync + 'static {
    fn create(config: &BufferCacheConfig) -> Self
    where
        Self: Sized;

    /// Name used in log output
    fn name(&self) -> &'static str;

    fn topology(&self) -> PrimitiveTopology;

    fn index_format(&self) -> IndexFormat {
        IndexFormat::Uint32
    }

    /// One proxy per vertex stream, in slot order
    fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy>;

    fn create_index_buffer(&self, config: &BufferCacheConfig) -> Option<ElementsBufferProxy>;

    /// Whether a change of `property` makes vertex stream `stream` stale
    fn is_vertex_buffer_changed(&self, property: GeometryProperty, stream: usize) -> bool {
        let _ = stream;
        property == GeometryProperty::Positions
    }

    /// Streams whose contents depend on the number of positions. They are
    /// marked dirty whenever that number changes.
    fn vertex_count_streams(&self) -> StreamMask {
        StreamMask::empty()
    }

    /// Whether a change of `property` makes the index buffer stale
    fn is_index_buffer_changed(&self, property: GeometryProperty) -> bool {
        property == GeometryProperty::Indices
    }

    /// Upload vertex stream `stream` from `geometry`.
    ///
    /// A missing geometry or an empty position stream must still upload
    /// (an empty buffer) so stale data is never drawn.
    fn on_create_vertex_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        stream: usize,
        geometry: Option<&Geometry>,
        resources: &dyn DeviceResources,
    ) -> BackendResult<()>;

    fn on_create_index_buffer(
        &self,
        ctx: &dyn DeviceContext,
        buffer: &mut ElementsBufferProxy,
        geometry: Option<&Geometry>,
        _resources: &dyn DeviceResources,
    ) -> BackendResult<()> {
        let indices = geometry.and_then(|g| g.indices());
        let data: &[u32] = match indices.as_deref() {
            Some(indices) => indices.as_slice(),
            None => &[][..],
        };
        buffer.upload_data(ctx, data)
    }

    /// Release layout-owned resources. Runs on dispose and again on drop.
    fn on_dispose(&self) {}
}

struct BoundGeometry {
    id: GeometryId,
    geometry: Weak<Geometry>,
    subscription: SubscriptionId,
}

/// GPU buffers for a single geometry object under one [`BufferLayout`].
///
/// The geometry is observed, never owned: the model holds a weak reference
/// and a subscription that is dropped when the geometry is replaced or the
/// model is disposed.
pub struct GeometryBufferModel<L: BufferLayout> {
    layout: L,
    weak_self: Weak<Self>,
    geometry: RwLock<Option<BoundGeometry>>,
    stream_count: usize,
    vertex_buffers: Mutex<Vec<ElementsBufferProxy>>,
    index_buffer: Mutex<Option<ElementsBufferProxy>>,
    vertex_changed: AtomicU32,
    index_changed: AtomicBool,
    source_vertex_count: AtomicUsize,
    vertex_bindings: RwLock<Vec<VertexBufferBinding>>,
    disposed: AtomicBool,
    vertex_buffers_updated: EventHandlers<StreamMask>,
    index_buffer_updated: EventHandlers<()>,
    invalidate_renderer: EventHandlers<()>,
}

impl<L: BufferLayout> GeometryBufferModel<L> {
    pub fn new(config: &BufferCacheConfig) -> Arc<Self> {
        Self::with_layout(L::create(config), config)
    }

    /// # Panics
    ///
    /// Panics if the layout declares no vertex streams or more than
    /// [`MAX_VERTEX_STREAMS`].
    pub fn with_layout(layout: L, config: &BufferCacheConfig) -> Arc<Self> {
        let vertex_buffers = layout.create_vertex_buffers(config);
        let stream_count = vertex_buffers.len();
        assert!(
            (1..=MAX_VERTEX_STREAMS).contains(&stream_count),
            "{} declares {} vertex streams, supported range is 1..={}",
            layout.name(),
            stream_count,
            MAX_VERTEX_STREAMS
        );
        let index_buffer = layout.create_index_buffer(config);

        Arc::new_cyclic(|weak_self| Self {
            layout,
            weak_self: weak_self.clone(),
            geometry: RwLock::new(None),
            stream_count,
            vertex_buffers: Mutex::new(vertex_buffers),
            index_buffer: Mutex::new(index_buffer),
            vertex_changed: AtomicU32::new(StreamMask::all(stream_count).bits()),
            index_changed: AtomicBool::new(true),
            source_vertex_count: AtomicUsize::new(0),
            vertex_bindings: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
            vertex_buffers_updated: EventHandlers::new(),
            index_buffer_updated: EventHandlers::new(),
            invalidate_renderer: EventHandlers::new(),
        })
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.layout.topology()
    }

    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// The observed geometry, if it is still alive.
    pub fn geometry(&self) -> Option<Arc<Geometry>> {
        self.geometry
            .read()
            .as_ref()
            .and_then(|bound| bound.geometry.upgrade())
    }

    pub fn geometry_id(&self) -> Option<GeometryId> {
        self.geometry.read().as_ref().map(|bound| bound.id)
    }

    /// Observe `geometry` instead of the current one.
    ///
    /// Assigning the geometry already observed does nothing. Otherwise every
    /// stream and the index buffer become dirty and the renderer is
    /// invalidated.
    pub fn set_geometry(&self, geometry: Option<&Arc<Geometry>>) {
        {
            let mut bound = self.geometry.write();
            let same = match (bound.as_ref(), geometry) {
                (None, None) => true,
                (Some(current), Some(new)) => std::ptr::eq(current.geometry.as_ptr(), Arc::as_ptr(new)),
                _ => false,
            };
            if same {
                return;
            }

            if let Some(old) = bound.take() {
                if let Some(old_geometry) = old.geometry.upgrade() {
                    old_geometry.unsubscribe(old.subscription);
                }
            }

            self.source_vertex_count.store(
                geometry.map_or(0, |new| new.vertex_count()),
                Ordering::Release,
            );
            if let Some(new) = geometry {
                let observer: Weak<dyn GeometryObserver> = self.weak_self.clone();
                *bound = Some(BoundGeometry {
                    id: new.id(),
                    geometry: Arc::downgrade(new),
                    subscription: new.subscribe(observer),
                });
            }
        }

        self.mark_all_dirty();
        self.invalidate_renderer.emit(&());
    }

    /// Mark every vertex stream and the index buffer dirty.
    pub fn mark_all_dirty(&self) {
        self.vertex_changed
            .store(StreamMask::all(self.stream_count).bits(), Ordering::Release);
        self.index_changed.store(true, Ordering::Release);
    }

    /// Vertex streams waiting for upload.
    pub fn vertex_changed(&self) -> StreamMask {
        StreamMask::from_bits(self.vertex_changed.load(Ordering::Acquire))
    }

    /// Whether the index buffer is waiting for upload.
    pub fn index_changed(&self) -> bool {
        self.index_changed.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Bindings as of the last vertex upload.
    pub fn vertex_bindings(&self) -> Vec<VertexBufferBinding> {
        self.vertex_bindings.read().clone()
    }

    pub fn vertex_buffer(&self, stream: usize) -> Option<BufferHandle> {
        self.vertex_buffers.lock().get(stream).and_then(|b| b.buffer())
    }

    /// Elements currently uploaded to vertex stream `stream`.
    pub fn vertex_count(&self, stream: usize) -> usize {
        self.vertex_buffers
            .lock()
            .get(stream)
            .map_or(0, |b| b.element_count())
    }

    pub fn index_buffer(&self) -> Option<BufferHandle> {
        self.index_buffer.lock().as_ref().and_then(|b| b.buffer())
    }

    pub fn index_count(&self) -> usize {
        self.index_buffer
            .lock()
            .as_ref()
            .map_or(0, |b| b.element_count())
    }

    pub fn has_index_buffer(&self) -> bool {
        self.index_buffer.lock().is_some()
    }

    /// Raised after vertex streams were uploaded, with the uploaded set.
    pub fn on_vertex_buffers_updated(&self) -> &EventHandlers<StreamMask> {
        &self.vertex_buffers_updated
    }

    /// Raised after the index buffer was uploaded.
    pub fn on_index_buffer_updated(&self) -> &EventHandlers<()> {
        &self.index_buffer_updated
    }

    /// Raised whenever GPU data became stale and the scene must redraw.
    pub fn on_invalidate_renderer(&self) -> &EventHandlers<()> {
        &self.invalidate_renderer
    }

    /// Upload every dirty stream. Returns whether anything was uploaded.
    pub fn update_buffers(&self, ctx: &mut dyn DeviceContext, resources: &dyn DeviceResources) -> bool {
        if self.is_disposed() {
            return false;
        }
        let geometry = self.geometry();
        let mut updated = false;

        if self.vertex_changed.load(Ordering::Acquire) != 0 {
            let mut buffers = self.vertex_buffers.lock();
            let dirty = StreamMask::from_bits(self.vertex_changed.swap(0, Ordering::AcqRel));
            let mut uploaded = StreamMask::empty();

            for (stream, buffer) in buffers.iter_mut().enumerate() {
                if !dirty.contains(stream) {
                    continue;
                }
                match self.layout.on_create_vertex_buffer(
                    &*ctx,
                    buffer,
                    stream,
                    geometry.as_deref(),
                    resources,
                ) {
                    Ok(()) => uploaded.insert(stream),
                    Err(err) => {
                        self.vertex_changed
                            .fetch_or(StreamMask::single(stream).bits(), Ordering::AcqRel);
                        log::warn!(
                            "{}: vertex stream {} upload failed: {}",
                            self.layout.name(),
                            stream,
                            err
                        );
                    }
                }
            }

            if !uploaded.is_empty() {
                *self.vertex_bindings.write() = buffers.iter().map(|b| b.binding()).collect();
                drop(buffers);
                log::trace!(
                    "{}: uploaded vertex streams {:#b}",
                    self.layout.name(),
                    uploaded.bits()
                );
                self.vertex_buffers_updated.emit(&uploaded);
                updated = true;
            }
        }

        if self.index_changed.load(Ordering::Acquire) {
            let mut index = self.index_buffer.lock();
            let taken = self.index_changed.swap(false, Ordering::AcqRel);
            let uploaded = match index.as_mut() {
                Some(buffer) if taken => {
                    match self.layout.on_create_index_buffer(
                        &*ctx,
                        buffer,
                        geometry.as_deref(),
                        resources,
                    ) {
                        Ok(()) => true,
                        Err(err) => {
                            self.index_changed.store(true, Ordering::Release);
                            log::warn!("{}: index upload failed: {}", self.layout.name(), err);
                            false
                        }
                    }
                }
                _ => false,
            };
            drop(index);

            if uploaded {
                log::trace!("{}: uploaded index buffer", self.layout.name());
                self.index_buffer_updated.emit(&());
                updated = true;
            }
        }

        updated
    }

    /// Upload dirty streams, then bind vertex buffers from `slot`, the index
    /// buffer and the topology.
    ///
    /// Returns `false` when nothing could be bound; the caller should skip
    /// drawing this model for the frame.
    pub fn attach_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        slot: &mut u32,
        resources: &dyn DeviceResources,
    ) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.update_buffers(ctx, resources);
        self.bind_buffers(ctx, slot)
    }

    /// Bind the current buffers without uploading.
    pub fn bind_buffers(&self, ctx: &mut dyn DeviceContext, slot: &mut u32) -> bool {
        {
            let bindings = self.vertex_bindings.read();
            if bindings.len() != self.stream_count {
                log::warn!(
                    "{}: {} vertex buffers but {} bindings, skipping bind",
                    self.layout.name(),
                    self.stream_count,
                    bindings.len()
                );
                return false;
            }
            ctx.set_vertex_buffers(*slot, &bindings);
            *slot += bindings.len() as u32;
        }
        self.bind_index_and_topology(ctx);
        true
    }

    pub(crate) fn bind_index_and_topology(&self, ctx: &mut dyn DeviceContext) {
        let index = self.index_buffer.lock().as_ref().and_then(|b| b.buffer());
        ctx.set_index_buffer(index, self.layout.index_format(), 0);
        ctx.set_primitive_topology(self.layout.topology());
    }

    /// Stop observing the geometry and release every GPU buffer.
    ///
    /// Later update and attach calls do nothing and return `false`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bound) = self.geometry.write().take() {
            if let Some(geometry) = bound.geometry.upgrade() {
                geometry.unsubscribe(bound.subscription);
            }
        }
        for buffer in self.vertex_buffers.lock().iter_mut() {
            buffer.dispose_and_clear();
        }
        if let Some(buffer) = self.index_buffer.lock().as_mut() {
            buffer.dispose_and_clear();
        }
        self.vertex_bindings.write().clear();
        self.layout.on_dispose();
        log::debug!("{}: disposed", self.layout.name());
    }
}

impl<L: BufferLayout> GeometryObserver for GeometryBufferModel<L> {
    fn on_geometry_changed(&self, geometry: &Geometry, property: GeometryProperty) {
        if self.is_disposed() || self.geometry_id() != Some(geometry.id()) {
            return;
        }

        let mut streams = StreamMask::empty();
        if property == GeometryProperty::Positions {
            let count = geometry.vertex_count();
            if self.source_vertex_count.swap(count, Ordering::AcqRel) != count {
                streams = self.layout.vertex_count_streams();
            }
        }
        if let Some(stream) =
            (0..self.stream_count).find(|&stream| self.layout.is_vertex_buffer_changed(property, stream))
        {
            streams.insert(stream);
        }
        let streams = StreamMask::from_bits(streams.bits() & StreamMask::all(self.stream_count).bits());
        if !streams.is_empty() {
            self.vertex_changed.fetch_or(streams.bits(), Ordering::AcqRel);
            self.invalidate_renderer.emit(&());
            return;
        }

        if self.layout.is_index_buffer_changed(property) {
            self.index_changed.store(true, Ordering::Release);
            self.invalidate_renderer.emit(&());
        }
    }
}

impl<L: BufferLayout> Drop for GeometryBufferModel<L> {
    fn drop(&mut self) {
        if let Some(bound) = self.geometry.get_mut().take() {
            if let Some(geometry) = bound.geometry.upgrade() {
                geometry.unsubscribe(bound.subscription);
            }
        }
        self.layout.on_dispose();
    }
}

impl<L: BufferLayout> std::fmt::Debug for GeometryBufferModel<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryBufferModel")
            .field("layout", &self.layout.name())
            .field("geometry", &self.geometry_id())
            .field("vertex_changed", &self.vertex_changed())
            .field("index_changed", &self.index_changed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyContext, DummyDevice, DummyResources};
    use crate::backend::BufferUsage;
    use crate::buffers::BufferAllocation;
    use crate::geometry::GeometryKind;
    use glam::Vec3;

    /// Uploads raw positions and edits the geometry once in the middle of
    /// its first upload, the way a writer on another thread could.
    #[derive(Default)]
    struct EditingLayout {
        edited: AtomicBool,
    }

    impl BufferLayout for EditingLayout {
        fn create(_config: &BufferCacheConfig) -> Self {
            Self::default()
        }

        fn name(&self) -> &'static str {
            "EditingLayout"
        }

        fn topology(&self) -> PrimitiveTopology {
            PrimitiveTopology::PointList
        }

        fn create_vertex_buffers(&self, config: &BufferCacheConfig) -> Vec<ElementsBufferProxy> {
            vec![ElementsBufferProxy::new(
                "EditingLayout.positions",
                std::mem::size_of::<Vec3>() as u32,
                BufferUsage::VERTEX,
                BufferAllocation::Immutable,
                config,
            )]
        }

        fn create_index_buffer(&self, _config: &BufferCacheConfig) -> Option<ElementsBufferProxy> {
            None
        }

        fn on_create_vertex_buffer(
            &self,
            ctx: &dyn DeviceContext,
            buffer: &mut ElementsBufferProxy,
            _stream: usize,
            geometry: Option<&Geometry>,
            _resources: &dyn DeviceResources,
        ) -> BackendResult<()> {
            let positions: Vec<Vec3> = geometry
                .and_then(|g| g.positions())
                .map(|p| p.to_vec())
                .unwrap_or_default();
            if let Some(geometry) = geometry {
                if !self.edited.swap(true, Ordering::SeqCst) {
                    geometry.update_positions(|p| p[0] = Vec3::splat(9.0));
                }
            }
            buffer.upload_data(ctx, &positions)
        }
    }

    #[test]
    fn test_change_during_upload_stays_dirty() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let resources = DummyResources::default();
        let geometry = Geometry::new(GeometryKind::Point);
        geometry.set_positions(Some(Arc::new(vec![Vec3::ZERO, Vec3::X])));
        let model = GeometryBufferModel::<EditingLayout>::new(&BufferCacheConfig::default());
        model.set_geometry(Some(&geometry));

        assert!(model.update_buffers(&mut ctx, &resources));
        assert_eq!(model.vertex_changed(), StreamMask::single(0));
        let gpu = device.read_as::<Vec3>(model.vertex_buffer(0).unwrap()).unwrap();
        assert_eq!(gpu[0], Vec3::ZERO);

        assert!(model.update_buffers(&mut ctx, &resources));
        assert!(model.vertex_changed().is_empty());
        let gpu = device.read_as::<Vec3>(model.vertex_buffer(0).unwrap()).unwrap();
        assert_eq!(gpu[0], Vec3::splat(9.0));
    }

    #[test]
    fn test_stream_mask() {
        let mask = StreamMask::single(1).with(3);
        assert!(mask.contains(1) && mask.contains(3));
        assert!(!mask.contains(0));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(StreamMask::all(MAX_VERTEX_STREAMS).bits(), u32::MAX);
    }
}
