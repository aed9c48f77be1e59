//! Per-instance element buffers (instance transforms, bone matrices, ...).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytemuck::Pod;
use glam::Mat4;
use parking_lot::{Mutex, RwLock};

use super::proxy::{BufferAllocation, ElementsBufferProxy};
use crate::backend::{BufferHandle, BufferUsage, DeviceContext, VertexBufferBinding};
use crate::config::BufferCacheConfig;
use crate::events::EventHandlers;

/// Instance world transforms, one per drawn instance.
pub type InstanceBufferModel = ElementsBufferModel<Mat4>;

/// Bone matrices of a skinned model.
pub type BoneMatricesBufferModel = ElementsBufferModel<Mat4>;

/// A CPU-side element sequence mirrored lazily into one GPU buffer.
///
/// The sequence is replaced as a whole; replacing it marks the model dirty
/// and the next [`attach_buffer`](Self::attach_buffer) uploads it.
pub struct ElementsBufferModel<T> {
    buffer: Mutex<ElementsBufferProxy>,
    elements: RwLock<Option<Arc<Vec<T>>>>,
    changed: AtomicBool,
    has_elements: AtomicBool,
    binding: RwLock<VertexBufferBinding>,
    elements_changed: EventHandlers<()>,
}

impl<T: Pod + Send + Sync> ElementsBufferModel<T> {
    pub fn new(
        label: impl Into<String>,
        usage: BufferUsage,
        allocation: BufferAllocation,
        config: &BufferCacheConfig,
    ) -> Self {
        let buffer = ElementsBufferProxy::new(
            label,
            std::mem::size_of::<T>() as u32,
            usage,
            allocation,
            config,
        );
        Self {
            buffer: Mutex::new(buffer),
            elements: RwLock::new(None),
            changed: AtomicBool::new(true),
            has_elements: AtomicBool::new(false),
            binding: RwLock::new(VertexBufferBinding::default()),
            elements_changed: EventHandlers::new(),
        }
    }

    /// Dynamic vertex-rate buffer, the common case for per-instance data.
    pub fn instance_data(label: impl Into<String>, config: &BufferCacheConfig) -> Self {
        Self::new(label, BufferUsage::VERTEX, BufferAllocation::Dynamic, config)
    }

    /// Replace the element sequence.
    ///
    /// Passing the sequence already held (same `Arc`) does nothing.
    pub fn set_elements(&self, elements: Option<Arc<Vec<T>>>) {
        {
            let mut current = self.elements.write();
            let same = match (&*current, &elements) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            };
            if same {
                return;
            }
            let has = elements.as_ref().is_some_and(|e| !e.is_empty());
            *current = elements;
            self.has_elements.store(has, Ordering::Release);
            self.changed.store(true, Ordering::Release);
        }
        self.elements_changed.emit(&());
    }

    pub fn elements(&self) -> Option<Arc<Vec<T>>> {
        self.elements.read().clone()
    }

    pub fn has_elements(&self) -> bool {
        self.has_elements.load(Ordering::Acquire)
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub fn structure_size(&self) -> u32 {
        std::mem::size_of::<T>() as u32
    }

    /// Number of elements currently on the GPU.
    pub fn element_count(&self) -> usize {
        self.buffer.lock().element_count()
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer.lock().buffer()
    }

    pub fn binding(&self) -> VertexBufferBinding {
        *self.binding.read()
    }

    /// Raised after the element sequence is replaced.
    pub fn on_elements_changed(&self) -> &EventHandlers<()> {
        &self.elements_changed
    }

    /// Upload if dirty, then bind at `slot`.
    ///
    /// `slot` always advances by one so following buffers keep their slot,
    /// even when nothing is bound. Returns whether a buffer was bound.
    pub fn attach_buffer(&self, ctx: &mut dyn DeviceContext, slot: &mut u32) -> bool {
        let has_elements = self.has_elements();
        if has_elements && self.is_changed() {
            let mut buffer = self.buffer.lock();
            if self.changed.swap(false, Ordering::AcqRel) {
                let elements = self.elements.read().clone();
                let data: &[T] = match elements.as_deref() {
                    Some(elements) => elements.as_slice(),
                    None => &[][..],
                };
                match buffer.upload_data(&*ctx, data) {
                    Ok(()) => *self.binding.write() = buffer.binding(),
                    Err(err) => {
                        self.changed.store(true, Ordering::Release);
                        log::warn!(
                            "ElementsBufferModel {}: upload failed: {}",
                            buffer.label(),
                            err
                        );
                    }
                }
            }
        }

        let bound = has_elements && !self.is_changed();
        if bound {
            ctx.set_vertex_buffers(*slot, std::slice::from_ref(&*self.binding.read()));
        }
        *slot += 1;
        bound
    }

    /// Release the GPU buffer. Idempotent.
    pub fn dispose_and_clear(&self) {
        self.buffer.lock().dispose_and_clear();
        *self.binding.write() = VertexBufferBinding::default();
        self.changed.store(true, Ordering::Release);
    }
}

impl<T> std::fmt::Debug for ElementsBufferModel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementsBufferModel")
            .field("has_elements", &self.has_elements.load(Ordering::Relaxed))
            .field("changed", &self.changed.load(Ordering::Relaxed))
            .finish()
    }
}

static_assertions::assert_impl_all!(InstanceBufferModel: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyContext, DummyDevice, RecordedCommand};
    use std::sync::atomic::AtomicUsize;

    fn model() -> InstanceBufferModel {
        InstanceBufferModel::instance_data("instances", &BufferCacheConfig::default())
    }

    #[test]
    fn test_upload_once_then_bind() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let instances = model();
        instances.set_elements(Some(Arc::new(vec![Mat4::IDENTITY; 3])));

        let mut slot = 2;
        assert!(instances.attach_buffer(&mut ctx, &mut slot));
        assert_eq!(slot, 3);
        assert!(!instances.is_changed());
        assert_eq!(instances.element_count(), 3);

        let mut slot = 2;
        instances.attach_buffer(&mut ctx, &mut slot);
        assert_eq!(device.created_count(), 1);
        assert_eq!(device.write_count(), 1);

        let (bound_slot, bindings) = ctx.last_vertex_bindings().unwrap();
        assert_eq!(bound_slot, 2);
        assert_eq!(bindings[0].stride, 64);
    }

    #[test]
    fn test_empty_sequence_binds_nothing_but_advances_slot() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let instances = model();

        instances.set_elements(Some(Arc::new(Vec::new())));
        assert!(!instances.has_elements());

        let mut slot = 0;
        assert!(!instances.attach_buffer(&mut ctx, &mut slot));
        assert_eq!(slot, 1);

        instances.set_elements(None);
        assert!(!instances.has_elements());
        assert!(!instances.attach_buffer(&mut ctx, &mut slot));
        assert_eq!(slot, 2);

        assert!(ctx
            .commands()
            .iter()
            .all(|cmd| !matches!(cmd, RecordedCommand::SetVertexBuffers { .. })));
    }

    #[test]
    fn test_same_reference_is_noop() {
        let instances = model();
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();
        instances.on_elements_changed().subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let data = Arc::new(vec![Mat4::IDENTITY]);
        instances.set_elements(Some(data.clone()));
        instances.set_elements(Some(data));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replacement_reuploads() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let instances = model();

        instances.set_elements(Some(Arc::new(vec![Mat4::IDENTITY])));
        instances.attach_buffer(&mut ctx, &mut 0);
        instances.set_elements(Some(Arc::new(vec![Mat4::ZERO, Mat4::IDENTITY])));
        assert!(instances.is_changed());
        instances.attach_buffer(&mut ctx, &mut 0);

        let gpu = device.read_as::<Mat4>(instances.buffer().unwrap()).unwrap();
        assert_eq!(gpu[0], Mat4::ZERO);
        assert_eq!(gpu[1], Mat4::IDENTITY);
    }

    #[test]
    fn test_failed_upload_retries_on_next_attach() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let instances = model();
        instances.set_elements(Some(Arc::new(vec![Mat4::IDENTITY; 2])));

        device.fail_next_create();
        let mut slot = 0;
        assert!(!instances.attach_buffer(&mut ctx, &mut slot));
        assert_eq!(slot, 1);
        assert!(instances.is_changed());
        assert_eq!(instances.buffer(), None);

        assert!(instances.attach_buffer(&mut ctx, &mut slot));
        assert!(!instances.is_changed());
        assert_eq!(instances.element_count(), 2);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let instances = model();
        instances.set_elements(Some(Arc::new(vec![Mat4::IDENTITY])));
        instances.attach_buffer(&mut ctx, &mut 0);

        instances.dispose_and_clear();
        instances.dispose_and_clear();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(instances.buffer(), None);
    }
}
