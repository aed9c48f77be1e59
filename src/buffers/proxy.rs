//! A single GPU buffer holding a run of equally sized elements.

use std::sync::Arc;

use bytemuck::Pod;

use crate::backend::{
    BackendError, BackendResult, BufferDescriptor, BufferHandle, BufferUsage, DeviceContext,
    GraphicsDevice, VertexBufferBinding,
};
use crate::config::BufferCacheConfig;

/// How an [`ElementsBufferProxy`] allocates GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferAllocation {
    /// A new buffer is created for every upload.
    #[default]
    Immutable,
    /// The buffer is written in place while the capacity suffices.
    Dynamic,
}

/// Owner of one GPU buffer and its element bookkeeping.
///
/// The buffer is released on [`dispose_and_clear`](Self::dispose_and_clear)
/// or drop, through the device that created it.
pub struct ElementsBufferProxy {
    label: String,
    structure_size: u32,
    offset: u32,
    usage: BufferUsage,
    allocation: BufferAllocation,
    config: BufferCacheConfig,
    element_count: usize,
    capacity: usize,
    buffer: Option<(Arc<dyn GraphicsDevice>, BufferHandle)>,
}

impl ElementsBufferProxy {
    pub fn new(
        label: impl Into<String>,
        structure_size: u32,
        usage: BufferUsage,
        allocation: BufferAllocation,
        config: &BufferCacheConfig,
    ) -> Self {
        let usage = match allocation {
            BufferAllocation::Immutable => usage,
            BufferAllocation::Dynamic => usage | BufferUsage::DYNAMIC,
        };
        Self {
            label: label.into(),
            structure_size,
            offset: 0,
            usage,
            allocation,
            config: config.clone(),
            element_count: 0,
            capacity: 0,
            buffer: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn structure_size(&self) -> u32 {
        self.structure_size
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn allocation(&self) -> BufferAllocation {
        self.allocation
    }

    /// The GPU buffer, if one is allocated.
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer.as_ref().map(|(_, handle)| *handle)
    }

    /// Vertex binding for this buffer (unbound when empty).
    pub fn binding(&self) -> VertexBufferBinding {
        VertexBufferBinding::new(self.buffer(), self.structure_size, self.offset)
    }

    /// Replace the buffer contents with `data`.
    pub fn upload_data<T: Pod>(&mut self, ctx: &dyn DeviceContext, data: &[T]) -> BackendResult<()> {
        self.upload_data_at(ctx, data, data.len(), 0, 0)
    }

    /// Upload `count` elements of `data` starting at `src_offset`, writing them
    /// at element `dest_offset` of the buffer.
    ///
    /// A zero count releases the GPU buffer so the element count always
    /// matches the source. Partial writes (`dest_offset > 0`) require
    /// dynamic allocation and never shrink the element count.
    pub fn upload_data_at<T: Pod>(
        &mut self,
        ctx: &dyn DeviceContext,
        data: &[T],
        count: usize,
        dest_offset: usize,
        src_offset: usize,
    ) -> BackendResult<()> {
        debug_assert_eq!(
            std::mem::size_of::<T>(),
            self.structure_size as usize,
            "element type does not match structure size of {}",
            self.label
        );

        let count = count.min(data.len().saturating_sub(src_offset));
        if count == 0 && dest_offset == 0 {
            log::trace!("ElementsBufferProxy {}: empty upload", self.label);
            self.dispose_and_clear();
            return Ok(());
        }
        if count == 0 {
            return Ok(());
        }

        let bytes: &[u8] = bytemuck::cast_slice(&data[src_offset..src_offset + count]);
        let device = ctx.device();
        match self.allocation {
            BufferAllocation::Immutable => {
                if dest_offset != 0 {
                    return Err(BackendError::BufferWriteFailed(format!(
                        "{}: immutable buffers only accept full uploads",
                        self.label
                    )));
                }
                let handle = device.create_buffer(&self.descriptor(count), Some(bytes))?;
                self.replace_buffer(device, handle, count);
            }
            BufferAllocation::Dynamic => {
                let required = dest_offset + count;
                let stride = self.structure_size as u64;
                let reusable = match &self.buffer {
                    Some((owner, handle)) if required <= self.capacity && same_device(owner, &device) => {
                        Some(*handle)
                    }
                    _ => None,
                };
                match reusable {
                    Some(handle) => device.write_buffer(handle, dest_offset as u64 * stride, bytes)?,
                    None => {
                        let capacity = self.config.dynamic_capacity(required);
                        let handle = device.create_buffer(&self.descriptor(capacity), None)?;
                        if let Err(err) = device.write_buffer(handle, dest_offset as u64 * stride, bytes) {
                            device.destroy_buffer(handle);
                            return Err(err);
                        }
                        self.replace_buffer(device, handle, capacity);
                    }
                }
                self.element_count = if dest_offset == 0 {
                    required
                } else {
                    self.element_count.max(required)
                };
                return Ok(());
            }
        }
        self.element_count = count;
        Ok(())
    }

    /// Adopt a buffer created elsewhere on `device`.
    pub(crate) fn adopt(
        &mut self,
        device: Arc<dyn GraphicsDevice>,
        handle: BufferHandle,
        element_count: usize,
    ) {
        self.replace_buffer(device, handle, element_count);
        self.element_count = element_count;
    }

    /// Release the GPU buffer. Idempotent.
    pub fn dispose_and_clear(&mut self) {
        if let Some((device, handle)) = self.buffer.take() {
            log::trace!("ElementsBufferProxy {}: releasing {:?}", self.label, handle);
            device.destroy_buffer(handle);
        }
        self.element_count = 0;
        self.capacity = 0;
    }

    fn descriptor(&self, elements: usize) -> BufferDescriptor {
        let desc = BufferDescriptor::new(
            elements as u64 * self.structure_size as u64,
            self.structure_size,
            self.usage,
        );
        if self.config.label_buffers {
            desc.with_label(self.label.clone())
        } else {
            desc
        }
    }

    fn replace_buffer(&mut self, device: Arc<dyn GraphicsDevice>, handle: BufferHandle, capacity: usize) {
        if let Some((old_device, old)) = self.buffer.replace((device, handle)) {
            old_device.destroy_buffer(old);
        }
        self.capacity = capacity;
    }
}

fn same_device(a: &Arc<dyn GraphicsDevice>, b: &Arc<dyn GraphicsDevice>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Drop for ElementsBufferProxy {
    fn drop(&mut self) {
        self.dispose_and_clear();
    }
}

impl std::fmt::Debug for ElementsBufferProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementsBufferProxy")
            .field("label", &self.label)
            .field("structure_size", &self.structure_size)
            .field("allocation", &self.allocation)
            .field("element_count", &self.element_count)
            .field("buffer", &self.buffer())
            .finish()
    }
}

static_assertions::assert_impl_all!(ElementsBufferProxy: Send, Sync);
