//! Core backend abstraction traits
//!
//! These traits are the narrow seam between the buffer models and a native
//! graphics API. Buffer models never talk to the API directly: resources are
//! created through a [`GraphicsDevice`] and commands are issued through a
//! [`DeviceContext`].

use std::sync::Arc;

use thiserror::Error;

use crate::backend::types::*;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to write buffer: {0}")]
    BufferWriteFailed(String),
    #[error("Unknown buffer handle {0:?}")]
    UnknownBuffer(BufferHandle),
    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Resource-creating half of the native device.
///
/// Buffers are released through [`GraphicsDevice::destroy_buffer`], which does
/// not require a command context so that teardown can happen from any thread.
pub trait GraphicsDevice: Send + Sync {
    /// Create a buffer, optionally filled with initial data
    fn create_buffer(
        &self,
        desc: &BufferDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<BufferHandle>;

    /// Overwrite part of a buffer
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Release a buffer
    fn destroy_buffer(&self, buffer: BufferHandle);
}

/// Command-issuing half of the native device.
pub trait DeviceContext {
    /// The device that owns resources used with this context
    fn device(&self) -> Arc<dyn GraphicsDevice>;

    /// Bind a contiguous run of vertex buffers starting at `slot`
    fn set_vertex_buffers(&mut self, slot: u32, bindings: &[VertexBufferBinding]);

    /// Bind the index buffer, or unbind it with `None`
    fn set_index_buffer(&mut self, buffer: Option<BufferHandle>, format: IndexFormat, offset: u32);

    /// Set the primitive topology for following draws
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);

    /// Copy the whole contents of `src` into `dst`
    fn copy_resource(&mut self, src: BufferHandle, dst: BufferHandle);

    /// Set the stream-output target, or clear it with `None`
    fn set_stream_output_target(&mut self, buffer: Option<BufferHandle>, offset: u32);
}

/// Shared texture cache consulted by billboard buffers.
pub trait TextureManager: Send + Sync {
    /// Resolve (and retain) the texture registered under `key`
    fn acquire(&self, key: &str) -> Option<TextureHandle>;

    /// Drop one retention taken with [`TextureManager::acquire`]
    fn release(&self, texture: TextureHandle);
}

/// Provider of device-wide shared managers.
pub trait DeviceResources {
    fn texture_manager(&self) -> Option<Arc<dyn TextureManager>>;
}
