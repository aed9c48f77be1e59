//! Common types shared between the buffer models and device backends

use bitflags::bitflags;

/// Handle to a GPU buffer owned by a [`GraphicsDevice`](super::GraphicsDevice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Handle to a GPU texture view resolved through a texture manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        /// Buffer can be bound as vertex input.
        const VERTEX = 1 << 0;
        /// Buffer can be bound as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be bound as a shader resource (structured buffer).
        const STORAGE = 1 << 2;
        /// Buffer can be a stream-output target.
        const STREAM_OUTPUT = 1 << 3;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 4;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 5;
        /// Buffer contents are rewritten from the CPU after creation.
        const DYNAMIC = 1 << 6;
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Size of one element in bytes.
    pub stride: u32,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(size: u64, stride: u32, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            stride,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

/// One vertex-buffer slot as handed to [`DeviceContext::set_vertex_buffers`](super::DeviceContext::set_vertex_buffers).
///
/// A binding without a buffer unbinds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexBufferBinding {
    pub buffer: Option<BufferHandle>,
    pub stride: u32,
    pub offset: u32,
}

impl VertexBufferBinding {
    pub fn new(buffer: Option<BufferHandle>, stride: u32, offset: u32) -> Self {
        Self {
            buffer,
            stride,
            offset,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.buffer.is_some()
    }
}
