//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. Buffers live in host
//! memory and every command issued through [`DummyContext`] is recorded, so
//! tests can inspect what a buffer model uploaded and bound without GPU
//! hardware.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::traits::*;
use super::types::*;

/// Host-side storage for one dummy buffer.
#[derive(Debug, Clone)]
pub struct DummyBuffer {
    pub descriptor: BufferDescriptor,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct DummyDeviceState {
    next_id: u64,
    buffers: HashMap<BufferHandle, DummyBuffer>,
    created: usize,
    destroyed: usize,
    writes: usize,
    pending_failures: usize,
}

/// Dummy device that keeps buffers in host memory.
#[derive(Debug, Default)]
pub struct DummyDevice {
    state: Mutex<DummyDeviceState>,
}

impl DummyDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    /// Number of buffers currently alive.
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Total number of buffers ever created.
    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    /// Total number of buffers destroyed.
    pub fn destroyed_count(&self) -> usize {
        self.state.lock().destroyed
    }

    /// Total number of in-place writes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Make the next buffer creation fail with [`BackendError::OutOfMemory`].
    /// Calls accumulate.
    pub fn fail_next_create(&self) {
        self.state.lock().pending_failures += 1;
    }

    pub fn is_alive(&self, buffer: BufferHandle) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    /// Snapshot of a buffer's descriptor and contents.
    pub fn buffer(&self, buffer: BufferHandle) -> Option<DummyBuffer> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    /// Read a live buffer back as typed elements.
    pub fn read_as<T: bytemuck::Pod>(&self, buffer: BufferHandle) -> Option<Vec<T>> {
        let state = self.state.lock();
        let data = &state.buffers.get(&buffer)?.data;
        Some(bytemuck::pod_collect_to_vec(data))
    }

    fn copy(&self, src: BufferHandle, dst: BufferHandle) {
        let mut state = self.state.lock();
        let Some(source) = state.buffers.get(&src).map(|b| b.data.clone()) else {
            log::warn!("DummyDevice: copy from unknown buffer {:?}", src);
            return;
        };
        match state.buffers.get_mut(&dst) {
            Some(target) => {
                let len = source.len().min(target.data.len());
                target.data[..len].copy_from_slice(&source[..len]);
            }
            None => log::warn!("DummyDevice: copy into unknown buffer {:?}", dst),
        }
    }
}

impl GraphicsDevice for DummyDevice {
    fn create_buffer(
        &self,
        desc: &BufferDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<BufferHandle> {
        {
            let mut state = self.state.lock();
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                log::trace!("DummyBackend: failing creation of {:?}", desc.label);
                return Err(BackendError::OutOfMemory);
            }
        }
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(
                "buffer size cannot be zero".to_string(),
            ));
        }

        let mut contents = vec![0u8; desc.size as usize];
        if let Some(data) = data {
            if data.len() as u64 > desc.size {
                return Err(BackendError::OutOfBounds {
                    offset: 0,
                    len: data.len() as u64,
                    size: desc.size,
                });
            }
            contents[..data.len()].copy_from_slice(data);
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = BufferHandle(state.next_id);
        state.created += 1;
        state.buffers.insert(
            handle,
            DummyBuffer {
                descriptor: desc.clone(),
                data: contents,
            },
        );

        log::trace!(
            "DummyBackend: creating buffer {:?} {:?} (size: {})",
            handle,
            desc.label,
            desc.size
        );
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let target = state
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::UnknownBuffer(buffer))?;

        let end = offset + data.len() as u64;
        if end > target.data.len() as u64 {
            return Err(BackendError::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: target.data.len() as u64,
            });
        }
        target.data[offset as usize..end as usize].copy_from_slice(data);
        state.writes += 1;

        log::trace!(
            "DummyBackend: write_buffer {:?} offset={} len={}",
            buffer,
            offset,
            data.len()
        );
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.destroyed += 1;
            log::trace!("DummyBackend: destroyed buffer {:?}", buffer);
        } else {
            log::warn!("DummyBackend: destroy of unknown buffer {:?}", buffer);
        }
    }
}

/// A command recorded by [`DummyContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    SetVertexBuffers {
        slot: u32,
        bindings: Vec<VertexBufferBinding>,
    },
    SetIndexBuffer {
        buffer: Option<BufferHandle>,
        format: IndexFormat,
        offset: u32,
    },
    SetPrimitiveTopology(PrimitiveTopology),
    CopyResource {
        src: BufferHandle,
        dst: BufferHandle,
    },
    SetStreamOutputTarget {
        buffer: Option<BufferHandle>,
        offset: u32,
    },
}

/// Dummy command context recording every call.
pub struct DummyContext {
    device: Arc<DummyDevice>,
    commands: Vec<RecordedCommand>,
}

impl DummyContext {
    pub fn new(device: Arc<DummyDevice>) -> Self {
        Self {
            device,
            commands: Vec::new(),
        }
    }

    pub fn dummy_device(&self) -> &Arc<DummyDevice> {
        &self.device
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Take the recorded commands, leaving the log empty.
    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// The vertex bindings of the most recent `set_vertex_buffers` call.
    pub fn last_vertex_bindings(&self) -> Option<(u32, &[VertexBufferBinding])> {
        self.commands.iter().rev().find_map(|cmd| match cmd {
            RecordedCommand::SetVertexBuffers { slot, bindings } => {
                Some((*slot, bindings.as_slice()))
            }
            _ => None,
        })
    }
}

impl DeviceContext for DummyContext {
    fn device(&self) -> Arc<dyn GraphicsDevice> {
        self.device.clone()
    }

    fn set_vertex_buffers(&mut self, slot: u32, bindings: &[VertexBufferBinding]) {
        log::trace!(
            "DummyContext: set_vertex_buffers slot={} count={}",
            slot,
            bindings.len()
        );
        self.commands.push(RecordedCommand::SetVertexBuffers {
            slot,
            bindings: bindings.to_vec(),
        });
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferHandle>, format: IndexFormat, offset: u32) {
        self.commands.push(RecordedCommand::SetIndexBuffer {
            buffer,
            format,
            offset,
        });
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.commands
            .push(RecordedCommand::SetPrimitiveTopology(topology));
    }

    fn copy_resource(&mut self, src: BufferHandle, dst: BufferHandle) {
        self.device.copy(src, dst);
        self.commands.push(RecordedCommand::CopyResource { src, dst });
    }

    fn set_stream_output_target(&mut self, buffer: Option<BufferHandle>, offset: u32) {
        self.commands
            .push(RecordedCommand::SetStreamOutputTarget { buffer, offset });
    }
}

#[derive(Debug, Default)]
struct DummyTextureState {
    next_id: u64,
    textures: HashMap<String, (TextureHandle, usize)>,
}

/// Texture manager handing out one handle per key with a retain count.
#[derive(Debug, Default)]
pub struct DummyTextureManager {
    state: Mutex<DummyTextureState>,
}

impl DummyTextureManager {
    /// Number of outstanding retentions of `key`.
    pub fn retain_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .textures
            .get(key)
            .map_or(0, |(_, count)| *count)
    }
}

impl TextureManager for DummyTextureManager {
    fn acquire(&self, key: &str) -> Option<TextureHandle> {
        let mut state = self.state.lock();
        if let Some((handle, count)) = state.textures.get_mut(key) {
            *count += 1;
            return Some(*handle);
        }
        state.next_id += 1;
        let handle = TextureHandle(state.next_id);
        state.textures.insert(key.to_string(), (handle, 1));
        Some(handle)
    }

    fn release(&self, texture: TextureHandle) {
        let mut state = self.state.lock();
        state.textures.retain(|_, (handle, count)| {
            if *handle == texture {
                *count = count.saturating_sub(1);
            }
            *count > 0
        });
    }
}

/// Device resources backed by a [`DummyTextureManager`].
#[derive(Debug, Default)]
pub struct DummyResources {
    pub textures: Arc<DummyTextureManager>,
}

impl DeviceResources for DummyResources {
    fn texture_manager(&self) -> Option<Arc<dyn TextureManager>> {
        Some(self.textures.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_destroy() {
        let device = DummyDevice::new();
        let desc = BufferDescriptor::new(8, 4, BufferUsage::VERTEX);
        let handle = device
            .create_buffer(&desc, Some(&[1, 2, 3, 4]))
            .unwrap();
        device.write_buffer(handle, 4, &[5, 6, 7, 8]).unwrap();
        assert_eq!(device.buffer(handle).unwrap().data, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        device.destroy_buffer(handle);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.destroyed_count(), 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = DummyDevice::new();
        let desc = BufferDescriptor::new(0, 4, BufferUsage::VERTEX);
        assert!(device.create_buffer(&desc, None).is_err());
    }

    #[test]
    fn test_injected_create_failure() {
        let device = DummyDevice::new();
        let desc = BufferDescriptor::new(4, 4, BufferUsage::VERTEX);
        device.fail_next_create();
        assert_eq!(device.create_buffer(&desc, None), Err(BackendError::OutOfMemory));
        assert!(device.create_buffer(&desc, None).is_ok());
        assert_eq!(device.created_count(), 1);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let device = DummyDevice::new();
        let handle = device
            .create_buffer(&BufferDescriptor::new(4, 4, BufferUsage::VERTEX), None)
            .unwrap();
        let err = device.write_buffer(handle, 2, &[0; 4]).unwrap_err();
        assert_eq!(
            err,
            BackendError::OutOfBounds {
                offset: 2,
                len: 4,
                size: 4
            }
        );
    }

    #[test]
    fn test_context_copy_resource() {
        let device = DummyDevice::new();
        let desc = BufferDescriptor::new(4, 4, BufferUsage::VERTEX);
        let src = device.create_buffer(&desc, Some(&[9, 9, 9, 9])).unwrap();
        let dst = device.create_buffer(&desc, None).unwrap();

        let mut ctx = DummyContext::new(device.clone());
        ctx.copy_resource(src, dst);
        assert_eq!(device.buffer(dst).unwrap().data, vec![9, 9, 9, 9]);
        assert_eq!(ctx.commands().len(), 1);
    }

    #[test]
    fn test_texture_manager_retains_by_key() {
        let textures = DummyTextureManager::default();
        let a = textures.acquire("atlas").unwrap();
        let b = textures.acquire("atlas").unwrap();
        assert_eq!(a, b);
        assert_eq!(textures.retain_count("atlas"), 2);
        textures.release(a);
        textures.release(b);
        assert_eq!(textures.retain_count("atlas"), 0);
    }
}
