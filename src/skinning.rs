//! GPU skinning pre-pass on top of a shared bone-skin mesh buffer.
//!
//! The mesh buffer is shared through the [`GeometryBufferManager`]; the
//! skinned output buffer is owned per instance, since each instance is posed
//! differently. For rendering, slot 0 of the mesh bindings is replaced by the
//! skinned buffer. For the skin pass, the original vertex buffer and the bone
//! id buffer are bound as inputs and the skinned buffer as stream output.
//!
//! [`GeometryBufferManager`]: crate::manager::GeometryBufferManager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, DeviceContext, DeviceResources,
    VertexBufferBinding,
};
use crate::buffers::{
    BoneMatricesBufferModel, BoneSkinMeshBufferModel, BufferAllocation, ElementsBufferProxy,
    BONE_ID_STREAM, MESH_VERTEX_STREAM,
};
use crate::config::BufferCacheConfig;
use crate::events::HandlerId;
use crate::manager::{GeometryBufferProxy, ManagedBufferModel};

/// A mesh buffer model that carries per-vertex bone ids.
pub trait BoneSkinMeshBuffer: ManagedBufferModel {
    fn update_mesh_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        resources: &dyn DeviceResources,
    ) -> bool;

    fn mesh_stream_count(&self) -> usize;

    /// Bindings of every stream as of the last upload
    fn mesh_vertex_bindings(&self) -> Vec<VertexBufferBinding>;

    /// Element count of the un-skinned vertex stream
    fn source_vertex_count(&self) -> usize;

    fn bone_id_binding(&self) -> VertexBufferBinding;

    fn bind_index_and_topology(&self, ctx: &mut dyn DeviceContext);

    /// Called after the un-skinned vertex stream was uploaded
    fn subscribe_vertex_buffer_updated(
        &self,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> HandlerId;

    /// Called after the bone id stream was uploaded
    fn subscribe_bone_ids_updated(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId;

    fn unsubscribe(&self, id: HandlerId) -> bool;
}

impl BoneSkinMeshBuffer for BoneSkinMeshBufferModel {
    fn update_mesh_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        resources: &dyn DeviceResources,
    ) -> bool {
        self.update_buffers(ctx, resources)
    }

    fn mesh_stream_count(&self) -> usize {
        self.stream_count()
    }

    fn mesh_vertex_bindings(&self) -> Vec<VertexBufferBinding> {
        self.vertex_bindings()
    }

    fn source_vertex_count(&self) -> usize {
        self.vertex_count(MESH_VERTEX_STREAM)
    }

    fn bone_id_binding(&self) -> VertexBufferBinding {
        self.vertex_bindings()
            .get(BONE_ID_STREAM)
            .copied()
            .unwrap_or_default()
    }

    fn bind_index_and_topology(&self, ctx: &mut dyn DeviceContext) {
        BoneSkinMeshBufferModel::bind_index_and_topology(self, ctx);
    }

    fn subscribe_vertex_buffer_updated(
        &self,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> HandlerId {
        self.on_vertex_buffers_updated().subscribe(move |streams| {
            if streams.contains(MESH_VERTEX_STREAM) {
                handler();
            }
        })
    }

    fn subscribe_bone_ids_updated(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.on_vertex_buffers_updated().subscribe(move |streams| {
            if streams.contains(BONE_ID_STREAM) {
                handler();
            }
        })
    }

    fn unsubscribe(&self, id: HandlerId) -> bool {
        self.on_vertex_buffers_updated().unsubscribe(id)
    }
}

#[derive(Default)]
struct SkinState {
    skinned: Option<ElementsBufferProxy>,
    render_bindings: Vec<VertexBufferBinding>,
}

/// Per-instance skinned vertex buffer fed by a shared bone-skin mesh.
pub struct BoneSkinPreComputeBufferModel<M: BoneSkinMeshBuffer = BoneSkinMeshBufferModel> {
    mesh: GeometryBufferProxy<M>,
    subscriptions: Vec<HandlerId>,
    bone_matrices: BoneMatricesBufferModel,
    config: BufferCacheConfig,
    rebuild: AtomicBool,
    state: Mutex<SkinState>,
    /// Original vertex buffer and bone ids, the skin pass inputs
    skin_inputs: RwLock<[VertexBufferBinding; 2]>,
}

impl<M: BoneSkinMeshBuffer> BoneSkinPreComputeBufferModel<M> {
    pub fn new(mesh: GeometryBufferProxy<M>, config: &BufferCacheConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let mut subscriptions = Vec::new();
            if let Some(model) = mesh.buffer_model() {
                let this = weak_self.clone();
                subscriptions.push(model.subscribe_vertex_buffer_updated(move || {
                    if let Some(this) = this.upgrade() {
                        this.rebuild.store(true, Ordering::Release);
                    }
                }));
                let this = weak_self.clone();
                subscriptions.push(model.subscribe_bone_ids_updated(move || {
                    if let Some(this) = this.upgrade() {
                        this.update_skin_inputs();
                    }
                }));
            }
            Self {
                mesh,
                subscriptions,
                bone_matrices: BoneMatricesBufferModel::instance_data(
                    "BoneSkinPreCompute.bones",
                    config,
                ),
                config: config.clone(),
                rebuild: AtomicBool::new(true),
                state: Mutex::new(SkinState::default()),
                skin_inputs: RwLock::new([VertexBufferBinding::default(); 2]),
            }
        })
    }

    /// The shared mesh buffer proxy.
    pub fn mesh(&self) -> &GeometryBufferProxy<M> {
        &self.mesh
    }

    /// Per-instance bone matrices consumed by the skin pass.
    pub fn bone_matrices(&self) -> &BoneMatricesBufferModel {
        &self.bone_matrices
    }

    pub fn skinned_vertex_buffer(&self) -> Option<BufferHandle> {
        self.state.lock().skinned.as_ref().and_then(|b| b.buffer())
    }

    pub fn skin_inputs(&self) -> [VertexBufferBinding; 2] {
        *self.skin_inputs.read()
    }

    fn update_skin_inputs(&self) {
        let Some(mesh) = self.mesh.buffer_model() else {
            return;
        };
        let source = mesh
            .mesh_vertex_bindings()
            .get(MESH_VERTEX_STREAM)
            .copied()
            .unwrap_or_default();
        *self.skin_inputs.write() = [source, mesh.bone_id_binding()];
    }

    /// Update the shared mesh, then rebuild the skinned buffer and bindings
    /// if the mesh vertices changed. Returns whether anything changed.
    pub fn update_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        resources: &dyn DeviceResources,
    ) -> bool {
        let Some(mesh) = self.mesh.buffer_model() else {
            return false;
        };
        let changed = mesh.update_mesh_buffers(ctx, resources);
        if !changed && !self.rebuild.load(Ordering::Acquire) {
            return false;
        }

        let mut state = self.state.lock();
        if !self.rebuild.swap(false, Ordering::AcqRel) && !changed {
            return false;
        }

        let mut bindings = mesh.mesh_vertex_bindings();
        let Some(source) = bindings.get(MESH_VERTEX_STREAM).copied() else {
            // Mesh not uploaded yet.
            self.rebuild.store(true, Ordering::Release);
            return changed;
        };

        match source.buffer {
            None => {
                if let Some(skinned) = state.skinned.as_mut() {
                    skinned.dispose_and_clear();
                }
            }
            Some(source_buffer) => {
                let count = mesh.source_vertex_count();
                let skinned = state.skinned.get_or_insert_with(|| {
                    ElementsBufferProxy::new(
                        "BoneSkinPreCompute.skinned",
                        source.stride,
                        BufferUsage::VERTEX | BufferUsage::STREAM_OUTPUT | BufferUsage::COPY_DST,
                        BufferAllocation::Immutable,
                        &self.config,
                    )
                });
                if skinned.buffer().is_none() || skinned.element_count() != count {
                    let device = ctx.device();
                    let mut desc = BufferDescriptor::new(
                        count as u64 * source.stride as u64,
                        source.stride,
                        skinned.usage(),
                    );
                    if self.config.label_buffers {
                        desc = desc.with_label(skinned.label());
                    }
                    match device.create_buffer(&desc, None) {
                        Ok(handle) => {
                            skinned.adopt(device, handle, count);
                            ctx.copy_resource(source_buffer, handle);
                            log::trace!(
                                "BoneSkinPreCompute: skinned buffer {:?} holds {} vertices",
                                handle,
                                count
                            );
                        }
                        Err(err) => {
                            log::warn!("BoneSkinPreCompute: skinned buffer creation failed: {}", err);
                            self.rebuild.store(true, Ordering::Release);
                            return changed;
                        }
                    }
                }
            }
        }

        if let Some(slot0) = bindings.get_mut(MESH_VERTEX_STREAM) {
            *slot0 = state
                .skinned
                .as_ref()
                .map(|skinned| skinned.binding())
                .unwrap_or_default();
        }
        state.render_bindings = bindings;
        drop(state);

        self.update_skin_inputs();
        true
    }

    /// Update, then bind the skinned vertex streams, index buffer and
    /// topology for rendering.
    pub fn attach_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        slot: &mut u32,
        resources: &dyn DeviceResources,
    ) -> bool {
        let Some(mesh) = self.mesh.buffer_model() else {
            return false;
        };
        self.update_buffers(ctx, resources);
        {
            let state = self.state.lock();
            if state.render_bindings.len() != mesh.mesh_stream_count() {
                log::warn!(
                    "BoneSkinPreCompute: {} vertex streams but {} bindings, skipping bind",
                    mesh.mesh_stream_count(),
                    state.render_bindings.len()
                );
                return false;
            }
            ctx.set_vertex_buffers(*slot, &state.render_bindings);
            *slot += state.render_bindings.len() as u32;
        }
        mesh.bind_index_and_topology(ctx);
        true
    }

    /// Bind the original vertices, the bone ids and the bone matrices as skin
    /// pass inputs, in that slot order.
    ///
    /// The bone matrices are uploaded first if they changed. Returns `false`
    /// when the mesh is not uploaded or no bone matrices are set; the skin
    /// pass should be skipped then.
    pub fn bind_skin_compute_inputs(&self, ctx: &mut dyn DeviceContext, slot: &mut u32) -> bool {
        let inputs = self.skin_inputs();
        if !inputs.iter().all(VertexBufferBinding::is_bound) {
            return false;
        }
        ctx.set_vertex_buffers(*slot, &inputs);
        *slot += inputs.len() as u32;
        self.bone_matrices.attach_buffer(ctx, slot)
    }

    /// Make the skinned buffer the stream-output target.
    pub fn bind_skinned_vertex_buffer_to_output(&self, ctx: &mut dyn DeviceContext) -> bool {
        match self.skinned_vertex_buffer() {
            Some(buffer) => {
                ctx.set_stream_output_target(Some(buffer), 0);
                true
            }
            None => false,
        }
    }

    pub fn unbind_skinned_vertex_buffer_from_output(&self, ctx: &mut dyn DeviceContext) {
        ctx.set_stream_output_target(None, 0);
    }

    /// Re-seed the skinned buffer with the un-skinned vertices.
    pub fn reset_skinned_vertex_buffer(&self, ctx: &mut dyn DeviceContext) -> bool {
        let source = self.skin_inputs()[0].buffer;
        match (source, self.skinned_vertex_buffer()) {
            (Some(source), Some(skinned)) => {
                ctx.copy_resource(source, skinned);
                true
            }
            _ => false,
        }
    }

    /// Release the skinned buffer and bone matrices. The shared mesh is
    /// released when this model is dropped.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if let Some(skinned) = state.skinned.as_mut() {
            skinned.dispose_and_clear();
        }
        state.render_bindings.clear();
        drop(state);
        self.bone_matrices.dispose_and_clear();
        *self.skin_inputs.write() = [VertexBufferBinding::default(); 2];
        self.rebuild.store(true, Ordering::Release);
    }
}

impl<M: BoneSkinMeshBuffer> Drop for BoneSkinPreComputeBufferModel<M> {
    fn drop(&mut self) {
        if let Some(mesh) = self.mesh.buffer_model() {
            for id in &self.subscriptions {
                mesh.unsubscribe(*id);
            }
        }
    }
}

impl<M: BoneSkinMeshBuffer> std::fmt::Debug for BoneSkinPreComputeBufferModel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoneSkinPreComputeBufferModel")
            .field("mesh", &self.mesh)
            .field("skinned", &self.skinned_vertex_buffer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyContext, DummyDevice, DummyResources, RecordedCommand};
    use crate::buffers::MeshVertex;
    use crate::geometry::{BoneIds, Geometry, GeometryKind, ModelId};
    use crate::manager::GeometryBufferManager;
    use glam::{Mat4, Vec3};

    fn skinned_triangle() -> Arc<Geometry> {
        let geometry = Geometry::new(GeometryKind::Mesh);
        geometry.set_positions(Some(Arc::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y])));
        geometry.set_indices(Some(Arc::new(vec![0, 1, 2])));
        geometry.set_bone_ids(Some(Arc::new(vec![BoneIds::single(0); 3])));
        geometry
    }

    struct Harness {
        device: Arc<DummyDevice>,
        ctx: DummyContext,
        resources: DummyResources,
        manager: GeometryBufferManager,
    }

    fn harness() -> Harness {
        let device = DummyDevice::new();
        Harness {
            ctx: DummyContext::new(device.clone()),
            device,
            resources: DummyResources::default(),
            manager: GeometryBufferManager::default(),
        }
    }

    fn precompute(h: &Harness, geometry: &Arc<Geometry>) -> Arc<BoneSkinPreComputeBufferModel> {
        let mesh = h
            .manager
            .register::<BoneSkinMeshBufferModel>(ModelId::new(), Some(geometry));
        BoneSkinPreComputeBufferModel::new(mesh, h.manager.config())
    }

    #[test]
    fn test_skinned_buffer_replaces_slot_zero() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let skin = precompute(&h, &geometry);

        let mut slot = 0;
        assert!(skin.attach_buffers(&mut h.ctx, &mut slot, &h.resources));
        assert_eq!(slot, 4);

        let skinned = skin.skinned_vertex_buffer().unwrap();
        let original = skin.mesh().buffer_model().unwrap().vertex_buffer(MESH_VERTEX_STREAM);
        assert_ne!(Some(skinned), original);

        let (_, bindings) = h.ctx.last_vertex_bindings().unwrap();
        assert_eq!(bindings[0].buffer, Some(skinned));
        assert_eq!(
            h.device.read_as::<MeshVertex>(skinned).unwrap(),
            h.device.read_as::<MeshVertex>(original.unwrap()).unwrap()
        );
    }

    #[test]
    fn test_skin_inputs_follow_bone_ids() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let skin = precompute(&h, &geometry);
        skin.update_buffers(&mut h.ctx, &h.resources);

        let mesh = skin.mesh().buffer_model().unwrap().clone();
        let inputs = skin.skin_inputs();
        assert_eq!(inputs[0].buffer, mesh.vertex_buffer(MESH_VERTEX_STREAM));
        assert_eq!(inputs[1].buffer, mesh.vertex_buffer(BONE_ID_STREAM));

        geometry.set_bone_ids(Some(Arc::new(vec![BoneIds::single(1); 3])));
        skin.update_buffers(&mut h.ctx, &h.resources);
        assert_eq!(skin.skin_inputs()[1].buffer, mesh.vertex_buffer(BONE_ID_STREAM));

        skin.bone_matrices()
            .set_elements(Some(Arc::new(vec![Mat4::IDENTITY; 2])));
        let mut slot = 0;
        assert!(skin.bind_skin_compute_inputs(&mut h.ctx, &mut slot));
        assert_eq!(slot, 3);
    }

    #[test]
    fn test_skin_inputs_bind_bone_matrices() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let skin = precompute(&h, &geometry);
        skin.update_buffers(&mut h.ctx, &h.resources);

        let mut slot = 0;
        assert!(!skin.bind_skin_compute_inputs(&mut h.ctx, &mut slot));
        assert_eq!(slot, 3);

        skin.bone_matrices()
            .set_elements(Some(Arc::new(vec![Mat4::IDENTITY; 4])));
        h.ctx.take_commands();
        let mut slot = 1;
        assert!(skin.bind_skin_compute_inputs(&mut h.ctx, &mut slot));
        assert_eq!(skin.bone_matrices().element_count(), 4);

        let (bone_slot, bindings) = h.ctx.last_vertex_bindings().unwrap();
        assert_eq!(bone_slot, 3);
        assert_eq!(bindings[0].buffer, skin.bone_matrices().buffer());
    }

    #[test]
    fn test_resized_positions_resize_bone_ids() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let skin = precompute(&h, &geometry);
        skin.update_buffers(&mut h.ctx, &h.resources);

        geometry.update_positions(|p| p.extend([Vec3::ONE, Vec3::NEG_ONE]));
        assert!(skin.update_buffers(&mut h.ctx, &h.resources));

        let mesh = skin.mesh().buffer_model().unwrap();
        assert_eq!(mesh.vertex_count(MESH_VERTEX_STREAM), 5);
        assert_eq!(mesh.vertex_count(BONE_ID_STREAM), 5);
        assert_eq!(skin.skin_inputs()[1].buffer, mesh.vertex_buffer(BONE_ID_STREAM));
    }

    #[test]
    fn test_skinned_buffer_reallocates_only_on_resize() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let skin = precompute(&h, &geometry);
        skin.update_buffers(&mut h.ctx, &h.resources);
        let first = skin.skinned_vertex_buffer().unwrap();

        geometry.update_positions(|p| p[0] = Vec3::Z);
        assert!(skin.update_buffers(&mut h.ctx, &h.resources));
        assert_eq!(skin.skinned_vertex_buffer(), Some(first));

        geometry.update_positions(|p| p.push(Vec3::ONE));
        assert!(skin.update_buffers(&mut h.ctx, &h.resources));
        assert_ne!(skin.skinned_vertex_buffer(), Some(first));
        assert!(!h.device.is_alive(first));
    }

    #[test]
    fn test_stream_output_toggle_and_reset() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let skin = precompute(&h, &geometry);
        assert!(!skin.bind_skinned_vertex_buffer_to_output(&mut h.ctx));

        skin.update_buffers(&mut h.ctx, &h.resources);
        h.ctx.take_commands();

        assert!(skin.bind_skinned_vertex_buffer_to_output(&mut h.ctx));
        skin.unbind_skinned_vertex_buffer_from_output(&mut h.ctx);
        assert!(skin.reset_skinned_vertex_buffer(&mut h.ctx));

        let skinned = skin.skinned_vertex_buffer();
        let commands = h.ctx.take_commands();
        assert_eq!(
            commands[0],
            RecordedCommand::SetStreamOutputTarget {
                buffer: skinned,
                offset: 0
            }
        );
        assert_eq!(
            commands[1],
            RecordedCommand::SetStreamOutputTarget {
                buffer: None,
                offset: 0
            }
        );
        assert!(matches!(commands[2], RecordedCommand::CopyResource { .. }));
    }

    #[test]
    fn test_shared_mesh_released_with_last_instance() {
        let mut h = harness();
        let geometry = skinned_triangle();
        let a = precompute(&h, &geometry);
        let b = precompute(&h, &geometry);
        assert!(Arc::ptr_eq(
            a.mesh().buffer_model().unwrap(),
            b.mesh().buffer_model().unwrap()
        ));

        a.update_buffers(&mut h.ctx, &h.resources);
        // The shared mesh is already clean, but b still needs its own buffer.
        assert!(b.update_buffers(&mut h.ctx, &h.resources));
        assert_ne!(a.skinned_vertex_buffer(), b.skinned_vertex_buffer());

        drop(a);
        assert_eq!(h.manager.len(), 1);
        drop(b);
        assert!(h.manager.is_empty());
        assert_eq!(h.device.live_buffer_count(), 0);
    }

    #[test]
    fn test_empty_proxy_is_inert() {
        let mut h = harness();
        let skin = BoneSkinPreComputeBufferModel::<BoneSkinMeshBufferModel>::new(
            GeometryBufferProxy::empty(),
            &BufferCacheConfig::default(),
        );
        assert!(!skin.update_buffers(&mut h.ctx, &h.resources));
        assert!(!skin.attach_buffers(&mut h.ctx, &mut 0, &h.resources));
        assert!(h.ctx.commands().is_empty());
    }
}
