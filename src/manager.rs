//! Shared geometry buffer cache.
//!
//! A [`GeometryBufferManager`] maps `(buffer model type, geometry id)` to a
//! [`GeometryBufferContainer`] holding one shared buffer model and the set of
//! model ids referencing it. Callers receive a [`GeometryBufferProxy`] that
//! detaches its model id when dropped or explicitly unregistered; the last
//! detach disposes the buffer model and removes the cache entry.
//!
//! # Locking
//!
//! The map has one coarse lock. Each container guards its reference set with
//! its own lock, so detaching from one geometry never blocks lookups of
//! another. The map lock may be held while taking a container lock, never
//! the other way around.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{DeviceContext, DeviceResources};
use crate::buffers::{BufferLayout, GeometryBufferModel};
use crate::config::BufferCacheConfig;
use crate::geometry::{Geometry, GeometryId, ModelId};

/// A buffer model the manager can create and share.
pub trait ManagedBufferModel: Send + Sync + 'static {
    fn create(config: &BufferCacheConfig) -> Arc<Self>
    where
        Self: Sized;

    fn set_geometry(&self, geometry: Option<&Arc<Geometry>>);

    /// Release GPU resources. Must be idempotent.
    fn dispose(&self);
}

impl<L: BufferLayout> ManagedBufferModel for GeometryBufferModel<L> {
    fn create(config: &BufferCacheConfig) -> Arc<Self> {
        Self::new(config)
    }

    fn set_geometry(&self, geometry: Option<&Arc<Geometry>>) {
        GeometryBufferModel::set_geometry(self, geometry);
    }

    fn dispose(&self) {
        GeometryBufferModel::dispose(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    model_type: TypeId,
    geometry: GeometryId,
}

impl CacheKey {
    fn of<T: ManagedBufferModel>(geometry: GeometryId) -> Self {
        Self {
            model_type: TypeId::of::<T>(),
            geometry,
        }
    }
}

type Teardown = Box<dyn Fn(&GeometryBufferContainer) + Send + Sync>;

#[derive(Default)]
struct References {
    models: HashSet<ModelId>,
    disposed: bool,
}

/// One shared buffer model plus the ids of the models referencing it.
pub struct GeometryBufferContainer {
    key: CacheKey,
    type_name: &'static str,
    model: Arc<dyn ManagedBufferModel>,
    any: Arc<dyn Any + Send + Sync>,
    references: Mutex<References>,
    on_teardown: Teardown,
}

impl GeometryBufferContainer {
    fn new<T: ManagedBufferModel>(key: CacheKey, model: Arc<T>, on_teardown: Teardown) -> Self {
        Self {
            key,
            type_name: type_name::<T>(),
            model: model.clone(),
            any: model,
            references: Mutex::new(References::default()),
            on_teardown,
        }
    }

    pub fn geometry_id(&self) -> GeometryId {
        self.key.geometry
    }

    /// The shared model, if it is a `T`.
    pub fn buffer_model<T: ManagedBufferModel>(&self) -> Option<Arc<T>> {
        self.any.clone().downcast::<T>().ok()
    }

    pub fn reference_count(&self) -> usize {
        self.references.lock().models.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.references.lock().disposed
    }

    /// Add `model_id` to the reference set. Attaching an id twice is a no-op.
    ///
    /// Returns `false` once the container has been disposed; the caller must
    /// create a fresh container instead.
    pub fn attach(&self, model_id: ModelId) -> bool {
        let mut references = self.references.lock();
        if references.disposed {
            return false;
        }
        references.models.insert(model_id);
        true
    }

    /// Remove `model_id` from the reference set.
    ///
    /// When the set becomes empty the model is disposed and the container
    /// removes itself from the cache. Returns whether the id was attached.
    pub fn detach(&self, model_id: ModelId) -> bool {
        let emptied = {
            let mut references = self.references.lock();
            if references.disposed || !references.models.remove(&model_id) {
                return false;
            }
            references.disposed = references.models.is_empty();
            references.disposed
        };
        if emptied {
            log::debug!(
                "GeometryBufferContainer: last reference to {} for {} released",
                self.type_name,
                self.key.geometry
            );
            self.model.dispose();
            (self.on_teardown)(self);
        }
        true
    }

    /// Dispose regardless of outstanding references.
    pub fn dispose(&self) {
        {
            let mut references = self.references.lock();
            if references.disposed {
                return;
            }
            references.disposed = true;
            references.models.clear();
        }
        self.model.dispose();
    }
}

impl std::fmt::Debug for GeometryBufferContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let references = self.references.lock();
        f.debug_struct("GeometryBufferContainer")
            .field("model", &self.type_name)
            .field("geometry", &self.key.geometry)
            .field("references", &references.models.len())
            .field("disposed", &references.disposed)
            .finish()
    }
}

#[derive(Default)]
struct BufferCache {
    entries: Mutex<HashMap<CacheKey, Arc<GeometryBufferContainer>>>,
}

impl BufferCache {
    fn get(&self, key: &CacheKey) -> Option<Arc<GeometryBufferContainer>> {
        self.entries.lock().get(key).cloned()
    }

    /// Remove the entry for `container` unless it was already replaced.
    fn remove(&self, container: &GeometryBufferContainer) {
        let mut entries = self.entries.lock();
        let current = entries
            .get(&container.key)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), container));
        if current {
            entries.remove(&container.key);
            log::debug!(
                "GeometryBufferManager: removed {} for {} ({} entries left)",
                container.type_name,
                container.key.geometry,
                entries.len()
            );
        }
    }

    fn unregister(&self, key: CacheKey, model_id: ModelId) -> bool {
        let Some(container) = self.get(&key) else {
            log::debug!(
                "GeometryBufferManager: no entry for {} while unregistering {}",
                key.geometry,
                model_id
            );
            return false;
        };
        let detached = container.detach(model_id);
        if !detached {
            log::debug!(
                "GeometryBufferManager: {} was not attached to {}",
                model_id,
                key.geometry
            );
        }
        detached
    }
}

/// Handle to a possibly shared buffer model.
///
/// Dropping the proxy detaches its model id from the shared container. A
/// proxy created from invalid input is empty: it holds no model and every
/// forwarding call is a no-op.
pub struct GeometryBufferProxy<T: ManagedBufferModel> {
    model_id: ModelId,
    geometry_id: GeometryId,
    model: Option<Arc<T>>,
    cache: Weak<BufferCache>,
}

impl<T: ManagedBufferModel> GeometryBufferProxy<T> {
    /// A proxy wrapping nothing.
    pub fn empty() -> Self {
        Self {
            model_id: ModelId::nil(),
            geometry_id: GeometryId::nil(),
            model: None,
            cache: Weak::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none()
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn geometry_id(&self) -> GeometryId {
        self.geometry_id
    }

    pub fn buffer_model(&self) -> Option<&Arc<T>> {
        self.model.as_ref()
    }

    fn release(&mut self) -> bool {
        self.model = None;
        let cache = std::mem::take(&mut self.cache);
        if self.model_id.is_nil() || self.geometry_id.is_nil() {
            return false;
        }
        match cache.upgrade() {
            Some(cache) => cache.unregister(CacheKey::of::<T>(self.geometry_id), self.model_id),
            None => false,
        }
    }
}

impl<L: BufferLayout> GeometryBufferProxy<GeometryBufferModel<L>> {
    /// See [`GeometryBufferModel::update_buffers`].
    pub fn update_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        resources: &dyn DeviceResources,
    ) -> bool {
        self.model
            .as_ref()
            .is_some_and(|model| model.update_buffers(ctx, resources))
    }

    /// See [`GeometryBufferModel::attach_buffers`].
    pub fn attach_buffers(
        &self,
        ctx: &mut dyn DeviceContext,
        slot: &mut u32,
        resources: &dyn DeviceResources,
    ) -> bool {
        self.model
            .as_ref()
            .is_some_and(|model| model.attach_buffers(ctx, slot, resources))
    }
}

impl<T: ManagedBufferModel> Default for GeometryBufferProxy<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ManagedBufferModel> Drop for GeometryBufferProxy<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: ManagedBufferModel> std::fmt::Debug for GeometryBufferProxy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryBufferProxy")
            .field("model", &type_name::<T>())
            .field("model_id", &self.model_id)
            .field("geometry_id", &self.geometry_id)
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Cache of shared geometry buffer models.
pub struct GeometryBufferManager {
    cache: Arc<BufferCache>,
    config: BufferCacheConfig,
    disposed: AtomicBool,
}

impl GeometryBufferManager {
    pub fn new(config: BufferCacheConfig) -> Self {
        Self {
            cache: Arc::new(BufferCache::default()),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BufferCacheConfig {
        &self.config
    }

    /// Reference the `T` buffer model of `geometry` on behalf of `model_id`.
    ///
    /// Every registration for the same `T` and geometry shares one model.
    /// A missing geometry or a nil model id yields an empty proxy.
    pub fn register<T: ManagedBufferModel>(
        &self,
        model_id: ModelId,
        geometry: Option<&Arc<Geometry>>,
    ) -> GeometryBufferProxy<T> {
        let Some(geometry) = geometry else {
            return GeometryBufferProxy::empty();
        };
        if model_id.is_nil() {
            return GeometryBufferProxy::empty();
        }
        if self.disposed.load(Ordering::Acquire) {
            log::warn!(
                "GeometryBufferManager: register of {} after dispose",
                type_name::<T>()
            );
            return GeometryBufferProxy::empty();
        }

        let key = CacheKey::of::<T>(geometry.id());
        let mut entries = self.cache.entries.lock();

        let shared = entries
            .get(&key)
            .filter(|container| container.attach(model_id))
            .and_then(|container| container.buffer_model::<T>());

        let model = match shared {
            Some(model) => model,
            None => {
                let model = T::create(&self.config);
                model.set_geometry(Some(geometry));

                let cache = Arc::downgrade(&self.cache);
                let container = Arc::new(GeometryBufferContainer::new(
                    key,
                    model.clone(),
                    Box::new(move |container| {
                        if let Some(cache) = cache.upgrade() {
                            cache.remove(container);
                        }
                    }),
                ));
                container.attach(model_id);
                entries.insert(key, container);
                log::debug!(
                    "GeometryBufferManager: created {} for {} ({} entries)",
                    type_name::<T>(),
                    key.geometry,
                    entries.len()
                );
                model
            }
        };

        GeometryBufferProxy {
            model_id,
            geometry_id: key.geometry,
            model: Some(model),
            cache: Arc::downgrade(&self.cache),
        }
    }

    /// Detach `proxy` from its shared model.
    ///
    /// Returns `false` for empty proxies, proxies of another manager and
    /// entries that are already gone.
    pub fn unregister<T: ManagedBufferModel>(&self, mut proxy: GeometryBufferProxy<T>) -> bool {
        if !std::ptr::eq(proxy.cache.as_ptr(), Arc::as_ptr(&self.cache)) {
            return false;
        }
        proxy.release()
    }

    /// Number of cached buffer models.
    pub fn len(&self) -> usize {
        self.cache.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.entries.lock().is_empty()
    }

    pub fn contains<T: ManagedBufferModel>(&self, geometry: GeometryId) -> bool {
        self.cache
            .entries
            .lock()
            .contains_key(&CacheKey::of::<T>(geometry))
    }

    /// Number of model ids referencing the `T` model of `geometry`.
    pub fn reference_count<T: ManagedBufferModel>(&self, geometry: GeometryId) -> usize {
        self.cache
            .get(&CacheKey::of::<T>(geometry))
            .map_or(0, |container| container.reference_count())
    }

    /// Dispose every cached model regardless of outstanding proxies.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let containers: Vec<_> = self
            .cache
            .entries
            .lock()
            .drain()
            .map(|(_, container)| container)
            .collect();
        log::debug!(
            "GeometryBufferManager: disposing {} entries",
            containers.len()
        );
        for container in containers {
            container.dispose();
        }
    }
}

impl Default for GeometryBufferManager {
    fn default() -> Self {
        Self::new(BufferCacheConfig::default())
    }
}

impl Drop for GeometryBufferManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for GeometryBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryBufferManager")
            .field("entries", &self.len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

static_assertions::assert_impl_all!(GeometryBufferManager: Send, Sync);
static_assertions::assert_impl_all!(GeometryBufferContainer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyContext, DummyDevice, DummyResources};
    use crate::buffers::{LineGeometryBufferModel, MeshGeometryBufferModel};
    use crate::geometry::GeometryKind;
    use glam::Vec3;

    fn triangle() -> Arc<Geometry> {
        let geometry = Geometry::new(GeometryKind::Mesh);
        geometry.set_positions(Some(Arc::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y])));
        geometry.set_indices(Some(Arc::new(vec![0, 1, 2])));
        geometry
    }

    #[test]
    fn test_same_key_shares_model() {
        let manager = GeometryBufferManager::default();
        let geometry = triangle();
        let a = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
        let b = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));

        assert!(Arc::ptr_eq(a.buffer_model().unwrap(), b.buffer_model().unwrap()));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.reference_count::<MeshGeometryBufferModel>(geometry.id()), 2);
    }

    #[test]
    fn test_different_types_do_not_share() {
        let manager = GeometryBufferManager::default();
        let geometry = triangle();
        let model = ModelId::new();
        let mesh = manager.register::<MeshGeometryBufferModel>(model, Some(&geometry));
        let line = manager.register::<LineGeometryBufferModel>(model, Some(&geometry));

        assert!(!mesh.is_empty());
        assert!(!line.is_empty());
        assert_eq!(manager.len(), 2);
        assert!(manager.contains::<MeshGeometryBufferModel>(geometry.id()));
        assert!(manager.contains::<LineGeometryBufferModel>(geometry.id()));
    }

    #[test]
    fn test_last_unregister_removes_entry_and_buffers() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let resources = DummyResources::default();
        let manager = GeometryBufferManager::default();
        let geometry = triangle();

        let first = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
        let second = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
        assert!(first.update_buffers(&mut ctx, &resources));
        let model = second.buffer_model().unwrap().clone();

        assert!(manager.unregister(first));
        assert!(manager.contains::<MeshGeometryBufferModel>(geometry.id()));
        assert!(!model.is_disposed());
        assert!(second.attach_buffers(&mut ctx, &mut 0, &resources));

        assert!(manager.unregister(second));
        assert!(manager.is_empty());
        assert!(model.is_disposed());
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(geometry.observer_count(), 0);
    }

    #[test]
    fn test_drop_unregisters() {
        let manager = GeometryBufferManager::default();
        let geometry = triangle();
        {
            let _proxy = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
            assert_eq!(manager.len(), 1);
        }
        assert!(manager.is_empty());
    }

    #[test]
    fn test_invalid_input_yields_empty_proxy() {
        let manager = GeometryBufferManager::default();
        let geometry = triangle();

        let nil = manager.register::<MeshGeometryBufferModel>(ModelId::nil(), Some(&geometry));
        let missing = manager.register::<MeshGeometryBufferModel>(ModelId::new(), None);
        assert!(nil.is_empty());
        assert!(missing.is_empty());
        assert!(manager.is_empty());

        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device);
        assert!(!nil.attach_buffers(&mut ctx, &mut 0, &DummyResources::default()));
        assert!(!manager.unregister(nil));
    }

    #[test]
    fn test_attach_same_model_twice_is_idempotent() {
        let manager = GeometryBufferManager::default();
        let geometry = triangle();
        let model = ModelId::new();
        let a = manager.register::<MeshGeometryBufferModel>(model, Some(&geometry));
        let b = manager.register::<MeshGeometryBufferModel>(model, Some(&geometry));
        assert_eq!(manager.reference_count::<MeshGeometryBufferModel>(geometry.id()), 1);

        assert!(manager.unregister(a));
        assert!(manager.is_empty());
        assert!(!manager.unregister(b));
    }

    #[test]
    fn test_register_after_teardown_creates_fresh_model() {
        let manager = GeometryBufferManager::default();
        let geometry = triangle();
        let first = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
        let old = first.buffer_model().unwrap().clone();
        drop(first);

        let second = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
        assert!(!Arc::ptr_eq(&old, second.buffer_model().unwrap()));
        assert!(!second.buffer_model().unwrap().is_disposed());
    }

    #[test]
    fn test_dispose_tears_down_everything() {
        let device = DummyDevice::new();
        let mut ctx = DummyContext::new(device.clone());
        let manager = GeometryBufferManager::default();
        let geometry = triangle();
        let proxy = manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));
        proxy.update_buffers(&mut ctx, &DummyResources::default());

        manager.dispose();
        assert!(manager.is_empty());
        assert!(proxy.buffer_model().unwrap().is_disposed());
        assert_eq!(device.live_buffer_count(), 0);

        assert!(!manager.unregister(proxy));
        assert!(manager
            .register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry))
            .is_empty());
    }

    #[test]
    fn test_proxy_outlives_manager() {
        let geometry = triangle();
        let proxy = {
            let manager = GeometryBufferManager::default();
            manager.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry))
        };
        assert!(proxy.buffer_model().unwrap().is_disposed());
        drop(proxy);
    }

    #[test]
    fn test_unregister_foreign_proxy() {
        let geometry = triangle();
        let a = GeometryBufferManager::default();
        let b = GeometryBufferManager::default();
        let proxy = a.register::<MeshGeometryBufferModel>(ModelId::new(), Some(&geometry));

        assert!(!b.unregister(proxy));
        // Dropping the rejected proxy still detached it from its own manager.
        assert!(a.is_empty());
    }
}
