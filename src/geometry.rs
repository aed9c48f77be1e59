//! CPU-side geometry objects observed by buffer models.
//!
//! A [`Geometry`] is shared as `Arc<Geometry>` between any number of
//! rendering models. Its streams are replaced as whole `Arc<Vec<_>>` values,
//! and every replacement raises one [`GeometryProperty`] notification to the
//! subscribed [`GeometryObserver`]s. Observers are held weakly: a geometry
//! never keeps a buffer model alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use uuid::Uuid;

/// Stable identity of a geometry object, half of the buffer cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(Uuid);

impl GeometryId {
    /// Creates a new, random (version 4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for GeometryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GeometryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a rendering model that references a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(Uuid);

impl ModelId {
    /// Creates a new, random (version 4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What a geometry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Mesh,
    Line,
    Point,
    Billboard,
}

/// Name of a geometry stream, carried by change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryProperty {
    Positions,
    Indices,
    Normals,
    TextureCoordinates,
    Tangents,
    BiTangents,
    Colors,
    VertexBoneIds,
    BillboardItems,
    Texture,
}

/// Bone indices and weights of one skinned vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoneIds {
    pub bones: [u32; 4],
    pub weights: [f32; 4],
}

impl BoneIds {
    pub fn single(bone: u32) -> Self {
        Self {
            bones: [bone, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Size and atlas region of one billboard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillboardItem {
    pub size: Vec2,
    pub uv_min: Vec2,
    pub uv_max: Vec2,
}

impl BillboardItem {
    pub fn new(size: Vec2) -> Self {
        Self {
            size,
            uv_min: Vec2::ZERO,
            uv_max: Vec2::ONE,
        }
    }
}

/// The replaceable data streams of a geometry.
#[derive(Debug, Clone, Default)]
pub struct GeometryStreams {
    pub positions: Option<Arc<Vec<Vec3>>>,
    pub indices: Option<Arc<Vec<u32>>>,
    pub normals: Option<Arc<Vec<Vec3>>>,
    pub texture_coordinates: Option<Arc<Vec<Vec2>>>,
    pub tangents: Option<Arc<Vec<Vec3>>>,
    pub bitangents: Option<Arc<Vec<Vec3>>>,
    pub colors: Option<Arc<Vec<Vec4>>>,
    pub bone_ids: Option<Arc<Vec<BoneIds>>>,
    pub billboard_items: Option<Arc<Vec<BillboardItem>>>,
    /// Key resolved through the device's texture manager.
    pub texture: Option<Arc<str>>,
}

impl GeometryStreams {
    pub fn vertex_count(&self) -> usize {
        self.positions.as_ref().map_or(0, |p| p.len())
    }
}

/// Token returned by [`Geometry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiver of geometry change notifications.
pub trait GeometryObserver: Send + Sync {
    fn on_geometry_changed(&self, geometry: &Geometry, property: GeometryProperty);
}

/// A CPU-side geometry object.
pub struct Geometry {
    id: GeometryId,
    kind: GeometryKind,
    streams: RwLock<GeometryStreams>,
    next_subscription: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Weak<dyn GeometryObserver>)>>,
}

fn same_stream<T: ?Sized>(current: &Option<Arc<T>>, new: &Option<Arc<T>>) -> bool {
    match (current, new) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl Geometry {
    pub fn new(kind: GeometryKind) -> Arc<Self> {
        Self::with_streams(kind, GeometryStreams::default())
    }

    pub fn with_streams(kind: GeometryKind, streams: GeometryStreams) -> Arc<Self> {
        Arc::new(Self {
            id: GeometryId::new(),
            kind,
            streams: RwLock::new(streams),
            next_subscription: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    /// Read access to all streams at once.
    pub fn streams(&self) -> RwLockReadGuard<'_, GeometryStreams> {
        self.streams.read()
    }

    pub fn positions(&self) -> Option<Arc<Vec<Vec3>>> {
        self.streams.read().positions.clone()
    }

    pub fn indices(&self) -> Option<Arc<Vec<u32>>> {
        self.streams.read().indices.clone()
    }

    pub fn vertex_count(&self) -> usize {
        self.streams.read().vertex_count()
    }

    fn replace<T: ?Sized>(
        &self,
        property: GeometryProperty,
        value: Option<Arc<T>>,
        select: impl FnOnce(&mut GeometryStreams) -> &mut Option<Arc<T>>,
    ) {
        {
            let mut streams = self.streams.write();
            let slot = select(&mut streams);
            if same_stream(slot, &value) {
                return;
            }
            *slot = value;
        }
        self.notify(property);
    }

    pub fn set_positions(&self, positions: Option<Arc<Vec<Vec3>>>) {
        self.replace(GeometryProperty::Positions, positions, |s| &mut s.positions);
    }

    pub fn set_indices(&self, indices: Option<Arc<Vec<u32>>>) {
        self.replace(GeometryProperty::Indices, indices, |s| &mut s.indices);
    }

    pub fn set_normals(&self, normals: Option<Arc<Vec<Vec3>>>) {
        self.replace(GeometryProperty::Normals, normals, |s| &mut s.normals);
    }

    pub fn set_texture_coordinates(&self, coordinates: Option<Arc<Vec<Vec2>>>) {
        self.replace(GeometryProperty::TextureCoordinates, coordinates, |s| {
            &mut s.texture_coordinates
        });
    }

    pub fn set_tangents(&self, tangents: Option<Arc<Vec<Vec3>>>) {
        self.replace(GeometryProperty::Tangents, tangents, |s| &mut s.tangents);
    }

    pub fn set_bitangents(&self, bitangents: Option<Arc<Vec<Vec3>>>) {
        self.replace(GeometryProperty::BiTangents, bitangents, |s| &mut s.bitangents);
    }

    pub fn set_colors(&self, colors: Option<Arc<Vec<Vec4>>>) {
        self.replace(GeometryProperty::Colors, colors, |s| &mut s.colors);
    }

    pub fn set_bone_ids(&self, bone_ids: Option<Arc<Vec<BoneIds>>>) {
        self.replace(GeometryProperty::VertexBoneIds, bone_ids, |s| &mut s.bone_ids);
    }

    pub fn set_billboard_items(&self, items: Option<Arc<Vec<BillboardItem>>>) {
        self.replace(GeometryProperty::BillboardItems, items, |s| {
            &mut s.billboard_items
        });
    }

    pub fn set_texture(&self, texture: Option<Arc<str>>) {
        self.replace(GeometryProperty::Texture, texture, |s| &mut s.texture);
    }

    /// Mutate the positions in place and notify.
    pub fn update_positions(&self, update: impl FnOnce(&mut Vec<Vec3>)) {
        {
            let mut streams = self.streams.write();
            let positions = streams.positions.get_or_insert_with(Default::default);
            update(Arc::make_mut(positions));
        }
        self.notify(GeometryProperty::Positions);
    }

    /// Mutate the indices in place and notify.
    pub fn update_indices(&self, update: impl FnOnce(&mut Vec<u32>)) {
        {
            let mut streams = self.streams.write();
            let indices = streams.indices.get_or_insert_with(Default::default);
            update(Arc::make_mut(indices));
        }
        self.notify(GeometryProperty::Indices);
    }

    /// Re-raise the positions notification without touching data.
    pub fn update_vertices(&self) {
        self.notify(GeometryProperty::Positions);
    }

    /// Re-raise the indices notification without touching data.
    pub fn update_triangles(&self) {
        self.notify(GeometryProperty::Indices);
    }

    pub fn subscribe(&self, observer: Weak<dyn GeometryObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .iter()
            .filter(|(_, observer)| observer.strong_count() > 0)
            .count()
    }

    /// Deliver `property` to every live observer, pruning dead ones.
    pub fn notify(&self, property: GeometryProperty) {
        let live: Vec<Arc<dyn GeometryObserver>> = {
            let mut observers = self.observers.lock();
            observers.retain(|(_, observer)| observer.strong_count() > 0);
            observers
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect()
        };
        for observer in live {
            observer.on_geometry_changed(self, property);
        }
    }
}

impl PartialEq for Geometry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Geometry {}

impl std::fmt::Debug for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geometry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("vertices", &self.vertex_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(Geometry: Send, Sync);
