//! # Type Descriptors
//!
//! One [`TypeDescriptor`] exists per registered type. It is the record the
//! whole system revolves around: the type's name, its payload capability
//! set, the inheritance link, the plugin registry, and the counters that
//! pin the descriptor immutable while instances are alive.
//!
//! Descriptors live boxed inside the system's slot table, so their
//! addresses are stable; the inheritance link is a direct pointer to the
//! parent descriptor, letting chain walks run without touching the global
//! table. The public handle is [`TypeId`], a generational index: deleting
//! a type bumps the slot's generation, so stale handles from before the
//! deletion are recognized instead of silently aliasing a later
//! registration.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use crate::payload::PayloadInterface;
use crate::plugin::PluginRegistry;

/// Handle to a registered type.
///
/// Handles are plain data: copying one does not reference the type. A
/// handle outliving its type's deletion is detected (the slot generation
/// no longer matches) and reported as `UnknownType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId {
    index: u32,
    generation: u32,
}

impl TypeId {
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Encode into one word for storage in object headers.
    pub(crate) fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub(crate) fn unpack(packed: u64) -> Self {
        Self {
            index: packed as u32,
            generation: (packed >> 32) as u32,
        }
    }
}

/// Per-type record: payload ops, inheritance link, plugin registry,
/// reference accounting, advisory flags, and the type's own lock handle.
///
/// Mutable state is split by discipline:
/// - counters and flags are atomics, written under the descriptor's
///   write lock;
/// - the parent link is an atomic pointer, changed only while the
///   descriptor is unreferenced, under the write locks the inheritance
///   editor takes;
/// - the plugin registry sits in an `UnsafeCell` and is only touched
///   through [`registry`](Self::registry) /
///   [`registry_mut`](Self::registry_mut) under the lock discipline
///   documented there.
pub(crate) struct TypeDescriptor<K> {
    pub(crate) name: Arc<str>,
    pub(crate) payload_ops: Box<dyn PayloadInterface>,
    own_id: TypeId,
    parent: AtomicPtr<TypeDescriptor<K>>,
    pub(crate) ref_count: AtomicU32,
    pub(crate) inherit_count: AtomicU32,
    exclusive: AtomicBool,
    abstract_type: AtomicBool,
    registry: UnsafeCell<PluginRegistry>,
    pub(crate) lock: K,
}

impl<K> TypeDescriptor<K> {
    pub(crate) fn new(name: Arc<str>, payload_ops: Box<dyn PayloadInterface>, lock: K) -> Self {
        Self {
            name,
            payload_ops,
            own_id: TypeId::from_parts(u32::MAX, 0),
            parent: AtomicPtr::new(ptr::null_mut()),
            ref_count: AtomicU32::new(0),
            inherit_count: AtomicU32::new(0),
            exclusive: AtomicBool::new(false),
            abstract_type: AtomicBool::new(false),
            registry: UnsafeCell::new(PluginRegistry::new()),
            lock,
        }
    }

    /// Stamp the handle this descriptor is registered under. Called once,
    /// before the descriptor becomes visible to other threads.
    pub(crate) fn set_own_id(&mut self, id: TypeId) {
        self.own_id = id;
    }

    pub(crate) fn own_id(&self) -> TypeId {
        self.own_id
    }

    /// The direct parent descriptor, if any.
    ///
    /// Parent pointers always refer to live descriptors: `delete_type`
    /// detaches every child before a descriptor is dropped, and the
    /// deletion contract forbids deleting a type while it is in use.
    pub(crate) fn parent(&self) -> Option<&TypeDescriptor<K>> {
        let raw = self.parent.load(Ordering::Acquire);
        // Safety: see above; non-null parent pointers are live.
        unsafe { raw.as_ref() }
    }

    pub(crate) fn parent_id(&self) -> Option<TypeId> {
        self.parent().map(TypeDescriptor::own_id)
    }

    pub(crate) fn set_parent(&self, parent: Option<&TypeDescriptor<K>>) {
        let raw = parent.map_or(ptr::null_mut(), |p| {
            p as *const TypeDescriptor<K> as *mut TypeDescriptor<K>
        });
        self.parent.store(raw, Ordering::Release);
    }

    /// A referenced descriptor must not change: no re-parenting, no
    /// plugin registration, no payload swap.
    pub(crate) fn is_immutable(&self) -> bool {
        self.ref_count.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn is_end_type(&self) -> bool {
        self.inherit_count.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Relaxed)
    }

    pub(crate) fn set_exclusive(&self, exclusive: bool) {
        self.exclusive.store(exclusive, Ordering::Relaxed);
    }

    pub(crate) fn is_abstract(&self) -> bool {
        self.abstract_type.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_abstract(&self) {
        self.abstract_type.store(true, Ordering::Relaxed);
    }

    /// Shared view of the plugin registry.
    ///
    /// # Safety
    ///
    /// Caller must hold the descriptor's read lock, or the descriptor
    /// must be referenced (a referenced descriptor's registry cannot
    /// change, so unlocked reads are consistent).
    pub(crate) unsafe fn registry(&self) -> &PluginRegistry {
        &*self.registry.get()
    }

    /// Exclusive view of the plugin registry.
    ///
    /// # Safety
    ///
    /// Caller must hold the descriptor's write lock and the descriptor
    /// must not be referenced.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn registry_mut(&self) -> &mut PluginRegistry {
        &mut *self.registry.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> TypeDescriptor<()> {
        TypeDescriptor::new(
            Arc::from(name),
            Box::new(crate::payload::AbstractPayload::<u64>::new()),
            (),
        )
    }

    #[test]
    fn test_type_id_pack_round_trip() {
        let id = TypeId::from_parts(17, 3);
        assert_eq!(TypeId::unpack(id.pack()), id);
    }

    #[test]
    fn test_parent_link_round_trip() {
        let mut parent = descriptor("Base");
        parent.set_own_id(TypeId::from_parts(0, 1));
        let child = descriptor("Derived");

        assert_eq!(child.parent_id(), None);
        child.set_parent(Some(&parent));
        assert_eq!(child.parent_id(), Some(TypeId::from_parts(0, 1)));
        child.set_parent(None);
        assert!(child.parent().is_none());
    }

    #[test]
    fn test_fresh_descriptor_is_mutable_end_type() {
        let d = descriptor("Leaf");
        assert!(!d.is_immutable());
        assert!(d.is_end_type());
        assert!(!d.is_abstract());
        assert!(!d.is_exclusive());
    }
}
