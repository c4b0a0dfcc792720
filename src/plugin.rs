//! # Plugin Blocks
//!
//! A plugin is a fixed-size sub-structure co-located with every instance
//! of a type (and of its descendants). Plugins are registered against a
//! type while it has no live instances; from then on every constructed
//! object reserves the type's plugin block and runs the registered
//! [`PluginInterface`] callbacks in registration order.
//!
//! [`PluginRegistry`] is the per-type block composer. It owns the plugin
//! descriptors of exactly one registered type and answers the queries the
//! layout engine needs: total block size, intra-block offsets, and the
//! bulk construct/destroy/assign operations over the whole block.
//! `construct_block` unwinds within itself on partial failure, so the
//! caller observes the block as all-or-nothing.

use std::ptr::NonNull;

use crate::object::ObjectRef;
use crate::payload::Host;

/// Numeric key attached to a plugin registration. Keys are opaque to the
/// type system; embedders use them to tag well-known plugins.
pub type PluginId = u32;

/// Reserved key for plugins registered without an identity.
pub const ANONYMOUS_PLUGIN_ID: PluginId = 0xFFFF_FFFF;

/// Opaque token returned by plugin registration, later resolved against an
/// object to a concrete byte location.
///
/// Tokens stay valid across unregistration of *other* plugins on the same
/// type; only the block offsets behind them shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginOffset(pub(crate) usize);

/// Sentinel distinguishing failed registration.
pub const INVALID_PLUGIN_OFFSET: PluginOffset = PluginOffset(usize::MAX);

impl PluginOffset {
    /// Whether this token names a successful registration.
    #[inline]
    pub fn is_valid(self) -> bool {
        self != INVALID_PLUGIN_OFFSET
    }
}

/// One plugin's window into an object: the owning object, the plugin's
/// data pointer inside it, and the host context of the current operation.
pub struct PluginView<'a> {
    /// The object the plugin lives in.
    pub object: ObjectRef,
    /// Pointer to this plugin's bytes inside the object.
    pub data: NonNull<u8>,
    /// Host context passed through from the lifecycle call.
    pub host: Host<'a>,
}

/// Capability set dispatched for every plugin of a type.
///
/// The interface is owned by the registry entry and dropped when the
/// plugin is unregistered or the descriptor is deleted.
pub trait PluginInterface: Send + Sync {
    /// Initialize the plugin's bytes. Returning `false` rejects the
    /// object; the registry destructs the plugins already constructed in
    /// this block and the lifecycle engine unwinds the rest of the object.
    ///
    /// # Safety
    ///
    /// `view.data` is valid for writes of the registered plugin size and
    /// uninitialized.
    unsafe fn construct(&self, view: PluginView<'_>) -> bool;

    /// Tear the plugin's bytes down. Must not panic: a failing plugin
    /// destructor is an invariant breach.
    ///
    /// # Safety
    ///
    /// `view.data` points at bytes previously initialized by
    /// [`construct`](Self::construct).
    unsafe fn destruct(&self, view: PluginView<'_>);

    /// Copy plugin state from `src` to `dst` during a clone. Both views
    /// point at constructed plugin bytes. Returning `false` aborts the
    /// clone.
    ///
    /// # Safety
    ///
    /// Both data pointers are valid and initialized for the registered
    /// plugin size.
    unsafe fn assign(&self, dst: PluginView<'_>, src: PluginView<'_>) -> bool;

    /// Hook invoked right before the registry releases this interface.
    fn on_unregister(&self) {}
}

// ============================================================================
// Plain struct plugins
// ============================================================================

/// Plugin interface for a plain struct: default-construct on object
/// construction, drop on destruction, clone-assign on clone.
pub struct StructPlugin<S> {
    _marker: std::marker::PhantomData<fn() -> S>,
}

impl<S> StructPlugin<S> {
    /// Interface for the struct `S`.
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<S> Default for StructPlugin<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Default + Clone + Send + Sync + 'static> PluginInterface for StructPlugin<S> {
    unsafe fn construct(&self, view: PluginView<'_>) -> bool {
        view.data.cast::<S>().as_ptr().write(S::default());
        true
    }

    unsafe fn destruct(&self, view: PluginView<'_>) {
        std::ptr::drop_in_place(view.data.cast::<S>().as_ptr());
    }

    unsafe fn assign(&self, dst: PluginView<'_>, src: PluginView<'_>) -> bool {
        let source = &*src.data.cast::<S>().as_ptr();
        *dst.data.cast::<S>().as_ptr() = source.clone();
        true
    }
}

// ============================================================================
// Per-type registry
// ============================================================================

struct PluginEntry {
    size: usize,
    id: PluginId,
    iface: Box<dyn PluginInterface>,
}

/// Per-type container of plugin descriptors.
///
/// Plugin block sizes are a function of the type alone: every instance of
/// the type reserves `size_fixed()` bytes, laid out in registration
/// order. Conditional (per-object) plugin presence is deliberately not
/// supported; `size_for_object` exists for interface symmetry and answers
/// the same as `size_fixed`.
pub struct PluginRegistry {
    entries: Vec<Option<PluginEntry>>,
}

impl PluginRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a plugin of `size` bytes under `id`. Returns the token later
    /// used for offset resolution and unregistration.
    pub fn register_plugin(
        &mut self,
        size: usize,
        id: PluginId,
        iface: Box<dyn PluginInterface>,
    ) -> PluginOffset {
        let token = self.entries.len();
        self.entries.push(Some(PluginEntry { size, id, iface }));
        PluginOffset(token)
    }

    /// Revoke a registration. The interface's
    /// [`on_unregister`](PluginInterface::on_unregister) hook runs before
    /// the interface is dropped. Returns `false` for unknown tokens.
    pub fn unregister_plugin(&mut self, token: PluginOffset) -> bool {
        match self.entries.get_mut(token.0).and_then(Option::take) {
            Some(entry) => {
                entry.iface.on_unregister();
                true
            }
            None => false,
        }
    }

    /// Total bytes the block reserves in every instance of the type.
    pub fn size_fixed(&self) -> usize {
        self.live().map(|(_, e)| e.size).sum()
    }

    /// Block size for one concrete object. Identical to
    /// [`size_fixed`](Self::size_fixed); kept for interface symmetry.
    pub fn size_for_object(&self, _object: ObjectRef) -> usize {
        self.size_fixed()
    }

    /// Intra-block byte offset of a registered plugin, or `None` for
    /// invalid or revoked tokens.
    pub fn resolve_offset(&self, token: PluginOffset) -> Option<usize> {
        if !token.is_valid() {
            return None;
        }
        self.entries.get(token.0)?.as_ref()?;
        let mut offset = 0;
        for (index, entry) in self.live() {
            if index == token.0 {
                return Some(offset);
            }
            offset += entry.size;
        }
        None
    }

    /// The key a plugin was registered under.
    pub fn plugin_id(&self, token: PluginOffset) -> Option<PluginId> {
        self.entries.get(token.0)?.as_ref().map(|e| e.id)
    }

    /// Number of live registrations.
    pub fn plugin_count(&self) -> usize {
        self.live().count()
    }

    fn live(&self) -> impl Iterator<Item = (usize, &PluginEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }

    /// Run every plugin's constructor over the block starting at byte
    /// offset `base` inside `object`. On the first rejection, destructs
    /// the plugins already constructed in reverse order and reports
    /// `false`; the block is then back to fully unconstructed.
    ///
    /// # Safety
    ///
    /// `object` must be live and its allocation must cover
    /// `base + size_fixed()` bytes; the block must be unconstructed.
    pub(crate) unsafe fn construct_block(
        &self,
        object: ObjectRef,
        base: usize,
        host: Host<'_>,
    ) -> bool {
        let mut constructed: Vec<(usize, &PluginEntry)> = Vec::new();
        let mut offset = base;
        for (_, entry) in self.live() {
            let data = self.data_at(object, offset);
            let ok = entry.iface.construct(PluginView {
                object,
                data,
                host,
            });
            if !ok {
                for (off, done) in constructed.into_iter().rev() {
                    let data = self.data_at(object, off);
                    done.iface.destruct(PluginView {
                        object,
                        data,
                        host,
                    });
                }
                return false;
            }
            constructed.push((offset, entry));
            offset += entry.size;
        }
        true
    }

    /// Run every plugin's destructor over a fully constructed block, in
    /// reverse registration order.
    ///
    /// # Safety
    ///
    /// The block at `base` must have been constructed by
    /// [`construct_block`](Self::construct_block) and not yet destroyed.
    pub(crate) unsafe fn destroy_block(&self, object: ObjectRef, base: usize, host: Host<'_>) {
        let mut placed: Vec<(usize, &PluginEntry)> = Vec::new();
        let mut offset = base;
        for (_, entry) in self.live() {
            placed.push((offset, entry));
            offset += entry.size;
        }
        for (off, entry) in placed.into_iter().rev() {
            let data = self.data_at(object, off);
            entry.iface.destruct(PluginView {
                object,
                data,
                host,
            });
        }
    }

    /// Run every plugin's `assign` from `src` to `dst`, in registration
    /// order. Stops at the first rejection and reports `false`; partially
    /// assigned plugins are left constructed, the caller owns the unwind.
    ///
    /// # Safety
    ///
    /// Both objects must be live, of the same type, with constructed
    /// blocks at `base`.
    pub(crate) unsafe fn assign_block(
        &self,
        dst: ObjectRef,
        src: ObjectRef,
        base: usize,
        host: Host<'_>,
    ) -> bool {
        let mut offset = base;
        for (_, entry) in self.live() {
            let ok = entry.iface.assign(
                PluginView {
                    object: dst,
                    data: self.data_at(dst, offset),
                    host,
                },
                PluginView {
                    object: src,
                    data: self.data_at(src, offset),
                    host,
                },
            );
            if !ok {
                return false;
            }
            offset += entry.size;
        }
        true
    }

    unsafe fn data_at(&self, object: ObjectRef, offset: usize) -> NonNull<u8> {
        NonNull::new_unchecked(object.as_raw().as_ptr().add(offset))
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        for entry in self.entries.iter().flatten() {
            entry.iface.on_unregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header_size;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Interface that counts lifecycle calls and can be told to reject
    /// construction or assignment.
    struct Probe {
        constructed: Arc<AtomicU32>,
        destructed: Arc<AtomicU32>,
        fail_construct: bool,
        fail_assign: bool,
    }

    impl Probe {
        fn new(constructed: &Arc<AtomicU32>, destructed: &Arc<AtomicU32>) -> Box<Self> {
            Box::new(Self {
                constructed: Arc::clone(constructed),
                destructed: Arc::clone(destructed),
                fail_construct: false,
                fail_assign: false,
            })
        }
    }

    impl PluginInterface for Probe {
        unsafe fn construct(&self, _view: PluginView<'_>) -> bool {
            if self.fail_construct {
                return false;
            }
            self.constructed.fetch_add(1, Ordering::Relaxed);
            true
        }

        unsafe fn destruct(&self, _view: PluginView<'_>) {
            self.destructed.fetch_add(1, Ordering::Relaxed);
        }

        unsafe fn assign(&self, _dst: PluginView<'_>, _src: PluginView<'_>) -> bool {
            !self.fail_assign
        }
    }

    fn block_object(block_size: usize) -> (Vec<u8>, ObjectRef) {
        let mut storage = vec![0u8; header_size() + block_size];
        let raw = NonNull::new(storage.as_mut_ptr()).unwrap();
        let object = unsafe { ObjectRef::from_raw(raw) };
        (storage, object)
    }

    #[test]
    fn test_offsets_accumulate_in_registration_order() {
        let mut registry = PluginRegistry::new();
        let a = registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, Box::new(StructPlugin::<u32>::new()));
        let b = registry.register_plugin(8, 7, Box::new(StructPlugin::<u64>::new()));

        assert_eq!(registry.size_fixed(), 12);
        assert_eq!(registry.resolve_offset(a), Some(0));
        assert_eq!(registry.resolve_offset(b), Some(4));
        assert_eq!(registry.plugin_id(b), Some(7));
    }

    #[test]
    fn test_unregister_shifts_later_offsets() {
        let mut registry = PluginRegistry::new();
        let a = registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, Box::new(StructPlugin::<u32>::new()));
        let b = registry.register_plugin(8, ANONYMOUS_PLUGIN_ID, Box::new(StructPlugin::<u64>::new()));

        assert!(registry.unregister_plugin(a));
        assert_eq!(registry.size_fixed(), 8);
        assert_eq!(registry.resolve_offset(b), Some(0));
        assert_eq!(registry.resolve_offset(a), None);
        assert!(!registry.unregister_plugin(a));
    }

    #[test]
    fn test_invalid_token_resolves_to_none() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.resolve_offset(INVALID_PLUGIN_OFFSET), None);
        assert!(!INVALID_PLUGIN_OFFSET.is_valid());
    }

    #[test]
    fn test_construct_block_unwinds_on_failure() {
        let constructed = Arc::new(AtomicU32::new(0));
        let destructed = Arc::new(AtomicU32::new(0));

        let mut registry = PluginRegistry::new();
        registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, Probe::new(&constructed, &destructed));
        let mut failing = Probe::new(&constructed, &destructed);
        failing.fail_construct = true;
        registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, failing);

        let (_storage, object) = block_object(registry.size_fixed());
        let ok = unsafe { registry.construct_block(object, header_size(), None) };

        assert!(!ok);
        assert_eq!(constructed.load(Ordering::Relaxed), 1);
        assert_eq!(destructed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_destroy_block_reverses_construction() {
        let constructed = Arc::new(AtomicU32::new(0));
        let destructed = Arc::new(AtomicU32::new(0));

        let mut registry = PluginRegistry::new();
        registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, Probe::new(&constructed, &destructed));
        registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, Probe::new(&constructed, &destructed));

        let (_storage, object) = block_object(registry.size_fixed());
        unsafe {
            assert!(registry.construct_block(object, header_size(), None));
            registry.destroy_block(object, header_size(), None);
        }
        assert_eq!(constructed.load(Ordering::Relaxed), 2);
        assert_eq!(destructed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_assign_block_stops_at_rejection() {
        let constructed = Arc::new(AtomicU32::new(0));
        let destructed = Arc::new(AtomicU32::new(0));

        let mut registry = PluginRegistry::new();
        registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, Probe::new(&constructed, &destructed));
        let mut failing = Probe::new(&constructed, &destructed);
        failing.fail_assign = true;
        registry.register_plugin(4, ANONYMOUS_PLUGIN_ID, failing);

        let (_dst_storage, dst) = block_object(registry.size_fixed());
        let (_src_storage, src) = block_object(registry.size_fixed());
        let ok = unsafe { registry.assign_block(dst, src, header_size(), None) };
        assert!(!ok);
    }
}
