//! # The Type System
//!
//! [`TypeSystem`] owns the global descriptor table and drives every
//! operation: registration, lookup, inheritance edits, layout queries and
//! the object lifecycle.
//!
//! ## Construction data flow
//!
//! ```text
//! construct(host, type, params)
//!     │
//!     ├─ reference descriptor chain          (pins every level immutable)
//!     ├─ size_for = header + payload + Σ plugin blocks over the chain
//!     ├─ allocate                            (allocator adapter)
//!     ├─ write header                        (type handle + debug owner)
//!     ├─ construct payload                   (payload capability set)
//!     ├─ construct plugin blocks root→leaf   (each block all-or-nothing)
//!     │
//!     └─ on any failure: unwind in exact reverse order,
//!        free the memory, dereference the chain, report the error
//! ```
//!
//! Destruction is the exact mirror: plugin blocks leaf→root, payload,
//! dereference, free.
//!
//! ## Locking
//!
//! The global lock guards the descriptor table and sibling-name
//! uniqueness. Each descriptor carries its own lock guarding its mutable
//! state. The global lock is never requested while a descriptor lock is
//! held; chain walks go through direct parent pointers instead of the
//! table, which keeps the hierarchy one-directional.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::alloc::{MemoryAllocator, SystemAllocator};
use crate::descriptor::{TypeDescriptor, TypeId};
use crate::error::{TypeError, TypeResult};
use crate::lock::{
    LockProvider, NoopLockProvider, ReadScope, RwLockProvider, ShareableLocks, WriteScope,
};
use crate::object::{header_size, ObjectHeader, ObjectRef};
use crate::payload::{
    AbstractPayload, DynamicStructPayload, Host, Params, PayloadInterface, SizeMeta,
    StructPayload, TypedPayload,
};
use crate::plugin::{PluginId, PluginInterface, PluginOffset, StructPlugin, ANONYMOUS_PLUGIN_ID};

/// Alignment of every object allocation: the target pointer size.
pub const STANDARD_OBJECT_ALIGNMENT: usize = std::mem::size_of::<*const ()>();

const FIRST_GENERATION: u32 = 1;

// ============================================================================
// Slot table
// ============================================================================

struct Slot<K> {
    generation: u32,
    entry: Option<Box<TypeDescriptor<K>>>,
}

/// Generational slot table holding every registered descriptor. Boxing
/// keeps descriptor addresses stable across table growth; generations
/// invalidate handles to deleted types.
struct SlotTable<K> {
    slots: Vec<Slot<K>>,
    free: Vec<u32>,
}

impl<K> SlotTable<K> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, mut descriptor: Box<TypeDescriptor<K>>) -> TypeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let id = TypeId::from_parts(index, slot.generation);
                descriptor.set_own_id(id);
                slot.entry = Some(descriptor);
                id
            }
            None => {
                let index = self.slots.len() as u32;
                let id = TypeId::from_parts(index, FIRST_GENERATION);
                descriptor.set_own_id(id);
                self.slots.push(Slot {
                    generation: FIRST_GENERATION,
                    entry: Some(descriptor),
                });
                id
            }
        }
    }

    fn remove(&mut self, id: TypeId) -> Option<Box<TypeDescriptor<K>>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        Some(entry)
    }

    fn get(&self, id: TypeId) -> Option<&TypeDescriptor<K>> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_deref()
    }

    fn id_at(&self, index: usize) -> Option<TypeId> {
        let slot = self.slots.get(index)?;
        slot.entry
            .as_ref()
            .map(|_| TypeId::from_parts(index as u32, slot.generation))
    }

    fn live_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        (0..self.slots.len()).filter_map(|index| self.id_at(index))
    }

    fn first_id(&self) -> Option<TypeId> {
        self.live_ids().next()
    }

    fn live_count(&self) -> usize {
        self.live_ids().count()
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

// ============================================================================
// Type system
// ============================================================================

/// The process-local type environment.
///
/// A `TypeSystem` is a value, not a singleton: several independent
/// systems can coexist, each with its own closed universe of types.
/// Objects must stay with the system that built them; debug builds verify
/// this through the header back-pointer.
///
/// The system is generic over its [`MemoryAllocator`] and
/// [`LockProvider`]. With the default [`NoopLockProvider`] it carries no
/// synchronization cost and is `!Sync`; build it with a
/// [`RwLockProvider`] (see [`SharedTypeSystem`]) to share it across
/// threads.
pub struct TypeSystem<A: MemoryAllocator = SystemAllocator, L: LockProvider = NoopLockProvider> {
    allocator: A,
    lock_provider: L,
    main_lock: L::Lock,
    table: UnsafeCell<SlotTable<L::Lock>>,
}

/// A type system shared across threads.
pub type SharedTypeSystem = TypeSystem<SystemAllocator, RwLockProvider>;

// Safety: descriptor and table state is guarded by the provider's locks
// plus atomics; moving the system between threads is sound whenever its
// components can move.
unsafe impl<A, L> Send for TypeSystem<A, L>
where
    A: MemoryAllocator + Send,
    L: LockProvider + Send,
    L::Lock: Send,
{
}

// Safety: shared access is only sound when the lock provider really
// excludes, which is exactly what `ShareableLocks` promises.
unsafe impl<A, L> Sync for TypeSystem<A, L>
where
    A: MemoryAllocator + Sync,
    L: ShareableLocks + Sync,
    L::Lock: Send + Sync,
{
}

impl TypeSystem {
    /// Single-threaded system over the default allocator.
    pub fn new() -> Self {
        TypeSystemBuilder::new().build()
    }

    /// Start building a system with a custom allocator or lock provider.
    pub fn builder() -> TypeSystemBuilder {
        TypeSystemBuilder::new()
    }
}

impl Default for TypeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedTypeSystem {
    /// Thread-safe system over the default allocator and parking_lot
    /// locks.
    pub fn new_shared() -> Self {
        TypeSystemBuilder::new()
            .lock_provider(RwLockProvider)
            .build()
    }
}

impl<A: MemoryAllocator, L: LockProvider> TypeSystem<A, L> {
    // ------------------------------------------------------------------
    // Table access
    // ------------------------------------------------------------------

    /// Safety: caller must hold the main lock (read or write).
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self) -> &mut SlotTable<L::Lock> {
        &mut *self.table.get()
    }

    /// Safety: caller must hold the main lock (read or write), or be in a
    /// context where the table cannot change (e.g. `&mut self`).
    unsafe fn table_ref(&self) -> &SlotTable<L::Lock> {
        &*self.table.get()
    }

    /// Resolve a handle to its descriptor. Takes the main read lock for
    /// the table access only; the returned reference stays valid until
    /// the type is deleted, which the deletion contract forbids while the
    /// type is in use.
    fn descriptor(&self, id: TypeId) -> TypeResult<&TypeDescriptor<L::Lock>> {
        let _read = ReadScope::enter(&self.lock_provider, Some(&self.main_lock));
        // Safety: main read lock held.
        let table = unsafe { self.table_ref() };
        let descriptor = table.get(id).ok_or(TypeError::UnknownType)?;
        // Safety: boxed descriptors have stable addresses; lifetime is
        // bounded by &self and the deletion contract.
        Ok(unsafe { &*(descriptor as *const TypeDescriptor<L::Lock>) })
    }

    fn find_in(table: &SlotTable<L::Lock>, name: &str, parent: Option<TypeId>) -> Option<TypeId> {
        table.live_ids().find(|&id| {
            let descriptor = table.get(id).expect("live id resolves");
            descriptor.parent_id() == parent && &*descriptor.name == name
        })
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a type under `parent` with caller-supplied payload ops.
    ///
    /// Fails with [`TypeError::NameConflict`] when a sibling with the
    /// same name already exists under `parent`.
    pub fn register_type(
        &self,
        name: &str,
        payload_ops: Box<dyn PayloadInterface>,
        parent: Option<TypeId>,
    ) -> TypeResult<TypeId> {
        self.register_type_inner(name, payload_ops, parent, false)
    }

    /// Register a fixed-size struct type. `T`'s size is reported for
    /// every instance.
    pub fn register_struct_type<T: TypedPayload>(
        &self,
        name: &str,
        parent: Option<TypeId>,
    ) -> TypeResult<TypeId> {
        self.register_type(name, Box::new(StructPayload::<T>::new()), parent)
    }

    /// Register a struct type that reserves `size` bytes per instance,
    /// with `T` constructed at the front of the payload.
    pub fn register_struct_type_with_size<T: TypedPayload>(
        &self,
        name: &str,
        parent: Option<TypeId>,
        size: usize,
    ) -> TypeResult<TypeId> {
        self.register_type(name, Box::new(StructPayload::<T>::with_size(size)), parent)
    }

    /// Register a struct type whose payload size is decided by `meta`.
    /// The descriptor holds its `Arc` reference until teardown.
    pub fn register_dynamic_struct_type<T: TypedPayload>(
        &self,
        name: &str,
        meta: Arc<dyn SizeMeta>,
        parent: Option<TypeId>,
    ) -> TypeResult<TypeId> {
        self.register_type(name, Box::new(DynamicStructPayload::<T>::new(meta)), parent)
    }

    /// Register an abstract type: it cannot be constructed or cloned, and
    /// exists to anchor an inheritance subtree.
    pub fn register_abstract_type<T: Send + Sync + 'static>(
        &self,
        name: &str,
        parent: Option<TypeId>,
    ) -> TypeResult<TypeId> {
        self.register_type_inner(name, Box::new(AbstractPayload::<T>::new()), parent, true)
    }

    fn register_type_inner(
        &self,
        name: &str,
        payload_ops: Box<dyn PayloadInterface>,
        parent: Option<TypeId>,
        abstract_type: bool,
    ) -> TypeResult<TypeId> {
        let _write = WriteScope::enter(&self.lock_provider, Some(&self.main_lock));
        // Safety: main write lock held.
        let table = unsafe { self.table_mut() };

        if let Some(parent) = parent {
            table.get(parent).ok_or(TypeError::UnknownType)?;
        }
        if Self::find_in(table, name, parent).is_some() {
            warn!(name, "type registration rejected: sibling name collision");
            return Err(TypeError::NameConflict(name.to_string()));
        }

        let descriptor = Box::new(TypeDescriptor::new(
            Arc::from(name),
            payload_ops,
            self.lock_provider.create_lock(),
        ));
        if abstract_type {
            descriptor.mark_abstract();
        }
        let id = table.insert(descriptor);

        if let Some(parent) = parent {
            let parent_descriptor = table.get(parent).expect("validated above");
            let descriptor = table.get(id).expect("just inserted");
            descriptor.set_parent(Some(parent_descriptor));
            parent_descriptor.inherit_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(name, ?parent, "registered type");
        Ok(id)
    }

    /// Remove a type from the system. The type's own parent link is
    /// severed and every direct child is re-parented to the root.
    ///
    /// The caller must guarantee that no live object references the type
    /// and that no other thread still addresses it; deleting a type that
    /// is in use is undefined behavior, exactly as freeing memory that is
    /// in use.
    pub fn delete_type(&self, id: TypeId) -> TypeResult<()> {
        let _sys = WriteScope::enter(&self.lock_provider, Some(&self.main_lock));
        {
            // Safety: main write lock held.
            let table = unsafe { self.table_ref() };
            let descriptor = table.get(id).ok_or(TypeError::UnknownType)?;
            debug_assert!(
                !descriptor.is_immutable(),
                "cannot delete a type with live instances"
            );

            if let Some(parent) = descriptor.parent() {
                let _parent_lock = WriteScope::enter(&self.lock_provider, Some(&parent.lock));
                parent.inherit_count.fetch_sub(1, Ordering::Relaxed);
                descriptor.set_parent(None);
            }

            let children: Vec<TypeId> = table
                .live_ids()
                .filter(|&child| {
                    table
                        .get(child)
                        .is_some_and(|d| d.parent_id() == Some(id))
                })
                .collect();
            for child in children {
                self.set_parent_locked(child, None)?;
            }

            self.lock_provider.close_lock(&descriptor.lock);
        }

        // Safety: main write lock still held; all shared references into
        // the table from the block above are gone.
        let removed = unsafe { self.table_mut() }.remove(id);
        debug_assert!(removed.is_some());
        drop(removed);

        debug!(?id, "deleted type");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Find the type with `name` directly under `parent` (`None` for the
    /// root namespace).
    pub fn find(&self, name: &str, parent: Option<TypeId>) -> Option<TypeId> {
        let _read = ReadScope::enter(&self.lock_provider, Some(&self.main_lock));
        // Safety: main read lock held.
        let table = unsafe { self.table_ref() };
        Self::find_in(table, name, parent)
    }

    /// Resolve a `::`-separated type path, starting at `base`.
    ///
    /// Every token must name a child of the previous one. An empty path,
    /// an empty token (including one produced by a trailing `::`), or a
    /// missing type resolves to `None`.
    pub fn resolve(&self, path: &str, base: Option<TypeId>) -> Option<TypeId> {
        if path.is_empty() {
            return None;
        }
        let mut current = base;
        for token in path.split("::") {
            if token.is_empty() {
                return None;
            }
            current = Some(self.find(token, current)?);
        }
        current
    }

    /// Iterate over every registered type. The iterator holds the global
    /// read lock for its lifetime; registration, deletion and
    /// re-parenting block until it is dropped.
    pub fn types(&self) -> TypeIter<'_, A, L> {
        let scope = ReadScope::enter(&self.lock_provider, Some(&self.main_lock));
        TypeIter {
            system: self,
            _scope: scope,
            next: 0,
        }
    }

    /// Number of registered types.
    pub fn type_count(&self) -> usize {
        let _read = ReadScope::enter(&self.lock_provider, Some(&self.main_lock));
        // Safety: main read lock held.
        unsafe { self.table_ref() }.live_count()
    }

    // ------------------------------------------------------------------
    // Inheritance editor
    // ------------------------------------------------------------------

    /// Re-parent `sub` under `new_parent` (`None` detaches it to the
    /// root).
    ///
    /// Fails with [`TypeError::NameConflict`] when `new_parent` already
    /// has a different child named like `sub`. Re-parenting a referenced
    /// type or forming a cycle is an invariant breach and asserts.
    pub fn set_parent(&self, sub: TypeId, new_parent: Option<TypeId>) -> TypeResult<()> {
        let _sys = WriteScope::enter(&self.lock_provider, Some(&self.main_lock));
        self.set_parent_locked(sub, new_parent)
    }

    /// Core of the inheritance editor; caller holds the main write lock.
    fn set_parent_locked(&self, sub: TypeId, new_parent: Option<TypeId>) -> TypeResult<()> {
        // Safety: main write lock held by the caller.
        let table = unsafe { self.table_ref() };
        let descriptor = table.get(sub).ok_or(TypeError::UnknownType)?;
        let new_parent_descriptor = match new_parent {
            Some(parent) => Some(table.get(parent).ok_or(TypeError::UnknownType)?),
            None => None,
        };

        if let Some(parent) = new_parent {
            if let Some(existing) = Self::find_in(table, &descriptor.name, Some(parent)) {
                if existing != sub {
                    return Err(TypeError::NameConflict(descriptor.name.to_string()));
                }
            }
        }

        let _sub_lock = WriteScope::enter(&self.lock_provider, Some(&descriptor.lock));

        // Checked under the write lock: ref/unref bump the count under
        // this same lock, so a referenced type cannot slip past here.
        assert!(
            !descriptor.is_immutable(),
            "cannot re-parent a type with live instances"
        );

        let previous = descriptor.parent();
        if previous.map(TypeDescriptor::own_id) == new_parent {
            return Ok(());
        }

        let _previous_lock =
            WriteScope::enter(&self.lock_provider, previous.map(|p| &p.lock));
        let _new_lock = WriteScope::enter(
            &self.lock_provider,
            new_parent_descriptor.map(|p| &p.lock),
        );

        if let Some(new_parent_descriptor) = new_parent_descriptor {
            assert!(
                !Self::chain_has(new_parent_descriptor, sub),
                "re-parenting would create an inheritance cycle"
            );
        }

        if let Some(previous) = previous {
            previous.inherit_count.fetch_sub(1, Ordering::Relaxed);
        }
        descriptor.set_parent(new_parent_descriptor);
        if let Some(new_parent_descriptor) = new_parent_descriptor {
            new_parent_descriptor
                .inherit_count
                .fetch_add(1, Ordering::Relaxed);
        }

        trace!(?sub, ?new_parent, "re-parented type");
        Ok(())
    }

    /// Whether `needle` appears in the chain starting at `descriptor`
    /// (inclusive).
    fn chain_has(descriptor: &TypeDescriptor<L::Lock>, needle: TypeId) -> bool {
        let mut current = Some(descriptor);
        while let Some(descriptor) = current {
            if descriptor.own_id() == needle {
                return true;
            }
            current = descriptor.parent();
        }
        false
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Whether two handles name the same registered type.
    pub fn is_same(&self, first: TypeId, second: TypeId) -> bool {
        first == second
    }

    /// Whether `sub` is `base` or inherits from it, directly or
    /// transitively.
    pub fn is_inheriting_from(&self, base: TypeId, sub: TypeId) -> TypeResult<bool> {
        self.descriptor(base)?;
        let descriptor = self.descriptor(sub)?;
        Ok(self.inherits(descriptor, base))
    }

    fn inherits(&self, descriptor: &TypeDescriptor<L::Lock>, base: TypeId) -> bool {
        if descriptor.own_id() == base {
            return true;
        }
        let _read = ReadScope::enter(&self.lock_provider, Some(&descriptor.lock));
        match descriptor.parent() {
            Some(parent) => self.inherits(parent, base),
            None => false,
        }
    }

    /// The name a type was registered under.
    pub fn type_name(&self, id: TypeId) -> TypeResult<Arc<str>> {
        Ok(Arc::clone(&self.descriptor(id)?.name))
    }

    /// The direct parent, if any.
    pub fn parent_of(&self, id: TypeId) -> TypeResult<Option<TypeId>> {
        Ok(self.descriptor(id)?.parent_id())
    }

    /// Number of live objects referencing the type, transitively through
    /// descendants.
    pub fn ref_count_of(&self, id: TypeId) -> TypeResult<u32> {
        Ok(self.descriptor(id)?.ref_count.load(Ordering::Relaxed))
    }

    /// Whether no registered type inherits from this one.
    pub fn is_end_type(&self, id: TypeId) -> TypeResult<bool> {
        Ok(self.descriptor(id)?.is_end_type())
    }

    /// Advisory exclusivity flag; the runtime can use it to gate object
    /// creation policies. The type system itself never reads it.
    pub fn set_exclusive(&self, id: TypeId, exclusive: bool) -> TypeResult<()> {
        self.descriptor(id)?.set_exclusive(exclusive);
        Ok(())
    }

    /// Read the advisory exclusivity flag.
    pub fn is_exclusive(&self, id: TypeId) -> TypeResult<bool> {
        Ok(self.descriptor(id)?.is_exclusive())
    }

    /// Whether the type was registered abstract.
    pub fn is_abstract(&self, id: TypeId) -> TypeResult<bool> {
        Ok(self.descriptor(id)?.is_abstract())
    }

    /// The allocator every object allocation goes through.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    // ------------------------------------------------------------------
    // Plugin registration
    // ------------------------------------------------------------------

    /// Register an anonymous plugin of `size` bytes against a type. The
    /// interface is owned by the descriptor from here on.
    ///
    /// The type must have no live instances; registering a plugin on a
    /// referenced type asserts.
    pub fn register_plugin(
        &self,
        id: TypeId,
        size: usize,
        iface: Box<dyn PluginInterface>,
    ) -> TypeResult<PluginOffset> {
        self.register_plugin_with_id(id, size, ANONYMOUS_PLUGIN_ID, iface)
    }

    /// Register a plugin under an explicit key.
    pub fn register_plugin_with_id(
        &self,
        id: TypeId,
        size: usize,
        plugin_id: PluginId,
        iface: Box<dyn PluginInterface>,
    ) -> TypeResult<PluginOffset> {
        let descriptor = self.descriptor(id)?;
        let _write = WriteScope::enter(&self.lock_provider, Some(&descriptor.lock));
        assert!(
            !descriptor.is_immutable(),
            "cannot register a plugin on a type with live instances"
        );
        // Safety: write lock held, descriptor unreferenced.
        Ok(unsafe { descriptor.registry_mut() }.register_plugin(size, plugin_id, iface))
    }

    /// Register a plain struct plugin: default-constructed with the
    /// object, dropped with it, clone-assigned on clone.
    pub fn register_struct_plugin<S: Default + Clone + Send + Sync + 'static>(
        &self,
        id: TypeId,
    ) -> TypeResult<PluginOffset> {
        self.register_plugin(id, std::mem::size_of::<S>(), Box::new(StructPlugin::<S>::new()))
    }

    /// Register a caller-defined interface by value; ownership moves to
    /// the descriptor, which drops it on unregistration or teardown.
    pub fn register_custom_plugin<I: PluginInterface + 'static>(
        &self,
        id: TypeId,
        size: usize,
        iface: I,
    ) -> TypeResult<PluginOffset> {
        self.register_plugin(id, size, Box::new(iface))
    }

    /// Revoke a plugin registration. The type must have no live
    /// instances. Returns `false` for tokens that never registered or
    /// were already revoked.
    pub fn unregister_plugin(&self, id: TypeId, token: PluginOffset) -> TypeResult<bool> {
        let descriptor = self.descriptor(id)?;
        let _write = WriteScope::enter(&self.lock_provider, Some(&descriptor.lock));
        assert!(
            !descriptor.is_immutable(),
            "cannot unregister a plugin on a type with live instances"
        );
        // Safety: write lock held, descriptor unreferenced.
        Ok(unsafe { descriptor.registry_mut() }.unregister_plugin(token))
    }

    // ------------------------------------------------------------------
    // Layout engine
    // ------------------------------------------------------------------

    /// Total allocation size of a prospective object of `id` constructed
    /// with `params`: header, payload, and the plugin blocks of every
    /// type in the inheritance chain. Returns 0 when the payload reports
    /// zero size, marking the type unconstructible.
    pub fn size_for(&self, host: Host<'_>, id: TypeId, params: Params<'_>) -> TypeResult<usize> {
        let descriptor = self.descriptor(id)?;
        Ok(self.size_for_descriptor(descriptor, host, params))
    }

    fn size_for_descriptor(
        &self,
        descriptor: &TypeDescriptor<L::Lock>,
        host: Host<'_>,
        params: Params<'_>,
    ) -> usize {
        let payload_size = descriptor.payload_ops.size(host, params);
        if payload_size == 0 {
            return 0;
        }
        header_size() + payload_size + self.chain_plugin_size(descriptor)
    }

    /// Sum of the plugin block sizes over the whole chain. Each level's
    /// read lock is held while its registry is inspected, so a concurrent
    /// plugin registration on an unreferenced ancestor cannot race the
    /// walk.
    fn chain_plugin_size(&self, descriptor: &TypeDescriptor<L::Lock>) -> usize {
        let mut total = 0;
        let mut current = Some(descriptor);
        while let Some(level) = current {
            let _read = ReadScope::enter(&self.lock_provider, Some(&level.lock));
            // Safety: level read lock held.
            total += unsafe { level.registry() }.size_fixed();
            current = level.parent();
        }
        total
    }

    /// Total allocation size of an existing object, measured through
    /// `size_by_instance` and the per-object plugin block queries. For
    /// any object this equals the `size_for` it was constructed with.
    ///
    /// # Safety
    ///
    /// `object` must be a live object of this system.
    pub unsafe fn size_of_object(&self, host: Host<'_>, object: ObjectRef) -> TypeResult<usize> {
        let descriptor = self.descriptor(object.type_id())?;
        let payload_size = descriptor
            .payload_ops
            .size_by_instance(host, object.payload());
        if payload_size == 0 {
            return Ok(0);
        }
        let mut total = header_size() + payload_size;
        let mut current = Some(descriptor);
        while let Some(level) = current {
            let _read = ReadScope::enter(&self.lock_provider, Some(&level.lock));
            total += level.registry().size_for_object(object);
            current = level.parent();
        }
        Ok(total)
    }

    /// Resolve a plugin registration to its byte location inside an
    /// object. `id` names the chain level the plugin was registered on.
    /// Returns `None` for the invalid token.
    ///
    /// # Safety
    ///
    /// `object` must be a live object of this system whose chain contains
    /// `id`.
    pub unsafe fn resolve_plugin(
        &self,
        host: Host<'_>,
        object: ObjectRef,
        id: TypeId,
        token: PluginOffset,
    ) -> Option<NonNull<u8>> {
        if !token.is_valid() {
            return None;
        }
        let target = self.descriptor(id).ok()?;
        let leaf = self.descriptor(object.type_id()).ok()?;

        let mut base = header_size()
            + leaf.payload_ops.size_by_instance(host, object.payload());
        let chain = Self::collect_chain(target);
        for &level in &chain[..chain.len() - 1] {
            let _read = ReadScope::enter(&self.lock_provider, Some(&level.lock));
            base += level.registry().size_for_object(object);
        }

        let intra = {
            let _read = ReadScope::enter(&self.lock_provider, Some(&target.lock));
            target.registry().resolve_offset(token)?
        };
        Some(NonNull::new_unchecked(
            object.as_raw().as_ptr().add(base + intra),
        ))
    }

    /// The chain from root ancestor to `leaf` inclusive, root first.
    fn collect_chain(leaf: &TypeDescriptor<L::Lock>) -> Vec<&TypeDescriptor<L::Lock>> {
        let mut chain = vec![leaf];
        let mut current = leaf;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    // ------------------------------------------------------------------
    // Reference accounting
    // ------------------------------------------------------------------

    /// Pin the whole chain: every level's count rises by one, making
    /// every level immutable.
    fn reference_chain(&self, descriptor: &TypeDescriptor<L::Lock>) {
        let _write = WriteScope::enter(&self.lock_provider, Some(&descriptor.lock));
        descriptor.ref_count.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = descriptor.parent() {
            self.reference_chain(parent);
        }
    }

    /// Release the chain, parents first, mirroring `reference_chain`.
    fn dereference_chain(&self, descriptor: &TypeDescriptor<L::Lock>) {
        let _write = WriteScope::enter(&self.lock_provider, Some(&descriptor.lock));
        if let Some(parent) = descriptor.parent() {
            self.dereference_chain(parent);
        }
        descriptor.ref_count.fetch_sub(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Object lifecycle
    // ------------------------------------------------------------------

    /// Construct an object of `id` on the heap.
    ///
    /// On any failure the allocation, payload and plugin state are fully
    /// unwound and every chain reference is released before the error is
    /// returned.
    pub fn construct(
        &self,
        host: Host<'_>,
        id: TypeId,
        params: Params<'_>,
    ) -> TypeResult<ObjectRef> {
        let descriptor = self.descriptor(id)?;
        // Hold an extra reference across sizing and allocation so the
        // chain cannot change between the size query and placement.
        self.reference_chain(descriptor);
        let result = self.construct_on_heap(host, id, descriptor, params);
        self.dereference_chain(descriptor);
        result
    }

    fn construct_on_heap(
        &self,
        host: Host<'_>,
        id: TypeId,
        descriptor: &TypeDescriptor<L::Lock>,
        params: Params<'_>,
    ) -> TypeResult<ObjectRef> {
        if descriptor.is_abstract() {
            return Err(TypeError::AbstractConstruction);
        }
        let size = self.size_for_descriptor(descriptor, host, params);
        if size == 0 {
            return Err(TypeError::Unconstructible);
        }
        let mem = self
            .allocator
            .allocate(size, STANDARD_OBJECT_ALIGNMENT)
            .ok_or(TypeError::AllocationFailure)?;
        // Safety: mem spans `size` bytes, which is exactly the layout the
        // placement protocol writes.
        match unsafe { self.construct_placement_inner(host, mem, id, descriptor, params) } {
            Ok(object) => Ok(object),
            Err(err) => {
                // Safety: mem came from this allocator, same size/align.
                unsafe { self.allocator.free(mem, size, STANDARD_OBJECT_ALIGNMENT) };
                Err(err)
            }
        }
    }

    /// Construct an object of `id` into caller-provided memory.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for writes of `size_for(host, id, params)`
    /// bytes, aligned to [`STANDARD_OBJECT_ALIGNMENT`], and unused.
    pub unsafe fn construct_placement(
        &self,
        host: Host<'_>,
        mem: NonNull<u8>,
        id: TypeId,
        params: Params<'_>,
    ) -> TypeResult<ObjectRef> {
        let descriptor = self.descriptor(id)?;
        self.construct_placement_inner(host, mem, id, descriptor, params)
    }

    unsafe fn construct_placement_inner(
        &self,
        host: Host<'_>,
        mem: NonNull<u8>,
        id: TypeId,
        descriptor: &TypeDescriptor<L::Lock>,
        params: Params<'_>,
    ) -> TypeResult<ObjectRef> {
        self.reference_chain(descriptor);

        mem.cast::<ObjectHeader>()
            .as_ptr()
            .write(ObjectHeader::new(id, self as *const Self as *const ()));
        let object = ObjectRef::from_raw(mem);
        let payload = object.payload();

        if let Err(err) = descriptor.payload_ops.construct(payload, host, params) {
            self.dereference_chain(descriptor);
            return Err(err);
        }
        debug_assert_eq!(
            descriptor.payload_ops.size(host, params),
            descriptor.payload_ops.size_by_instance(host, payload),
            "payload size must not depend on the instance"
        );

        if !self.construct_plugin_chain(host, descriptor, object) {
            descriptor.payload_ops.destruct(payload);
            self.dereference_chain(descriptor);
            return Err(TypeError::PluginConstruction);
        }

        Ok(object)
    }

    /// Clone `src` into a fresh heap allocation. Plugin state is copied
    /// through each plugin's `assign` after the whole block chain
    /// constructed; failure unwinds like a construction failure.
    ///
    /// # Safety
    ///
    /// `src` must be a live object of this system.
    pub unsafe fn clone_object(&self, host: Host<'_>, src: ObjectRef) -> TypeResult<ObjectRef> {
        let size = self.size_of_object(host, src)?;
        if size == 0 {
            return Err(TypeError::Unconstructible);
        }
        let mem = self
            .allocator
            .allocate(size, STANDARD_OBJECT_ALIGNMENT)
            .ok_or(TypeError::AllocationFailure)?;
        match self.clone_placement_inner(host, mem, src) {
            Ok(object) => Ok(object),
            Err(err) => {
                self.allocator.free(mem, size, STANDARD_OBJECT_ALIGNMENT);
                Err(err)
            }
        }
    }

    /// Clone `src` into caller-provided memory.
    ///
    /// # Safety
    ///
    /// `src` must be a live object of this system; `mem` must be valid
    /// for writes of `size_of_object(host, src)` bytes, aligned to
    /// [`STANDARD_OBJECT_ALIGNMENT`], and unused.
    pub unsafe fn clone_placement(
        &self,
        host: Host<'_>,
        mem: NonNull<u8>,
        src: ObjectRef,
    ) -> TypeResult<ObjectRef> {
        self.clone_placement_inner(host, mem, src)
    }

    unsafe fn clone_placement_inner(
        &self,
        host: Host<'_>,
        mem: NonNull<u8>,
        src: ObjectRef,
    ) -> TypeResult<ObjectRef> {
        let id = src.type_id();
        let descriptor = self.descriptor(id)?;
        self.reference_chain(descriptor);

        mem.cast::<ObjectHeader>()
            .as_ptr()
            .write(ObjectHeader::new(id, self as *const Self as *const ()));
        let object = ObjectRef::from_raw(mem);
        let payload = object.payload();

        if let Err(err) = descriptor.payload_ops.copy_construct(payload, src.payload()) {
            self.dereference_chain(descriptor);
            return Err(err);
        }

        if !self.construct_plugin_chain(host, descriptor, object) {
            descriptor.payload_ops.destruct(payload);
            self.dereference_chain(descriptor);
            return Err(TypeError::PluginConstruction);
        }

        if !self.assign_plugin_chain(host, descriptor, object, src) {
            self.destruct_plugin_chain(host, descriptor, object);
            descriptor.payload_ops.destruct(payload);
            self.dereference_chain(descriptor);
            return Err(TypeError::PluginConstruction);
        }

        Ok(object)
    }

    /// Destroy an object and free its allocation.
    ///
    /// # Safety
    ///
    /// `object` must be a live heap object of this system, constructed by
    /// [`construct`](Self::construct) or [`clone_object`](Self::clone_object).
    /// It is dead after this call.
    pub unsafe fn destroy(&self, host: Host<'_>, object: ObjectRef) -> TypeResult<()> {
        let size = self.size_of_object(host, object)?;
        self.destroy_placement(host, object)?;
        self.allocator
            .free(object.as_raw(), size, STANDARD_OBJECT_ALIGNMENT);
        Ok(())
    }

    /// Destroy an object built into caller-provided memory. The memory
    /// itself stays with the caller.
    ///
    /// # Safety
    ///
    /// `object` must be a live object of this system. It is dead after
    /// this call.
    pub unsafe fn destroy_placement(&self, host: Host<'_>, object: ObjectRef) -> TypeResult<()> {
        self.check_owner(object);
        let descriptor = self.descriptor(object.type_id())?;

        self.destruct_plugin_chain(host, descriptor, object);
        descriptor.payload_ops.destruct(object.payload());
        self.dereference_chain(descriptor);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plugin chain operations
    // ------------------------------------------------------------------

    /// Construct the plugin block of every chain level, root first. On
    /// failure at any level, the levels already constructed are destroyed
    /// leaf-first and `false` is reported; the failing level's own block
    /// already unwound internally.
    ///
    /// Safety: the chain is referenced; `object`'s allocation covers the
    /// full layout.
    unsafe fn construct_plugin_chain(
        &self,
        host: Host<'_>,
        leaf: &TypeDescriptor<L::Lock>,
        object: ObjectRef,
    ) -> bool {
        let chain = Self::collect_chain(leaf);
        let mut base = header_size()
            + leaf.payload_ops.size_by_instance(host, object.payload());
        let mut constructed: Vec<(usize, &TypeDescriptor<L::Lock>)> = Vec::new();

        for &level in &chain {
            if !level.registry().construct_block(object, base, host) {
                trace!(
                    level = &*level.name,
                    "plugin block construction failed; unwinding"
                );
                for (done_base, done) in constructed.into_iter().rev() {
                    done.registry().destroy_block(object, done_base, host);
                }
                return false;
            }
            constructed.push((base, level));
            base += level.registry().size_for_object(object);
        }
        true
    }

    /// Destroy every chain level's plugin block, leaf first.
    ///
    /// Safety: all blocks are constructed; the chain is referenced.
    unsafe fn destruct_plugin_chain(
        &self,
        host: Host<'_>,
        leaf: &TypeDescriptor<L::Lock>,
        object: ObjectRef,
    ) {
        let chain = Self::collect_chain(leaf);
        let mut bases = Vec::with_capacity(chain.len());
        let mut base = header_size()
            + leaf.payload_ops.size_by_instance(host, object.payload());
        for &level in &chain {
            bases.push(base);
            base += level.registry().size_for_object(object);
        }
        for (&level, base) in chain.iter().zip(bases).rev() {
            level.registry().destroy_block(object, base, host);
        }
    }

    /// Copy plugin state level by level, root first. Stops at the first
    /// rejection; the caller owns the unwind.
    ///
    /// Safety: both objects are live, of the same chain, with all blocks
    /// constructed.
    unsafe fn assign_plugin_chain(
        &self,
        host: Host<'_>,
        leaf: &TypeDescriptor<L::Lock>,
        dst: ObjectRef,
        src: ObjectRef,
    ) -> bool {
        let chain = Self::collect_chain(leaf);
        let mut base = header_size()
            + leaf.payload_ops.size_by_instance(host, dst.payload());
        for &level in &chain {
            if !level.registry().assign_block(dst, src, base, host) {
                trace!(level = &*level.name, "plugin assignment rejected clone");
                return false;
            }
            base += level.registry().size_for_object(dst);
        }
        true
    }

    // ------------------------------------------------------------------
    // Object accessors
    // ------------------------------------------------------------------

    /// The registered type an object was constructed from.
    pub fn type_of(&self, object: ObjectRef) -> TypeId {
        object.type_id()
    }

    /// The object's payload pointer.
    pub fn payload_of(&self, object: ObjectRef) -> NonNull<u8> {
        object.payload()
    }

    /// Recover an object handle from its payload pointer. Debug builds
    /// verify the object belongs to this system.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload pointer of a live object of this
    /// system.
    pub unsafe fn object_from_payload(&self, payload: NonNull<u8>) -> ObjectRef {
        let object = ObjectRef::from_payload(payload);
        self.check_owner(object);
        object
    }

    fn check_owner(&self, object: ObjectRef) {
        #[cfg(debug_assertions)]
        debug_assert!(
            object.owner() == self as *const Self as *const (),
            "object belongs to a different type system"
        );
        #[cfg(not(debug_assertions))]
        let _ = object;
    }
}

impl<A: MemoryAllocator, L: LockProvider> Drop for TypeSystem<A, L> {
    fn drop(&mut self) {
        debug!("type system shutting down; deleting remaining types");
        loop {
            let next = self.table.get_mut().first_id();
            match next {
                Some(id) => {
                    let _ = self.delete_type(id);
                }
                None => break,
            }
        }
        self.lock_provider.close_lock(&self.main_lock);
    }
}

// ============================================================================
// Iterator
// ============================================================================

/// Iterator over every registered type, in slot order.
///
/// Holds the global read lock for its lifetime; do not call mutating
/// system operations while it is alive.
pub struct TypeIter<'a, A: MemoryAllocator, L: LockProvider> {
    system: &'a TypeSystem<A, L>,
    _scope: ReadScope<'a, L>,
    next: usize,
}

impl<A: MemoryAllocator, L: LockProvider> Iterator for TypeIter<'_, A, L> {
    type Item = TypeId;

    fn next(&mut self) -> Option<TypeId> {
        // Safety: the iterator holds the main read lock.
        let table = unsafe { self.system.table_ref() };
        while self.next < table.slot_count() {
            let index = self.next;
            self.next += 1;
            if let Some(id) = table.id_at(index) {
                return Some(id);
            }
        }
        None
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder wiring a [`TypeSystem`] to its allocator and lock provider.
pub struct TypeSystemBuilder<A = SystemAllocator, L = NoopLockProvider> {
    allocator: A,
    lock_provider: L,
}

impl TypeSystemBuilder {
    /// Builder with the default allocator and no-op locks.
    pub fn new() -> Self {
        Self {
            allocator: SystemAllocator::new(),
            lock_provider: NoopLockProvider,
        }
    }
}

impl Default for TypeSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, L> TypeSystemBuilder<A, L> {
    /// Route object allocations through a custom adapter.
    pub fn allocator<A2: MemoryAllocator>(self, allocator: A2) -> TypeSystemBuilder<A2, L> {
        TypeSystemBuilder {
            allocator,
            lock_provider: self.lock_provider,
        }
    }

    /// Guard critical sections with a custom lock provider.
    pub fn lock_provider<L2: LockProvider>(self, lock_provider: L2) -> TypeSystemBuilder<A, L2> {
        TypeSystemBuilder {
            allocator: self.allocator,
            lock_provider,
        }
    }
}

impl<A: MemoryAllocator, L: LockProvider> TypeSystemBuilder<A, L> {
    /// Finish the system.
    pub fn build(self) -> TypeSystem<A, L> {
        let main_lock = self.lock_provider.create_lock();
        TypeSystem {
            allocator: self.allocator,
            lock_provider: self.lock_provider,
            main_lock,
            table: UnsafeCell::new(SlotTable::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    impl TypedPayload for Marker {
        fn construct(_host: Host<'_>, _params: Params<'_>) -> TypeResult<Self> {
            Ok(Marker)
        }
    }

    struct Wide(u64);

    impl TypedPayload for Wide {
        fn construct(_host: Host<'_>, _params: Params<'_>) -> TypeResult<Self> {
            Ok(Wide(0))
        }
    }

    #[test]
    fn test_register_and_find() {
        let sys = TypeSystem::new();
        let id = sys.register_struct_type::<Wide>("Entity", None).unwrap();
        assert_eq!(sys.find("Entity", None), Some(id));
        assert_eq!(sys.find("Entity", Some(id)), None);
        assert_eq!(&*sys.type_name(id).unwrap(), "Entity");
    }

    #[test]
    fn test_sibling_name_conflict() {
        let sys = TypeSystem::new();
        sys.register_struct_type::<Wide>("T", None).unwrap();
        let err = sys.register_struct_type::<Wide>("T", None).unwrap_err();
        assert_eq!(err, TypeError::NameConflict("T".into()));
        assert_eq!(sys.types().count(), 1);
    }

    #[test]
    fn test_same_name_under_distinct_parents() {
        let sys = TypeSystem::new();
        let a = sys.register_struct_type::<Wide>("A", None).unwrap();
        let b = sys.register_struct_type::<Wide>("B", None).unwrap();
        let child_a = sys.register_struct_type::<Wide>("Node", Some(a)).unwrap();
        let child_b = sys.register_struct_type::<Wide>("Node", Some(b)).unwrap();
        assert_ne!(child_a, child_b);
        assert_eq!(sys.find("Node", Some(a)), Some(child_a));
        assert_eq!(sys.find("Node", Some(b)), Some(child_b));
    }

    #[test]
    fn test_stale_handle_after_delete() {
        let sys = TypeSystem::new();
        let id = sys.register_struct_type::<Wide>("Gone", None).unwrap();
        sys.delete_type(id).unwrap();
        assert_eq!(sys.type_name(id).unwrap_err(), TypeError::UnknownType);

        // A new registration reusing the slot is not confused with the
        // deleted type.
        let replacement = sys.register_struct_type::<Wide>("Fresh", None).unwrap();
        assert_ne!(replacement, id);
        assert_eq!(sys.type_name(id).unwrap_err(), TypeError::UnknownType);
    }

    #[test]
    fn test_delete_reparents_children_to_root() {
        let sys = TypeSystem::new();
        let base = sys.register_struct_type::<Wide>("Base", None).unwrap();
        let child = sys.register_struct_type::<Wide>("Child", Some(base)).unwrap();

        sys.delete_type(base).unwrap();
        assert_eq!(sys.parent_of(child).unwrap(), None);
        assert!(sys.is_end_type(child).unwrap());
    }

    #[test]
    fn test_reparent_cycle_asserts() {
        let sys = TypeSystem::new();
        let a = sys.register_struct_type::<Wide>("A", None).unwrap();
        let b = sys.register_struct_type::<Wide>("B", Some(a)).unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sys.set_parent(a, Some(b))
        }));
        assert!(outcome.is_err());
    }

    #[test]
    fn test_reparent_updates_counts() {
        let sys = TypeSystem::new();
        let a = sys.register_struct_type::<Wide>("A", None).unwrap();
        let b = sys.register_struct_type::<Wide>("B", None).unwrap();
        let child = sys.register_struct_type::<Wide>("C", Some(a)).unwrap();

        assert!(!sys.is_end_type(a).unwrap());
        sys.set_parent(child, Some(b)).unwrap();
        assert!(sys.is_end_type(a).unwrap());
        assert!(!sys.is_end_type(b).unwrap());
        assert_eq!(sys.parent_of(child).unwrap(), Some(b));
    }

    #[test]
    fn test_reparent_to_same_parent_is_noop() {
        let sys = TypeSystem::new();
        let a = sys.register_struct_type::<Wide>("A", None).unwrap();
        let child = sys.register_struct_type::<Wide>("C", Some(a)).unwrap();
        sys.set_parent(child, Some(a)).unwrap();
        assert_eq!(sys.parent_of(child).unwrap(), Some(a));
    }

    #[test]
    fn test_resolve_paths() {
        let sys = TypeSystem::new();
        let a = sys.register_struct_type::<Wide>("A", None).unwrap();
        let b = sys.register_struct_type::<Wide>("B", Some(a)).unwrap();
        let c = sys.register_struct_type::<Wide>("C", Some(b)).unwrap();

        assert_eq!(sys.resolve("A::B::C", None), Some(c));
        assert_eq!(sys.resolve("B::C", Some(a)), Some(c));
        assert_eq!(sys.resolve("A::X::C", None), None);
        assert_eq!(sys.resolve("A::", None), None);
        assert_eq!(sys.resolve("", None), None);
    }

    #[test]
    fn test_inheritance_queries() {
        let sys = TypeSystem::new();
        let a = sys.register_struct_type::<Wide>("A", None).unwrap();
        let b = sys.register_struct_type::<Wide>("B", Some(a)).unwrap();
        let c = sys.register_struct_type::<Wide>("C", Some(b)).unwrap();

        assert!(sys.is_inheriting_from(a, c).unwrap());
        assert!(sys.is_inheriting_from(a, a).unwrap());
        assert!(!sys.is_inheriting_from(c, a).unwrap());
        assert!(sys.is_same(b, b));
        assert!(!sys.is_same(a, b));
    }

    #[test]
    fn test_exclusive_flag_round_trip() {
        let sys = TypeSystem::new();
        let id = sys.register_struct_type::<Marker>("Solo", None).unwrap();
        assert!(!sys.is_exclusive(id).unwrap());
        sys.set_exclusive(id, true).unwrap();
        assert!(sys.is_exclusive(id).unwrap());
    }

    #[test]
    fn test_zero_sized_payload_is_unconstructible() {
        let sys = TypeSystem::new();
        let id = sys.register_struct_type::<Marker>("Empty", None).unwrap();
        assert_eq!(sys.size_for(None, id, None).unwrap(), 0);
        let before = sys.allocator().stats().allocation_count;
        let err = sys.construct(None, id, None).unwrap_err();
        assert_eq!(err, TypeError::Unconstructible);
        assert_eq!(sys.allocator().stats().allocation_count, before);
        assert_eq!(sys.ref_count_of(id).unwrap(), 0);
    }

    #[test]
    fn test_iterator_sees_every_type() {
        let sys = TypeSystem::new();
        let mut expected = Vec::new();
        for name in ["One", "Two", "Three"] {
            expected.push(sys.register_struct_type::<Wide>(name, None).unwrap());
        }
        let seen: Vec<TypeId> = sys.types().collect();
        assert_eq!(seen, expected);
        assert_eq!(sys.type_count(), 3);
    }
}
