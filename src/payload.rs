//! # Payload Interfaces
//!
//! The payload is the user-defined portion of an object, placed directly
//! behind the header. Each registered type carries a [`PayloadInterface`]
//! capability set that the lifecycle engine dispatches through; it is one
//! of the two dynamic-dispatch points in the crate (the other being
//! [`crate::plugin::PluginInterface`]).
//!
//! Most embedders never implement [`PayloadInterface`] directly. The
//! adapters here cover the common shapes:
//!
//! - [`StructPayload`]: a plain Rust struct with a fixed size.
//! - [`DynamicStructPayload`]: size decided at construction time by a
//!   user-supplied [`SizeMeta`].
//! - [`AbstractPayload`]: never constructible; anchors an inheritance
//!   subtree.

use std::any::Any;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{TypeError, TypeResult};

/// Host context handed through to payload and plugin callbacks. The type
/// system never inspects it; it exists so callbacks can reach application
/// state without globals.
pub type Host<'a> = Option<&'a dyn Any>;

/// Construction parameters handed through to payload callbacks.
pub type Params<'a> = Option<&'a dyn Any>;

/// Capability set for constructing, copying, destroying and sizing the
/// payload of one registered type.
///
/// The payload size of an object is an immutable property: for any object,
/// `size` at construction time and `size_by_instance` over the object's
/// lifetime must agree. The lifecycle engine debug-asserts this.
pub trait PayloadInterface: Send + Sync {
    /// Construct the payload in place.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for writes of `self.size(host, params)` bytes.
    unsafe fn construct(
        &self,
        mem: NonNull<u8>,
        host: Host<'_>,
        params: Params<'_>,
    ) -> TypeResult<()>;

    /// Copy-construct the payload from an existing instance. Payload types
    /// that do not admit copying fail with [`TypeError::UndefinedMethod`].
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of the source payload's size; `src`
    /// must point at a live payload of this type.
    unsafe fn copy_construct(&self, dst: NonNull<u8>, src: NonNull<u8>) -> TypeResult<()>;

    /// Destroy the payload in place. Must not fail: a panicking payload
    /// destructor is an invariant breach.
    ///
    /// # Safety
    ///
    /// `mem` must point at a live payload of this type; it is dead after
    /// this call.
    unsafe fn destruct(&self, mem: NonNull<u8>);

    /// Payload size for a prospective construction. Pure. A zero return
    /// marks the type unconstructible.
    fn size(&self, host: Host<'_>, params: Params<'_>) -> usize;

    /// Payload size of an existing instance. Pure, and constant over the
    /// instance's lifetime.
    ///
    /// # Safety
    ///
    /// `payload` must point at a live payload of this type.
    unsafe fn size_by_instance(&self, host: Host<'_>, payload: NonNull<u8>) -> usize;
}

/// In-place construction protocol for typed payload structs.
///
/// Implement this for the concrete struct and register it through
/// [`crate::TypeSystem::register_struct_type`]. Copying is opt-in: the
/// default `clone_payload` reports [`TypeError::UndefinedMethod`], which
/// makes clones of the type fail; `Clone` types override it.
pub trait TypedPayload: Sized + Send + Sync + 'static {
    /// Build the payload value from the host context and parameters.
    fn construct(host: Host<'_>, params: Params<'_>) -> TypeResult<Self>;

    /// Duplicate the payload for `clone`. Defaults to unsupported.
    fn clone_payload(&self) -> TypeResult<Self> {
        Err(TypeError::UndefinedMethod)
    }
}

// ============================================================================
// Fixed-size struct payloads
// ============================================================================

/// Payload ops for a plain struct with a fixed size.
///
/// The reported size defaults to `size_of::<T>()` but can be raised with
/// [`with_size`](Self::with_size) to reserve trailing bytes the struct
/// manages itself.
pub struct StructPayload<T> {
    size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedPayload> StructPayload<T> {
    /// Ops reporting `size_of::<T>()`.
    pub fn new() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            _marker: PhantomData,
        }
    }

    /// Ops reporting an explicit size. Must be at least `size_of::<T>()`.
    pub fn with_size(size: usize) -> Self {
        assert!(
            size >= std::mem::size_of::<T>(),
            "payload size must cover the struct"
        );
        Self {
            size,
            _marker: PhantomData,
        }
    }
}

impl<T: TypedPayload> Default for StructPayload<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TypedPayload> PayloadInterface for StructPayload<T> {
    unsafe fn construct(
        &self,
        mem: NonNull<u8>,
        host: Host<'_>,
        params: Params<'_>,
    ) -> TypeResult<()> {
        let value = T::construct(host, params)?;
        mem.cast::<T>().as_ptr().write(value);
        Ok(())
    }

    unsafe fn copy_construct(&self, dst: NonNull<u8>, src: NonNull<u8>) -> TypeResult<()> {
        let value = (*src.cast::<T>().as_ptr()).clone_payload()?;
        dst.cast::<T>().as_ptr().write(value);
        Ok(())
    }

    unsafe fn destruct(&self, mem: NonNull<u8>) {
        std::ptr::drop_in_place(mem.cast::<T>().as_ptr());
    }

    fn size(&self, _host: Host<'_>, _params: Params<'_>) -> usize {
        self.size
    }

    unsafe fn size_by_instance(&self, _host: Host<'_>, _payload: NonNull<u8>) -> usize {
        self.size
    }
}

// ============================================================================
// Dynamically sized struct payloads
// ============================================================================

/// Sizing oracle for payloads whose size depends on construction
/// parameters. Both queries are pure; `size_by_instance` must return the
/// same value `size` returned when the instance was constructed.
pub trait SizeMeta: Send + Sync {
    /// Size for a prospective construction with the given parameters.
    fn size(&self, host: Host<'_>, params: Params<'_>) -> usize;

    /// Size of an existing instance.
    ///
    /// # Safety
    ///
    /// `payload` must point at a live payload of the described type.
    unsafe fn size_by_instance(&self, host: Host<'_>, payload: NonNull<u8>) -> usize;
}

/// Payload ops for a struct whose size is decided by a [`SizeMeta`].
///
/// The meta is held behind an `Arc`, so the descriptor either owns the
/// last reference (dropped at descriptor teardown) or shares it with the
/// embedder.
pub struct DynamicStructPayload<T> {
    meta: Arc<dyn SizeMeta>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedPayload> DynamicStructPayload<T> {
    /// Ops delegating both size queries to `meta`.
    pub fn new(meta: Arc<dyn SizeMeta>) -> Self {
        Self {
            meta,
            _marker: PhantomData,
        }
    }
}

impl<T: TypedPayload> PayloadInterface for DynamicStructPayload<T> {
    unsafe fn construct(
        &self,
        mem: NonNull<u8>,
        host: Host<'_>,
        params: Params<'_>,
    ) -> TypeResult<()> {
        let value = T::construct(host, params)?;
        mem.cast::<T>().as_ptr().write(value);
        Ok(())
    }

    unsafe fn copy_construct(&self, dst: NonNull<u8>, src: NonNull<u8>) -> TypeResult<()> {
        let value = (*src.cast::<T>().as_ptr()).clone_payload()?;
        dst.cast::<T>().as_ptr().write(value);
        Ok(())
    }

    unsafe fn destruct(&self, mem: NonNull<u8>) {
        std::ptr::drop_in_place(mem.cast::<T>().as_ptr());
    }

    fn size(&self, host: Host<'_>, params: Params<'_>) -> usize {
        self.meta.size(host, params)
    }

    unsafe fn size_by_instance(&self, host: Host<'_>, payload: NonNull<u8>) -> usize {
        self.meta.size_by_instance(host, payload)
    }
}

// ============================================================================
// Abstract payloads
// ============================================================================

/// Payload ops for a type that exists only to be inherited from.
///
/// Construction and copying fail with
/// [`TypeError::AbstractConstruction`]. The prospective size is still
/// `size_of::<T>()`, which keeps layout queries meaningful for concrete
/// descendants; the by-instance size is zero because no instance can
/// exist.
pub struct AbstractPayload<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> AbstractPayload<T> {
    /// Ops for the marker type `T`.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for AbstractPayload<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> PayloadInterface for AbstractPayload<T> {
    unsafe fn construct(
        &self,
        _mem: NonNull<u8>,
        _host: Host<'_>,
        _params: Params<'_>,
    ) -> TypeResult<()> {
        Err(TypeError::AbstractConstruction)
    }

    unsafe fn copy_construct(&self, _dst: NonNull<u8>, _src: NonNull<u8>) -> TypeResult<()> {
        Err(TypeError::AbstractConstruction)
    }

    unsafe fn destruct(&self, _mem: NonNull<u8>) {}

    fn size(&self, _host: Host<'_>, _params: Params<'_>) -> usize {
        std::mem::size_of::<T>()
    }

    unsafe fn size_by_instance(&self, _host: Host<'_>, _payload: NonNull<u8>) -> usize {
        0
    }
}
