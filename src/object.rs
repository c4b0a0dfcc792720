//! # Object Header and Handles
//!
//! Every object built by the type system is one contiguous allocation:
//!
//! ```text
//! ┌──────────────┬─────────────────┬───────────────┬─────┬───────────────┐
//! │ ObjectHeader │ payload bytes   │ plugin block  │ ... │ plugin block  │
//! │              │ (descriptor-    │ of root       │     │ of leaf type  │
//! │              │  sized)         │ ancestor      │     │               │
//! └──────────────┴─────────────────┴───────────────┴─────┴───────────────┘
//! low address                                                high address
//! ```
//!
//! The header records which registered type owns the object. Given any
//! payload pointer, stepping back by `header_size()` recovers the header;
//! [`ObjectRef::payload`] and [`ObjectRef::from_payload`] are exact
//! inverses of each other.

use std::ptr::NonNull;

use crate::descriptor::TypeId;

/// Header prefixed to every constructed object.
///
/// In debug builds the header additionally carries a back-pointer to the
/// owning type system, used to catch objects crossing between distinct
/// system instances. The pointer is diagnostic only and never load-bearing.
#[repr(C)]
pub struct ObjectHeader {
    #[cfg(debug_assertions)]
    owner: *const (),
    type_meta: u64,
}

impl ObjectHeader {
    pub(crate) fn new(type_id: TypeId, owner: *const ()) -> Self {
        #[cfg(not(debug_assertions))]
        let _ = owner;
        Self {
            #[cfg(debug_assertions)]
            owner,
            type_meta: type_id.pack(),
        }
    }

    pub(crate) fn type_id(&self) -> TypeId {
        TypeId::unpack(self.type_meta)
    }

    #[cfg(debug_assertions)]
    pub(crate) fn owner(&self) -> *const () {
        self.owner
    }
}

/// Size in bytes of the header prefix. Debug builds carry the extra
/// back-pointer, so layouts differ between debug and release; all offset
/// arithmetic in the crate goes through this function.
#[inline]
pub fn header_size() -> usize {
    std::mem::size_of::<ObjectHeader>()
}

/// Handle to a live object built by the type system.
///
/// `ObjectRef` is a thin wrapper around the header pointer. It can only be
/// obtained from a successful construct/clone call or from the `unsafe`
/// raw conversions; holding one is a claim that the object is alive.
/// Using a handle after the object was destroyed is undefined behavior,
/// exactly as with the raw pointer it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    header: NonNull<ObjectHeader>,
}

impl ObjectRef {
    /// Reinterpret raw object memory as a handle.
    ///
    /// # Safety
    ///
    /// `raw` must be the start address of a live object allocation
    /// (the address returned by [`ObjectRef::as_raw`]).
    pub unsafe fn from_raw(raw: NonNull<u8>) -> Self {
        Self {
            header: raw.cast(),
        }
    }

    /// Start address of the object allocation.
    pub fn as_raw(self) -> NonNull<u8> {
        self.header.cast()
    }

    /// The registered type this object was constructed from.
    pub fn type_id(self) -> TypeId {
        // Safety: the handle invariant guarantees a live header.
        unsafe { self.header.as_ref().type_id() }
    }

    /// Pointer to the payload bytes, directly behind the header.
    pub fn payload(self) -> NonNull<u8> {
        // Safety: the payload region begins at header_size() within the
        // same allocation.
        unsafe { NonNull::new_unchecked(self.as_raw().as_ptr().add(header_size())) }
    }

    /// Recover the object handle from its payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload pointer of a live object, i.e. a
    /// value previously returned by [`ObjectRef::payload`].
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        let raw = payload.as_ptr().sub(header_size());
        Self {
            header: NonNull::new_unchecked(raw).cast(),
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn owner(self) -> *const () {
        // Safety: the handle invariant guarantees a live header.
        unsafe { self.header.as_ref().owner() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_pointer_aligned() {
        assert_eq!(header_size() % std::mem::align_of::<*const ()>(), 0);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut storage = vec![0u8; header_size() + 16];
        let raw = NonNull::new(storage.as_mut_ptr()).unwrap();
        unsafe {
            raw.cast::<ObjectHeader>()
                .as_ptr()
                .write(ObjectHeader::new(TypeId::from_parts(3, 1), std::ptr::null()));
            let obj = ObjectRef::from_raw(raw);
            let payload = obj.payload();
            assert_eq!(
                payload.as_ptr() as usize - raw.as_ptr() as usize,
                header_size()
            );
            assert_eq!(ObjectRef::from_payload(payload), obj);
            assert_eq!(obj.type_id(), TypeId::from_parts(3, 1));
        }
    }
}
