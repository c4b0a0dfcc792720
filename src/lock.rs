//! # Lock Adapter
//!
//! The type system never names a concrete lock primitive. All critical
//! sections go through a [`LockProvider`], so embedders choose between
//! real reader-writer locks and zero-overhead no-ops:
//!
//! - [`NoopLockProvider`]: the default. Every operation is a no-op, which
//!   makes the system free of synchronization cost in single-threaded
//!   embeddings. A system built on it is deliberately `!Sync`.
//! - [`RwLockProvider`]: backed by `parking_lot::RawRwLock`. This is the
//!   provider to use when the system is shared across threads.
//!
//! Critical sections are RAII-scoped ([`ReadScope`] / [`WriteScope`]): the
//! lock is released on every exit path, including unwinding.

use parking_lot::lock_api::RawRwLock as RawRwLockApi;

/// Capability set over a user-supplied reader-writer lock.
///
/// Implementations must pair every `enter_*` with the matching `leave_*`
/// on all control-flow paths; the scope guards below do exactly that.
pub trait LockProvider {
    /// The lock handle type. One handle guards the global type list and
    /// one more guards each registered type.
    type Lock;

    /// Create a fresh, unlocked handle.
    fn create_lock(&self) -> Self::Lock;

    /// Tear a handle down. Called once per handle, after its last use.
    fn close_lock(&self, _lock: &Self::Lock) {}

    /// Acquire shared access.
    fn enter_read(&self, lock: &Self::Lock);

    /// Release shared access.
    fn leave_read(&self, lock: &Self::Lock);

    /// Acquire exclusive access.
    fn enter_write(&self, lock: &Self::Lock);

    /// Release exclusive access.
    fn leave_write(&self, lock: &Self::Lock);
}

/// Marker for providers whose locks really exclude.
///
/// A [`crate::TypeSystem`] is `Sync` only when its provider implements
/// this trait. [`NoopLockProvider`] does not, which pins no-op systems to
/// a single thread at the type level.
///
/// # Safety
///
/// Implementors guarantee that `enter_write` excludes all concurrent
/// readers and writers of the same handle, and that `enter_read` excludes
/// concurrent writers. Implementing this for a provider that does not
/// uphold that contract makes shared use of the type system undefined
/// behavior.
pub unsafe trait ShareableLocks: LockProvider {}

// ============================================================================
// No-op provider
// ============================================================================

/// Lock provider whose operations all do nothing.
///
/// The resulting type system carries zero synchronization overhead and is
/// `!Sync`; sharing it across threads is rejected at compile time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLockProvider;

impl LockProvider for NoopLockProvider {
    type Lock = ();

    #[inline]
    fn create_lock(&self) -> Self::Lock {}

    #[inline]
    fn enter_read(&self, _lock: &Self::Lock) {}

    #[inline]
    fn leave_read(&self, _lock: &Self::Lock) {}

    #[inline]
    fn enter_write(&self, _lock: &Self::Lock) {}

    #[inline]
    fn leave_write(&self, _lock: &Self::Lock) {}
}

// ============================================================================
// parking_lot-backed provider
// ============================================================================

/// Lock provider backed by `parking_lot::RawRwLock`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RwLockProvider;

impl LockProvider for RwLockProvider {
    type Lock = parking_lot::RawRwLock;

    #[inline]
    fn create_lock(&self) -> Self::Lock {
        <parking_lot::RawRwLock as RawRwLockApi>::INIT
    }

    #[inline]
    fn enter_read(&self, lock: &Self::Lock) {
        lock.lock_shared();
    }

    #[inline]
    fn leave_read(&self, lock: &Self::Lock) {
        // Safety: paired with a preceding enter_read on this handle.
        unsafe { lock.unlock_shared() }
    }

    #[inline]
    fn enter_write(&self, lock: &Self::Lock) {
        lock.lock_exclusive();
    }

    #[inline]
    fn leave_write(&self, lock: &Self::Lock) {
        // Safety: paired with a preceding enter_write on this handle.
        unsafe { lock.unlock_exclusive() }
    }
}

// Safety: parking_lot's rwlock provides real mutual exclusion.
unsafe impl ShareableLocks for RwLockProvider {}

// ============================================================================
// RAII scopes
// ============================================================================

/// Shared-access critical section. Entered on creation, left on drop.
///
/// A `None` lock is allowed and makes the scope a no-op; this mirrors the
/// optional locks taken during re-parenting (a type may have no parent).
pub(crate) struct ReadScope<'a, L: LockProvider> {
    provider: &'a L,
    lock: Option<&'a L::Lock>,
}

impl<'a, L: LockProvider> ReadScope<'a, L> {
    pub(crate) fn enter(provider: &'a L, lock: Option<&'a L::Lock>) -> Self {
        if let Some(lock) = lock {
            provider.enter_read(lock);
        }
        Self { provider, lock }
    }
}

impl<L: LockProvider> Drop for ReadScope<'_, L> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            self.provider.leave_read(lock);
        }
    }
}

/// Exclusive-access critical section. Entered on creation, left on drop.
pub(crate) struct WriteScope<'a, L: LockProvider> {
    provider: &'a L,
    lock: Option<&'a L::Lock>,
}

impl<'a, L: LockProvider> WriteScope<'a, L> {
    pub(crate) fn enter(provider: &'a L, lock: Option<&'a L::Lock>) -> Self {
        if let Some(lock) = lock {
            provider.enter_write(lock);
        }
        Self { provider, lock }
    }
}

impl<L: LockProvider> Drop for WriteScope<'_, L> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            self.provider.leave_write(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_provider_scopes() {
        let provider = NoopLockProvider;
        let lock = provider.create_lock();
        {
            let _read = ReadScope::enter(&provider, Some(&lock));
            let _nested = ReadScope::enter(&provider, Some(&lock));
        }
        {
            let _write = WriteScope::enter(&provider, Some(&lock));
        }
        provider.close_lock(&lock);
    }

    #[test]
    fn test_rwlock_provider_read_then_write() {
        let provider = RwLockProvider;
        let lock = provider.create_lock();
        {
            let _read = ReadScope::enter(&provider, Some(&lock));
        }
        {
            let _write = WriteScope::enter(&provider, Some(&lock));
        }
        provider.close_lock(&lock);
    }

    #[test]
    fn test_absent_lock_is_noop() {
        let provider = RwLockProvider;
        let _read = ReadScope::<RwLockProvider>::enter(&provider, None);
        let _write = WriteScope::<RwLockProvider>::enter(&provider, None);
    }

    #[test]
    fn test_concurrent_readers() {
        let provider = RwLockProvider;
        let lock = provider.create_lock();
        let first = ReadScope::enter(&provider, Some(&lock));
        let second = ReadScope::enter(&provider, Some(&lock));
        drop(first);
        drop(second);
    }
}
