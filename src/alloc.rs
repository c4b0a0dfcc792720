//! # Allocator Adapter
//!
//! Every object allocation in the type system flows through a
//! [`MemoryAllocator`]. The default [`SystemAllocator`] sits on
//! `std::alloc` and keeps atomic byte/call counters, so embedders and
//! tests can assert that construct/destroy cycles leave the allocator
//! balance at net zero.
//!
//! The adapter must be thread-safe by contract; the trait carries
//! `Send + Sync` so a shared type system can allocate from any thread.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capability set over a user-supplied allocator.
pub trait MemoryAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align`. Returns `None` on
    /// exhaustion; the type system reports that as an allocation failure.
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Try to grow or shrink an allocation in place. Returns `false` when
    /// the block cannot be resized without moving; callers must then keep
    /// using the old block. The default declines every request.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this adapter
    /// with the given `old_size` and `align`, and must not have been freed.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> bool {
        let _ = (ptr, old_size, new_size, align);
        false
    }

    /// Return an allocation to the adapter.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this adapter
    /// with the same `size` and `align`, and must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Snapshot of an allocator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    /// Total bytes handed out over the allocator's lifetime.
    pub allocated_bytes: u64,
    /// Total bytes returned.
    pub freed_bytes: u64,
    /// Number of successful allocations.
    pub allocation_count: u64,
    /// Number of frees.
    pub free_count: u64,
}

impl AllocationStats {
    /// Currently outstanding bytes.
    pub fn live_bytes(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.freed_bytes)
    }
}

/// Default allocator over `std::alloc` with atomic usage counters.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    allocated_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    allocation_count: AtomicU64,
    free_count: AtomicU64,
}

impl SystemAllocator {
    /// Create an allocator with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current counters.
    pub fn stats(&self) -> AllocationStats {
        AllocationStats {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            freed_bytes: self.freed_bytes.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
        }
    }

    /// Currently outstanding bytes (allocated minus freed).
    pub fn live_bytes(&self) -> u64 {
        self.stats().live_bytes()
    }
}

impl MemoryAllocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw)?;
        self.allocated_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(size, align);
        alloc::dealloc(ptr.as_ptr(), layout);
        self.freed_bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_free_balance() {
        let allocator = SystemAllocator::new();
        let ptr = allocator.allocate(64, 8).expect("allocation");
        assert_eq!(allocator.live_bytes(), 64);

        unsafe { allocator.free(ptr, 64, 8) };
        let stats = allocator.stats();
        assert_eq!(stats.live_bytes(), 0);
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.free_count, 1);
    }

    #[test]
    fn test_zero_size_allocation_fails() {
        let allocator = SystemAllocator::new();
        assert!(allocator.allocate(0, 8).is_none());
        assert_eq!(allocator.stats().allocation_count, 0);
    }

    #[test]
    fn test_alignment_respected() {
        let allocator = SystemAllocator::new();
        let ptr = allocator.allocate(24, 16).expect("allocation");
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        unsafe { allocator.free(ptr, 24, 16) };
    }

    #[test]
    fn test_resize_declines_by_default() {
        let allocator = SystemAllocator::new();
        let ptr = allocator.allocate(32, 8).expect("allocation");
        let grown = unsafe { allocator.resize(ptr, 32, 64, 8) };
        assert!(!grown);
        unsafe { allocator.free(ptr, 32, 8) };
    }
}
