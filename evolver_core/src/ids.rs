use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out process-unique, strictly increasing identifiers.
///
/// Used to name faulty artifacts and corpus entries. One allocator is built at
/// startup and shared (behind an `Arc`) by everything that needs fresh names.
#[derive(Debug, Default)]
pub struct UniqueIdAllocator {
    next: AtomicU64,
}

impl UniqueIdAllocator {
    /// Creates an allocator whose first identifier is `0`.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates an allocator whose first identifier is `first`.
    ///
    /// A resumed campaign seeds this past the highest name already on disk so
    /// that earlier entries are never overwritten.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
