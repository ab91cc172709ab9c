pub mod mmap;
pub mod scratch;

pub use mmap::MmapPager;
pub use scratch::ScratchPager;

use mini_voron_common::{PageNumber, StorageError, PAGE_SIZE};

/// Byte-addressable view over a backing store, extensible on demand.
///
/// Three instances collaborate during a recovery pass: a journal pager
/// (read-only source), a data pager (mutable destination) and a recovery
/// pager (scratch region sized to the largest decompressed transaction).
/// The capability set is the contract; backings differ.
pub trait Pager {
    /// Guarantee that pages `page_number .. page_number + count` exist,
    /// growing the backing store if needed. Growth is zero-filled.
    fn ensure_continuous(
        &mut self,
        page_number: PageNumber,
        count: usize,
    ) -> Result<(), StorageError>;

    /// Make the requested range accessible. The backings here keep one
    /// continuous allocation, so this only validates bounds; a backing that
    /// maps in windows would fault the range in.
    fn ensure_mapped(&mut self, page_number: PageNumber, count: usize) -> Result<(), StorageError>;

    /// Stable view from the start of `page_number` to the end of the
    /// allocation. Records and images may span pages, so the view is not cut
    /// at the page boundary. The borrow cannot outlive the mapping: growing
    /// requires `&mut self`.
    fn acquire_page(&self, page_number: PageNumber) -> Result<&[u8], StorageError>;

    /// Mutable counterpart of [`Pager::acquire_page`].
    fn acquire_page_mut(&mut self, page_number: PageNumber) -> Result<&mut [u8], StorageError>;

    /// Open a write window of `len` bytes starting at `page_number`.
    /// Every window must be closed with a matching [`Pager::protect_range`];
    /// unbalanced pairs are bugs and debug-asserted.
    fn unprotect_range(&mut self, page_number: PageNumber, len: usize);

    /// Close the write window opened by [`Pager::unprotect_range`].
    fn protect_range(&mut self, page_number: PageNumber, len: usize);

    /// Total allocation in bytes.
    fn total_allocation_size(&self) -> u64;

    /// Number of pages the allocation spans (a trailing partial page counts).
    fn number_of_allocated_pages(&self) -> u64 {
        self.total_allocation_size().div_ceil(PAGE_SIZE as u64)
    }

    /// Disposal notification from the reading transaction. Backings drop
    /// per-pass state (open protection windows, extra mappings).
    fn release_transaction_state(&mut self) {}
}

/// Bookkeeping for the unprotect/protect bracket discipline.
///
/// OS-level page protection is a no-op on these backings, but the brackets
/// are still tracked so that a platform-enabled backing inherits correct
/// call sequences: one unprotect per destination, one protect after, in
/// that order.
#[derive(Debug, Default)]
pub struct ProtectionTracker {
    open: Vec<(PageNumber, usize)>,
    unprotect_calls: u64,
    protect_calls: u64,
}

impl ProtectionTracker {
    pub fn unprotect(&mut self, page_number: PageNumber, len: usize) {
        debug_assert!(
            !self.open.iter().any(|w| w.0 == page_number),
            "page {page_number} unprotected twice"
        );
        self.open.push((page_number, len));
        self.unprotect_calls += 1;
    }

    pub fn protect(&mut self, page_number: PageNumber, len: usize) {
        let idx = self.open.iter().position(|w| *w == (page_number, len));
        debug_assert!(
            idx.is_some(),
            "page {page_number} protected without a matching unprotect"
        );
        if let Some(idx) = idx {
            self.open.remove(idx);
        }
        self.protect_calls += 1;
    }

    /// Windows currently open. Zero between transactions.
    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn unprotect_calls(&self) -> u64 {
        self.unprotect_calls
    }

    pub fn protect_calls(&self) -> u64 {
        self.protect_calls
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }
}
