use mini_voron_common::{PageNumber, StorageError, JOURNAL_BLOCK_SIZE, PAGE_SIZE};

use crate::{Pager, ProtectionTracker};

/// In-memory pager over a growable byte region.
///
/// Used as the recovery scratch area (sized to the largest decompressed
/// transaction seen) and, loaded from a prebuilt image, as a journal or
/// data stand-in in tests.
pub struct ScratchPager {
    buf: Vec<u8>,
    protection: ProtectionTracker,
}

impl ScratchPager {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            protection: ProtectionTracker::default(),
        }
    }

    pub fn with_capacity_pages(pages: usize) -> Self {
        Self {
            buf: vec![0u8; pages * PAGE_SIZE],
            protection: ProtectionTracker::default(),
        }
    }

    /// Build a pager over a journal image, zero-padded to `capacity_blocks`
    /// 4 KiB blocks. The image must fit the capacity.
    pub fn from_image(image: &[u8], capacity_blocks: u64) -> Self {
        let capacity = capacity_blocks as usize * JOURNAL_BLOCK_SIZE;
        assert!(image.len() <= capacity, "journal image exceeds capacity");
        let mut buf = vec![0u8; capacity];
        buf[..image.len()].copy_from_slice(image);
        Self {
            buf,
            protection: ProtectionTracker::default(),
        }
    }

    pub fn protection(&self) -> &ProtectionTracker {
        &self.protection
    }

    /// Whole backing region, for test inspection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn page_offset(&self, page_number: PageNumber) -> Result<usize, StorageError> {
        let offset = page_number as usize * PAGE_SIZE;
        if offset >= self.buf.len() {
            return Err(StorageError::PageOutOfBounds {
                page_number,
                allocated: self.number_of_allocated_pages(),
            });
        }
        Ok(offset)
    }
}

impl Default for ScratchPager {
    fn default() -> Self {
        Self::new()
    }
}

impl Pager for ScratchPager {
    fn ensure_continuous(
        &mut self,
        page_number: PageNumber,
        count: usize,
    ) -> Result<(), StorageError> {
        let needed = (page_number as usize + count) * PAGE_SIZE;
        if needed > self.buf.len() {
            self.buf.resize(needed, 0);
        }
        Ok(())
    }

    fn ensure_mapped(&mut self, page_number: PageNumber, count: usize) -> Result<(), StorageError> {
        let needed = page_number + count as u64;
        if needed > self.number_of_allocated_pages() {
            return Err(StorageError::PageOutOfBounds {
                page_number: needed - 1,
                allocated: self.number_of_allocated_pages(),
            });
        }
        Ok(())
    }

    fn acquire_page(&self, page_number: PageNumber) -> Result<&[u8], StorageError> {
        let offset = self.page_offset(page_number)?;
        Ok(&self.buf[offset..])
    }

    fn acquire_page_mut(&mut self, page_number: PageNumber) -> Result<&mut [u8], StorageError> {
        let offset = self.page_offset(page_number)?;
        Ok(&mut self.buf[offset..])
    }

    fn unprotect_range(&mut self, page_number: PageNumber, len: usize) {
        self.protection.unprotect(page_number, len);
    }

    fn protect_range(&mut self, page_number: PageNumber, len: usize) {
        self.protection.protect(page_number, len);
    }

    fn total_allocation_size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn release_transaction_state(&mut self) {
        self.protection.clear();
    }
}
