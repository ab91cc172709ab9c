use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use mini_voron_common::{PageNumber, StorageError, PAGE_SIZE};
use tracing::debug;

use crate::{Pager, ProtectionTracker};

/// File-backed pager over a single continuous memory mapping.
///
/// Growing extends the file (zero-filled) and remaps; every remap goes
/// through `&mut self`, so no acquired view can observe it.
pub struct MmapPager {
    file: File,
    map: MmapMut,
    protection: ProtectionTracker,
}

impl MmapPager {
    /// Open (or create) a file-backed pager. A fresh file is allocated at
    /// one page so the mapping is never empty.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            file.set_len(PAGE_SIZE as u64)?;
        }

        // The file handle outlives the map and all remaps take &mut self.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(Self {
            file,
            map,
            protection: ProtectionTracker::default(),
        })
    }

    pub fn protection(&self) -> &ProtectionTracker {
        &self.protection
    }

    /// Flush dirty pages back to the file.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.map.flush()?;
        Ok(())
    }

    fn grow_to_pages(&mut self, pages: u64) -> Result<(), StorageError> {
        let new_len = pages * PAGE_SIZE as u64;
        self.file
            .set_len(new_len)
            .map_err(|e| StorageError::GrowFailed {
                requested_pages: pages,
                source: e,
            })?;
        self.map = unsafe {
            MmapOptions::new()
                .map_mut(&self.file)
                .map_err(|e| StorageError::GrowFailed {
                    requested_pages: pages,
                    source: e,
                })?
        };
        debug!(pages, bytes = new_len, "grew file-backed pager");
        Ok(())
    }

    fn page_offset(&self, page_number: PageNumber) -> Result<usize, StorageError> {
        let offset = page_number as usize * PAGE_SIZE;
        if offset >= self.map.len() {
            return Err(StorageError::PageOutOfBounds {
                page_number,
                allocated: self.number_of_allocated_pages(),
            });
        }
        Ok(offset)
    }
}

impl Pager for MmapPager {
    fn ensure_continuous(
        &mut self,
        page_number: PageNumber,
        count: usize,
    ) -> Result<(), StorageError> {
        let needed = page_number + count as u64;
        if needed > self.number_of_allocated_pages() {
            self.grow_to_pages(needed)?;
        }
        Ok(())
    }

    fn ensure_mapped(&mut self, page_number: PageNumber, count: usize) -> Result<(), StorageError> {
        // Single continuous map: in-range is already mapped.
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
        Ok(&self.map[offset..])
    }

    fn acquire_page_mut(&mut self, page_number: PageNumber) -> Result<&mut [u8], StorageError> {
        let offset = self.page_offset(page_number)?;
        Ok(&mut self.map[offset..])
    }

    fn unprotect_range(&mut self, page_number: PageNumber, len: usize) {
        self.protection.unprotect(page_number, len);
    }

    fn protect_range(&mut self, page_number: PageNumber, len: usize) {
        self.protection.protect(page_number, len);
    }

    fn total_allocation_size(&self) -> u64 {
        self.map.len() as u64
    }

    fn release_transaction_state(&mut self) {
        self.protection.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_fresh_file_allocates_one_page() {
        let dir = TempDir::new().unwrap();
        let pager = MmapPager::open(&dir.path().join("data")).unwrap();
        assert_eq!(pager.number_of_allocated_pages(), 1);
        assert_eq!(pager.total_allocation_size(), PAGE_SIZE as u64);
    }

    #[test]
    fn test_grow_and_write_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        {
            let mut pager = MmapPager::open(&path).unwrap();
            pager.ensure_continuous(4, 1).unwrap();
            pager.ensure_mapped(4, 1).unwrap();
            let page = pager.acquire_page_mut(4).unwrap();
            page[0] = 0xAB;
            page[PAGE_SIZE - 1] = 0xCD;
            pager.sync().unwrap();
        }

        let pager = MmapPager::open(&path).unwrap();
        assert_eq!(pager.number_of_allocated_pages(), 5);
        let page = pager.acquire_page(4).unwrap();
        assert_eq!(page[0], 0xAB);
        assert_eq!(page[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_growth_is_zero_filled() {
        let dir = TempDir::new().unwrap();
        let mut pager = MmapPager::open(&dir.path().join("data")).unwrap();
        pager.ensure_continuous(2, 1).unwrap();
        let page = pager.acquire_page(1).unwrap();
        assert!(page[..PAGE_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_acquire_past_allocation_fails() {
        let dir = TempDir::new().unwrap();
        let pager = MmapPager::open(&dir.path().join("data")).unwrap();
        assert!(matches!(
            pager.acquire_page(9),
            Err(StorageError::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_ensure_mapped_past_allocation_fails() {
        let dir = TempDir::new().unwrap();
        let mut pager = MmapPager::open(&dir.path().join("data")).unwrap();
        assert!(pager.ensure_mapped(0, 1).is_ok());
        assert!(matches!(
            pager.ensure_mapped(0, 2),
            Err(StorageError::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_view_spans_pages() {
        let dir = TempDir::new().unwrap();
        let mut pager = MmapPager::open(&dir.path().join("data")).unwrap();
        pager.ensure_continuous(0, 3).unwrap();
        let view = pager.acquire_page(1).unwrap();
        // From page 1 to the end of the allocation.
        assert_eq!(view.len(), 2 * PAGE_SIZE);
    }
}
