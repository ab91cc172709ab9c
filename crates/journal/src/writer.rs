use std::fs;
use std::path::Path;

use mini_voron_common::{
    encode_page_info, encode_transaction_header, pages_for, PageInfo, PageNumber, StorageError,
    TransactionHeader, TxId, JOURNAL_BLOCK_SIZE, TRANSACTION_HEADER_MARKER, TX_COMMIT,
};
use xxhash_rust::xxh64::xxh64;

use crate::diff::compute_diff;

/// One page write inside a transaction.
pub struct PageWrite {
    pub page_number: PageNumber,
    /// Full post-image. May span several pages.
    pub image: Vec<u8>,
    /// Prior image, when known. Lets the writer store a diff instead of the
    /// verbatim image; falls back to verbatim when the diff is not smaller.
    pub previous: Option<Vec<u8>>,
}

impl PageWrite {
    pub fn verbatim(page_number: PageNumber, image: Vec<u8>) -> Self {
        Self {
            page_number,
            image,
            previous: None,
        }
    }

    pub fn diffed(page_number: PageNumber, previous: Vec<u8>, image: Vec<u8>) -> Self {
        Self {
            page_number,
            image,
            previous: Some(previous),
        }
    }
}

/// Builds a journal image transaction by transaction: page-info table,
/// echoed page numbers, verbatim or diffed bodies, LZ4 block compression,
/// an XXH64 hash seeded with the transaction id, and zero padding to the
/// next 4 KiB boundary.
#[derive(Default)]
pub struct JournalWriter {
    buf: Vec<u8>,
}

impl JournalWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed transaction. Returns the 4 KiB block at which its
    /// header was written.
    pub fn append(&mut self, tx_id: TxId, writes: &[PageWrite]) -> u64 {
        self.append_with_flags(tx_id, writes, TX_COMMIT)
    }

    /// Append a transaction with explicit flags (an empty flag word writes an
    /// uncommitted transaction, which ends recovery when encountered).
    pub fn append_with_flags(&mut self, tx_id: TxId, writes: &[PageWrite], flags: u32) -> u64 {
        let start_block = (self.buf.len() / JOURNAL_BLOCK_SIZE) as u64;

        // Lay out the uncompressed payload: the page-info table first, then
        // per write an echoed page number and the body.
        let mut infos = Vec::with_capacity(writes.len());
        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(writes.len());
        let mut last_page_number = 0i64;
        for write in writes {
            let diff = write
                .previous
                .as_ref()
                .and_then(|previous| compute_diff(previous, &write.image));
            let (diff_size, body) = match diff {
                Some(diff) => (diff.len() as i64, diff),
                None => (0, write.image.clone()),
            };
            infos.push(PageInfo {
                page_number: write.page_number as i64,
                size: write.image.len() as i64,
                diff_size,
            });
            bodies.push(body);

            let highest = write.page_number as i64 + pages_for(write.image.len()).max(1) as i64 - 1;
            last_page_number = last_page_number.max(highest);
        }

        let mut payload = Vec::new();
        for info in &infos {
            payload.extend_from_slice(&encode_page_info(info));
        }
        for (write, body) in writes.iter().zip(&bodies) {
            payload.extend_from_slice(&write.page_number.to_le_bytes());
            payload.extend_from_slice(body);
        }

        let compressed = lz4_flex::block::compress(&payload);
        let header = TransactionHeader {
            marker: TRANSACTION_HEADER_MARKER,
            tx_id,
            last_page_number,
            page_count: writes.len() as u32,
            flags,
            compressed_size: compressed.len() as i64,
            uncompressed_size: payload.len() as i64,
            hash: xxh64(&compressed, tx_id as u64),
        };

        self.buf.extend_from_slice(&encode_transaction_header(&header));
        self.buf.extend_from_slice(&compressed);

        // Pad to the next block boundary so the following header is aligned.
        let tail = self.buf.len() % JOURNAL_BLOCK_SIZE;
        if tail != 0 {
            self.buf.resize(self.buf.len() + JOURNAL_BLOCK_SIZE - tail, 0);
        }

        start_block
    }

    /// Blocks written so far.
    pub fn blocks_written(&self) -> u64 {
        (self.buf.len() / JOURNAL_BLOCK_SIZE) as u64
    }

    pub fn into_image(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_image(&self) -> &[u8] {
        &self.buf
    }

    /// Persist the image as a journal file, zero-padded to `capacity_blocks`.
    pub fn write_image(&self, path: &Path, capacity_blocks: u64) -> Result<(), StorageError> {
        let capacity = capacity_blocks as usize * JOURNAL_BLOCK_SIZE;
        let mut file_bytes = vec![0u8; capacity.max(self.buf.len())];
        file_bytes[..self.buf.len()].copy_from_slice(&self.buf);
        fs::write(path, file_bytes)?;
        Ok(())
    }
}
