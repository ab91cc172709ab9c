use mini_voron_common::{
    decode_page_info, pages_for, StorageError, TransactionHeader, TxId, BLOCKS_PER_PAGE,
    JOURNAL_BLOCK_SIZE, PAGE_INFO_SIZE, PAGE_SIZE, TRANSACTION_HEADER_SIZE,
};
use mini_voron_pager::Pager;
use tracing::{debug, warn};

use crate::diff::apply_diff;
use crate::validator::{corruption, probe_valid_header, resolve_header, HeaderResolution};

/// Per-pass options: the journal's display name (used in corruption
/// messages) and an optional callback for recoverable defects. The engine
/// itself never prints; defects reach the caller through the callback and
/// through `require_header_update`.
pub struct RecoveryOptions {
    journal_name: String,
    on_recovery_error: Option<Box<dyn FnMut(&str, Option<&StorageError>)>>,
}

impl RecoveryOptions {
    pub fn new(journal_name: impl Into<String>) -> Self {
        Self {
            journal_name: journal_name.into(),
            on_recovery_error: None,
        }
    }

    pub fn with_recovery_error_callback(
        mut self,
        callback: impl FnMut(&str, Option<&StorageError>) + 'static,
    ) -> Self {
        self.on_recovery_error = Some(Box::new(callback));
        self
    }

    pub fn journal_name(&self) -> &str {
        &self.journal_name
    }

    fn invoke_recovery_error(&mut self, message: &str, cause: Option<&StorageError>) {
        warn!(journal = %self.journal_name, message, "recoverable journal defect");
        if let Some(callback) = self.on_recovery_error.as_mut() {
            callback(message, cause);
        }
    }
}

/// Replays committed journal transactions into the data pager.
///
/// The reader owns the recovery cursor for one pass over one journal file:
/// it resolves a header at each 4 KiB position, decompresses accepted
/// payloads into the recovery scratch pager, and materialises each page into
/// the data pager, verbatim or by applying a compact diff. It borrows all
/// three pagers for the pass and is the sole writer to the data pager while
/// it runs.
pub struct JournalReader<'p> {
    journal_pager: &'p mut dyn Pager,
    recovery_pager: &'p mut dyn Pager,
    data_pager: &'p mut dyn Pager,
    cursor_4kb: u64,
    capacity_4kb: u64,
    last_synced_tx_id: TxId,
    last_header: Option<TransactionHeader>,
    require_header_update: bool,
}

impl<'p> JournalReader<'p> {
    /// `anchor` is the last transaction header the outer store knows about
    /// (`None` on a fresh store); `last_synced_tx_id` is the durable
    /// watermark. Transactions at or below the watermark are already in the
    /// data file and are skipped without touching the data pager.
    pub fn new(
        journal_pager: &'p mut dyn Pager,
        recovery_pager: &'p mut dyn Pager,
        data_pager: &'p mut dyn Pager,
        last_synced_tx_id: TxId,
        anchor: Option<TransactionHeader>,
    ) -> Self {
        let capacity_4kb = journal_pager.total_allocation_size() / JOURNAL_BLOCK_SIZE as u64;
        Self {
            journal_pager,
            recovery_pager,
            data_pager,
            cursor_4kb: 0,
            capacity_4kb,
            last_synced_tx_id,
            last_header: anchor,
            require_header_update: false,
        }
    }

    /// Next free 4 KiB block, where the outer store appends new writes
    /// after recovery.
    pub fn next_4kb(&self) -> u64 {
        self.cursor_4kb
    }

    /// Seed the cursor, e.g. when resuming from a checkpoint.
    pub fn set_start_page(&mut self, cursor_4kb: u64) {
        self.cursor_4kb = cursor_4kb;
    }

    /// The last accepted transaction header (the caller's anchor until a
    /// transaction is accepted).
    pub fn last_transaction_header(&self) -> Option<&TransactionHeader> {
        self.last_header.as_ref()
    }

    /// Sticky flag: a recoverable defect was observed and the outer store
    /// must rewrite its file header after recovery.
    pub fn require_header_update(&self) -> bool {
        self.require_header_update
    }

    /// Drive [`JournalReader::read_one`] until the journal is exhausted or a
    /// recoverable tail has been reached.
    pub fn recover_and_validate(&mut self, options: &mut RecoveryOptions) -> Result<(), StorageError> {
        while self.read_one(options)? {}
        Ok(())
    }

    /// Process one transaction. Returns whether work was done; `false` ends
    /// the pass. Structural corruption and pager failures are errors.
    pub fn read_one(&mut self, options: &mut RecoveryOptions) -> Result<bool, StorageError> {
        if self.cursor_4kb >= self.capacity_4kb {
            return Ok(false);
        }

        let header = match resolve_header(
            self.journal_pager,
            self.cursor_4kb,
            self.capacity_4kb,
            self.last_header.as_ref(),
            options.journal_name(),
        )? {
            HeaderResolution::Valid(header) => header,
            HeaderResolution::End => return Ok(false),
            HeaderResolution::Torn(tx_id) => {
                self.require_header_update = true;
                options.invoke_recovery_error(
                    &format!("transaction {tx_id} was not committed"),
                    None,
                );
                return Ok(false);
            }
            HeaderResolution::Garbage { journal_reuse } => {
                if let Some(stale_id) = journal_reuse {
                    self.require_header_update = true;
                    options.invoke_recovery_error(
                        &format!(
                            "journal was reused; transaction {stale_id} predates the recovered sequence"
                        ),
                        None,
                    );
                }
                self.scan_past_garbage()?;
                return Ok(false);
            }
        };

        let tx_blocks = header.blocks_on_disk();

        if header.tx_id <= self.last_synced_tx_id {
            // Already materialised to the data file by an earlier flush.
            debug!(tx_id = header.tx_id, "skipping already-synced transaction");
            self.cursor_4kb += tx_blocks;
            self.last_header = Some(header);
            return Ok(true);
        }

        if !self.materialize(&header, options)? {
            return Ok(false);
        }

        self.cursor_4kb += tx_blocks;
        self.last_header = Some(header);
        debug!(
            tx_id = header.tx_id,
            pages = header.page_count,
            next_4kb = self.cursor_4kb,
            "applied transaction"
        );
        Ok(true)
    }

    /// After garbage: look for a hash-valid header further on, one 4 KiB
    /// block at a time. Finding one means the journal was recycled and the
    /// file header must be rewritten. The cursor stays at the last valid
    /// position either way.
    fn scan_past_garbage(&mut self) -> Result<(), StorageError> {
        let mut probe_4kb = self.cursor_4kb + 1;
        while probe_4kb < self.capacity_4kb {
            if probe_valid_header(self.journal_pager, probe_4kb, self.capacity_4kb)? {
                debug!(at_4kb = probe_4kb, "hash-valid header beyond garbage; journal was recycled");
                self.require_header_update = true;
                return Ok(());
            }
            probe_4kb += 1;
        }
        Ok(())
    }

    /// Decompress the accepted transaction into the recovery pager and apply
    /// its pages to the data pager. `Ok(false)` means a recoverable
    /// decompression failure ended the pass; structural violations are
    /// errors.
    fn materialize(
        &mut self,
        header: &TransactionHeader,
        options: &mut RecoveryOptions,
    ) -> Result<bool, StorageError> {
        let uncompressed = header.uncompressed_size.max(0) as usize;
        let compressed = header.compressed_size as usize;

        let scratch_pages = pages_for(uncompressed).max(1);
        self.recovery_pager.ensure_continuous(0, scratch_pages)?;
        self.recovery_pager.ensure_mapped(0, scratch_pages)?;

        let src_page = self.cursor_4kb / BLOCKS_PER_PAGE;
        let src_offset = (self.cursor_4kb % BLOCKS_PER_PAGE) as usize * JOURNAL_BLOCK_SIZE;

        let journal_view = self.journal_pager.acquire_page(src_page)?;
        let payload = &journal_view
            [src_offset + TRANSACTION_HEADER_SIZE..src_offset + TRANSACTION_HEADER_SIZE + compressed];

        let scratch = self.recovery_pager.acquire_page_mut(0)?;
        scratch[..scratch_pages * PAGE_SIZE].fill(0);

        let failure = match lz4_flex::block::decompress_into(payload, &mut scratch[..uncompressed])
        {
            Ok(n) if n == uncompressed => None,
            Ok(n) => Some(StorageError::Decompression(format!(
                "expected {uncompressed} bytes, got {n}"
            ))),
            Err(e) => Some(StorageError::Decompression(e.to_string())),
        };
        if let Some(cause) = failure {
            self.require_header_update = true;
            options.invoke_recovery_error(
                &format!("could not decompress transaction {}", header.tx_id),
                Some(&cause),
            );
            return Ok(false);
        }

        self.apply_pages(header, options)?;
        Ok(true)
    }

    /// Walk the page-info table in the recovery pager and materialise every
    /// page into the data pager, each write bracketed by exactly one
    /// unprotect and one protect.
    fn apply_pages(
        &mut self,
        header: &TransactionHeader,
        options: &RecoveryOptions,
    ) -> Result<(), StorageError> {
        let journal_name = options.journal_name();
        let page_count = header.page_count as usize;
        let uncompressed = header.uncompressed_size.max(0) as usize;

        let info_bytes = page_count * PAGE_INFO_SIZE;
        if info_bytes > uncompressed {
            return Err(corruption(
                journal_name,
                header.tx_id,
                format!("page-info table ({page_count} entries) extends past the payload"),
            ));
        }

        let scratch = self.recovery_pager.acquire_page(0)?;

        let mut infos = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let mut buf = [0u8; PAGE_INFO_SIZE];
            buf.copy_from_slice(&scratch[i * PAGE_INFO_SIZE..(i + 1) * PAGE_INFO_SIZE]);
            infos.push(decode_page_info(&buf));
        }

        // Whole-table checks before the first destination write.
        for info in &infos {
            if info.page_number < 0 || info.page_number > header.last_page_number {
                return Err(corruption(
                    journal_name,
                    header.tx_id,
                    format!(
                        "page {} is beyond last_page_number {}",
                        info.page_number, header.last_page_number
                    ),
                ));
            }
            if info.size < 0 || info.diff_size < 0 {
                return Err(corruption(
                    journal_name,
                    header.tx_id,
                    format!("negative length in page-info entry for page {}", info.page_number),
                ));
            }
        }

        let mut offset = info_bytes;
        for info in &infos {
            if offset > uncompressed {
                return Err(corruption(
                    journal_name,
                    header.tx_id,
                    "payload cursor ran past uncompressed_size",
                ));
            }

            let page_number = info.page_number as u64;
            let size = info.size as usize;
            let body_len = if info.is_verbatim() {
                size
            } else {
                info.diff_size as usize
            };
            if offset + 8 + body_len > uncompressed {
                return Err(corruption(
                    journal_name,
                    header.tx_id,
                    format!("payload for page {page_number} extends past uncompressed_size"),
                ));
            }

            let dest_pages = pages_for(size).max(1);
            self.data_pager.ensure_continuous(page_number, dest_pages)?;
            self.data_pager.ensure_mapped(page_number, dest_pages)?;

            // The writer echoes each page number ahead of the body as a
            // cross-check against a shifted or corrupt payload.
            let mut echoed_buf = [0u8; 8];
            echoed_buf.copy_from_slice(&scratch[offset..offset + 8]);
            let echoed = u64::from_le_bytes(echoed_buf);
            if echoed != page_number {
                return Err(corruption(
                    journal_name,
                    header.tx_id,
                    format!("echoed page number {echoed} does not match page-info entry {page_number}"),
                ));
            }
            offset += 8;

            self.data_pager.unprotect_range(page_number, size);
            let destination = self.data_pager.acquire_page_mut(page_number)?;
            if info.is_verbatim() {
                destination[..size].copy_from_slice(&scratch[offset..offset + size]);
            } else {
                apply_diff(&mut destination[..size], &scratch[offset..offset + body_len]).map_err(
                    |e| match e {
                        StorageError::MalformedDiff(detail) => corruption(
                            journal_name,
                            header.tx_id,
                            format!("page {page_number}: {detail}"),
                        ),
                        other => other,
                    },
                )?;
            }
            offset += body_len;
            self.data_pager.protect_range(page_number, size);
        }

        Ok(())
    }
}

impl Drop for JournalReader<'_> {
    fn drop(&mut self) {
        // Disposal notification: pagers drop per-pass state.
        self.journal_pager.release_transaction_state();
        self.recovery_pager.release_transaction_state();
        self.data_pager.release_transaction_state();
    }
}
