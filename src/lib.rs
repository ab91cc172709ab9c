//! Journal recovery for a page-oriented storage kernel.
//!
//! On startup, or whenever the data file must be rebuilt from durable
//! write-ahead logs, [`recover_journal`] replays every committed journal
//! transaction into the data file, leaving it consistent with the last
//! durable commit. The pieces compose bottom-up:
//!
//! - [`Pager`]: byte-addressable views over journal, data and scratch
//!   backings ([`MmapPager`], [`ScratchPager`]).
//! - [`apply_diff`] / [`compute_diff`]: the compact page-diff codec.
//! - [`JournalReader`]: the recovery cursor state machine.
//! - [`JournalWriter`]: the encoding side, so the hash, compression and
//!   diff contracts are exercised end to end.

use std::path::Path;

use tracing::debug;

pub use mini_voron_common::{
    PageInfo, PageNumber, StorageError, TransactionHeader, TxId, JOURNAL_BLOCK_SIZE, PAGE_SIZE,
    TRANSACTION_HEADER_MARKER, TRANSACTION_HEADER_SIZE, TX_COMMIT,
};
pub use mini_voron_journal::{
    apply_diff, compute_diff, JournalReader, JournalWriter, PageWrite, RecoveryOptions,
};
pub use mini_voron_pager::{MmapPager, Pager, ProtectionTracker, ScratchPager};

/// Terminal state of a recovery pass, inspected by the outer store to decide
/// whether its file header must be rewritten and where new writes append.
#[derive(Debug)]
pub struct RecoveredJournal {
    /// Last accepted transaction header (the anchor if nothing was accepted).
    pub last_header: Option<TransactionHeader>,
    /// First free 4 KiB block after the recovered tail.
    pub next_4kb: u64,
    /// A recoverable defect was observed; the file header must be rewritten
    /// so the next startup begins after the last valid transaction.
    pub require_header_update: bool,
}

/// Open the journal and data files, replay every committed transaction at or
/// above the durable watermark, flush the data file, and report the terminal
/// state.
///
/// `anchor` is the previous-transaction header from the store's file header
/// (`None` on a fresh store). Recoverable tail defects are absorbed and
/// reported through `options`; structural corruption and pager failures are
/// returned as errors.
pub fn recover_journal(
    journal_path: &Path,
    data_path: &Path,
    last_synced_tx_id: TxId,
    anchor: Option<TransactionHeader>,
    options: &mut RecoveryOptions,
) -> Result<RecoveredJournal, StorageError> {
    let mut journal = MmapPager::open(journal_path)?;
    let mut recovery = ScratchPager::new();
    let mut data = MmapPager::open(data_path)?;

    let mut reader = JournalReader::new(
        &mut journal,
        &mut recovery,
        &mut data,
        last_synced_tx_id,
        anchor,
    );
    reader.recover_and_validate(options)?;

    let recovered = RecoveredJournal {
        last_header: reader.last_transaction_header().copied(),
        next_4kb: reader.next_4kb(),
        require_header_update: reader.require_header_update(),
    };
    drop(reader);

    data.sync()?;
    debug!(
        next_4kb = recovered.next_4kb,
        require_header_update = recovered.require_header_update,
        "journal recovery finished"
    );
    Ok(recovered)
}
