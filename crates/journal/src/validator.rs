use mini_voron_common::{
    decode_transaction_header, pages_for, StorageError, TransactionHeader, TxId, BLOCKS_PER_PAGE,
    JOURNAL_BLOCK_SIZE, TRANSACTION_HEADER_MARKER, TRANSACTION_HEADER_SIZE,
};
use mini_voron_pager::Pager;
use xxhash_rust::xxh64::xxh64;

/// Outcome of resolving a candidate header at a 4 KiB position.
///
/// Fatal structural corruption is an `Err` from [`resolve_header`], not a
/// variant: a hash-valid transaction in the wrong place means real data is
/// missing, and the pass must abort.
#[derive(Debug)]
pub(crate) enum HeaderResolution {
    /// Committed, hash-valid and in sequence.
    Valid(TransactionHeader),
    /// Not a header at all, or a leftover from a recycled journal.
    /// `journal_reuse` carries the stale transaction id when the leftover is
    /// hash-valid; the caller must then request a file-header rewrite.
    Garbage { journal_reuse: Option<TxId> },
    /// Structurally plausible header whose payload hash does not match, or a
    /// transaction the writer never committed.
    Torn(TxId),
    /// Past the journal capacity.
    End,
}

pub(crate) fn corruption(journal: &str, tx_id: TxId, reason: impl Into<String>) -> StorageError {
    StorageError::JournalCorruption {
        journal: journal.to_string(),
        tx_id,
        reason: reason.into(),
    }
}

/// Classify the candidate transaction header at `cursor_4kb`.
pub(crate) fn resolve_header(
    journal: &mut dyn Pager,
    cursor_4kb: u64,
    capacity_4kb: u64,
    last_header: Option<&TransactionHeader>,
    journal_name: &str,
) -> Result<HeaderResolution, StorageError> {
    if cursor_4kb >= capacity_4kb {
        return Ok(HeaderResolution::End);
    }

    let (header, hash_valid) = match read_candidate(journal, cursor_4kb, capacity_4kb)? {
        Some(candidate) => candidate,
        None => return Ok(HeaderResolution::Garbage { journal_reuse: None }),
    };

    match last_header {
        // The bootstrap transaction is accepted with id 1 regardless of the
        // anchor: it is written before the store's id counter first moves.
        Some(last) if header.tx_id != 1 => {
            let txid_diff = header.tx_id - last.tx_id;

            if txid_diff < 0 {
                // A stale record from a recycled journal. Hash-valid means it
                // really is an old committed transaction, not noise.
                return Ok(HeaderResolution::Garbage {
                    journal_reuse: hash_valid.then_some(header.tx_id),
                });
            }
            if !hash_valid {
                return Ok(HeaderResolution::Torn(header.tx_id));
            }
            if txid_diff != 1 {
                let reason = if txid_diff == 0 {
                    format!("duplicate transaction id {} with a valid hash", header.tx_id)
                } else {
                    format!(
                        "hash-valid transaction does not continue the sequence: expected {}, \
                         transactions in between are missing",
                        last.tx_id + 1
                    )
                };
                return Err(corruption(journal_name, header.tx_id, reason));
            }
            if header.is_committed() && header.last_page_number <= 0 {
                return Err(corruption(
                    journal_name,
                    header.tx_id,
                    format!(
                        "committed transaction reports last_page_number {}",
                        header.last_page_number
                    ),
                ));
            }
        }
        _ => {
            if !hash_valid {
                return Ok(HeaderResolution::Torn(header.tx_id));
            }
        }
    }

    if !header.is_committed() {
        return Ok(HeaderResolution::Torn(header.tx_id));
    }

    Ok(HeaderResolution::Valid(header))
}

/// Relaxed validity used by the forward scan after garbage: marker, id and
/// size sanity plus the payload hash. Ordering is deliberately ignored; the
/// scan is looking for leftovers of a recycled journal, which are stale by
/// definition.
pub(crate) fn probe_valid_header(
    journal: &mut dyn Pager,
    cursor_4kb: u64,
    capacity_4kb: u64,
) -> Result<bool, StorageError> {
    if cursor_4kb >= capacity_4kb {
        return Ok(false);
    }
    Ok(matches!(
        read_candidate(journal, cursor_4kb, capacity_4kb)?,
        Some((_, true))
    ))
}

/// Decode and structurally check the candidate at `cursor_4kb`, returning the
/// owned header and whether its payload hash verifies. `None` when the bytes
/// cannot be a header (bad marker, negative id, payload past capacity).
fn read_candidate(
    journal: &mut dyn Pager,
    cursor_4kb: u64,
    capacity_4kb: u64,
) -> Result<Option<(TransactionHeader, bool)>, StorageError> {
    let page_number = cursor_4kb / BLOCKS_PER_PAGE;
    let offset_in_page = (cursor_4kb % BLOCKS_PER_PAGE) as usize * JOURNAL_BLOCK_SIZE;

    journal.ensure_mapped(page_number, 1)?;
    let view = journal.acquire_page(page_number)?;
    if view.len() < offset_in_page + TRANSACTION_HEADER_SIZE {
        return Ok(None);
    }

    // Copy the header out of the mapping; all further access is on the owned
    // value, never on reinterpreted bytes.
    let mut buf = [0u8; TRANSACTION_HEADER_SIZE];
    buf.copy_from_slice(&view[offset_in_page..offset_in_page + TRANSACTION_HEADER_SIZE]);
    let header = decode_transaction_header(&buf);

    if header.marker != TRANSACTION_HEADER_MARKER {
        return Ok(None);
    }
    if header.tx_id < 0 {
        return Ok(None);
    }
    if header.compressed_size < 0 {
        return Ok(None);
    }

    // Header + payload must fit in the rest of the journal.
    let needed = TRANSACTION_HEADER_SIZE as u64 + header.compressed_size as u64;
    let remaining = (capacity_4kb - cursor_4kb) * JOURNAL_BLOCK_SIZE as u64;
    if needed > remaining {
        return Ok(None);
    }

    // Extend the mapping over the whole compressed payload, then hash it
    // seeded with the transaction id.
    let pages_needed = pages_for(offset_in_page + needed as usize);
    journal.ensure_mapped(page_number, pages_needed)?;
    let view = journal.acquire_page(page_number)?;
    let payload =
        &view[offset_in_page + TRANSACTION_HEADER_SIZE..offset_in_page + needed as usize];
    let hash_valid = xxh64(payload, header.tx_id as u64) == header.hash;

    Ok(Some((header, hash_valid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{JournalWriter, PageWrite};
    use mini_voron_common::{PAGE_SIZE, TX_COMMIT};
    use mini_voron_pager::ScratchPager;

    const CAPACITY_BLOCKS: u64 = 64;

    fn journal_with(writer: JournalWriter) -> ScratchPager {
        ScratchPager::from_image(&writer.into_image(), CAPACITY_BLOCKS)
    }

    fn committed_tx(tx_id: TxId) -> JournalWriter {
        let mut writer = JournalWriter::new();
        writer.append(tx_id, &[PageWrite::verbatim(1, vec![tx_id as u8; PAGE_SIZE])]);
        writer
    }

    fn resolve(
        pager: &mut ScratchPager,
        cursor: u64,
        last: Option<&TransactionHeader>,
    ) -> Result<HeaderResolution, StorageError> {
        resolve_header(pager, cursor, CAPACITY_BLOCKS, last, "test-journal")
    }

    #[test]
    fn test_valid_committed_transaction() {
        let mut pager = journal_with(committed_tx(1));
        match resolve(&mut pager, 0, None).unwrap() {
            HeaderResolution::Valid(header) => {
                assert_eq!(header.tx_id, 1);
                assert!(header.is_committed());
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_zeroed_journal_is_garbage() {
        let mut pager = ScratchPager::from_image(&[], CAPACITY_BLOCKS);
        match resolve(&mut pager, 0, None).unwrap() {
            HeaderResolution::Garbage { journal_reuse } => assert!(journal_reuse.is_none()),
            other => panic!("expected Garbage, got {other:?}"),
        }
    }

    #[test]
    fn test_past_capacity_is_end() {
        let mut pager = ScratchPager::from_image(&[], CAPACITY_BLOCKS);
        assert!(matches!(
            resolve(&mut pager, CAPACITY_BLOCKS, None).unwrap(),
            HeaderResolution::End
        ));
    }

    #[test]
    fn test_flipped_hash_is_torn() {
        let mut image = committed_tx(1).into_image();
        image[48] ^= 0xFF; // hash field of the first header
        let mut pager = ScratchPager::from_image(&image, CAPACITY_BLOCKS);
        assert!(matches!(
            resolve(&mut pager, 0, None).unwrap(),
            HeaderResolution::Torn(1)
        ));
    }

    #[test]
    fn test_uncommitted_transaction_is_torn() {
        let mut writer = JournalWriter::new();
        writer.append_with_flags(1, &[PageWrite::verbatim(1, vec![0xAB; 128])], 0);
        let mut pager = journal_with(writer);
        assert!(matches!(
            resolve(&mut pager, 0, None).unwrap(),
            HeaderResolution::Torn(1)
        ));
    }

    #[test]
    fn test_stale_transaction_is_garbage_with_reuse() {
        // Journal holds old transaction 12; the pass has already accepted 21.
        let mut pager = journal_with(committed_tx(12));
        let anchor = anchor_header(21);
        match resolve(&mut pager, 0, Some(&anchor)).unwrap() {
            HeaderResolution::Garbage { journal_reuse } => {
                assert_eq!(journal_reuse, Some(12));
            }
            other => panic!("expected Garbage with reuse, got {other:?}"),
        }
    }

    #[test]
    fn test_gap_in_sequence_is_fatal() {
        let mut pager = journal_with(committed_tx(4));
        let anchor = anchor_header(2);
        let err = resolve(&mut pager, 0, Some(&anchor)).unwrap_err();
        match err {
            StorageError::JournalCorruption {
                journal, tx_id, ..
            } => {
                assert_eq!(journal, "test-journal");
                assert_eq!(tx_id, 4);
            }
            other => panic!("expected JournalCorruption, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let mut pager = journal_with(committed_tx(4));
        let anchor = anchor_header(4);
        assert!(matches!(
            resolve(&mut pager, 0, Some(&anchor)),
            Err(StorageError::JournalCorruption { tx_id: 4, .. })
        ));
    }

    #[test]
    fn test_bootstrap_id_bypasses_ordering() {
        let mut pager = journal_with(committed_tx(1));
        let anchor = anchor_header(37);
        assert!(matches!(
            resolve(&mut pager, 0, Some(&anchor)).unwrap(),
            HeaderResolution::Valid(_)
        ));
    }

    #[test]
    fn test_probe_ignores_ordering() {
        let mut pager = journal_with(committed_tx(12));
        assert!(probe_valid_header(&mut pager, 0, CAPACITY_BLOCKS).unwrap());
        // An empty block is not a header.
        assert!(!probe_valid_header(&mut pager, 1, CAPACITY_BLOCKS).unwrap());
    }

    #[test]
    fn test_payload_past_capacity_is_garbage() {
        let mut image = committed_tx(1).into_image();
        // Claim a payload far larger than the journal.
        image[32..40]
            .copy_from_slice(&(CAPACITY_BLOCKS as i64 * JOURNAL_BLOCK_SIZE as i64).to_le_bytes());
        let mut pager = ScratchPager::from_image(&image, CAPACITY_BLOCKS);
        assert!(matches!(
            resolve(&mut pager, 0, None).unwrap(),
            HeaderResolution::Garbage { journal_reuse: None }
        ));
    }

    fn anchor_header(tx_id: TxId) -> TransactionHeader {
        TransactionHeader {
            marker: TRANSACTION_HEADER_MARKER,
            tx_id,
            last_page_number: 1,
            page_count: 1,
            flags: TX_COMMIT,
            compressed_size: 0,
            uncompressed_size: 0,
            hash: 0,
        }
    }
}
