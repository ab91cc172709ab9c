use std::fmt;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Addressing quantum inside a journal file. Transaction headers start on
/// 4 KiB boundaries so a torn tail is bounded to 4 KiB.
pub const JOURNAL_BLOCK_SIZE: usize = 4096;

/// 8 KiB data-file page.
pub const PAGE_SIZE: usize = 8192;

/// Journal blocks per data page.
pub const BLOCKS_PER_PAGE: u64 = (PAGE_SIZE / JOURNAL_BLOCK_SIZE) as u64;

/// Transaction identifier (1-based; signed so stray bytes decode as negative
/// rather than as a huge id).
pub type TxId = i64;

/// Logical page index into the data file.
pub type PageNumber = u64;

/// Number of whole journal blocks needed to hold `bytes`.
pub fn journal_blocks_for(bytes: u64) -> u64 {
    bytes.div_ceil(JOURNAL_BLOCK_SIZE as u64)
}

/// Number of whole data pages needed to hold `bytes`.
pub fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

// ---------------------------------------------------------------------------
// On-disk transaction header (fixed 64 bytes)
// ---------------------------------------------------------------------------

/// Magic value opening every transaction header.
pub const TRANSACTION_HEADER_MARKER: u64 = u64::from_le_bytes(*b"VRNJTXN1");

/// Fixed-size header written at a 4 KiB boundary before each compressed
/// transaction payload.
///
/// Layout (little-endian):
///   marker            : u64  (8)
///   tx_id             : i64  (8)
///   last_page_number  : i64  (8)
///   page_count        : u32  (4)
///   flags             : u32  (4)  — bit 0 = committed
///   compressed_size   : i64  (8)
///   uncompressed_size : i64  (8)
///   hash              : u64  (8)  — XXH64(payload, seed = tx_id)
///   reserved          : u64  (8)
///   ──────────────────────────
///   total             : 64 bytes
pub const TRANSACTION_HEADER_SIZE: usize = 64;

/// Commit bit in `TransactionHeader::flags`. A transaction without it is not
/// durable and ends recovery.
pub const TX_COMMIT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    pub marker: u64,
    pub tx_id: TxId,
    pub last_page_number: i64,
    pub page_count: u32,
    pub flags: u32,
    pub compressed_size: i64,
    pub uncompressed_size: i64,
    pub hash: u64,
}

impl TransactionHeader {
    pub fn is_committed(&self) -> bool {
        self.flags & TX_COMMIT != 0
    }

    /// Journal blocks occupied by this transaction (header + payload,
    /// rounded up to the block boundary).
    pub fn blocks_on_disk(&self) -> u64 {
        journal_blocks_for(TRANSACTION_HEADER_SIZE as u64 + self.compressed_size.max(0) as u64)
    }
}

/// Decode a header from raw bytes. Callers copy the header out of the pager's
/// mapping into an owned value; field access is never a reinterpret cast over
/// borrowed memory.
pub fn decode_transaction_header(buf: &[u8; TRANSACTION_HEADER_SIZE]) -> TransactionHeader {
    TransactionHeader {
        marker: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        tx_id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        last_page_number: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
        page_count: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        flags: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        compressed_size: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
        uncompressed_size: i64::from_le_bytes(buf[40..48].try_into().unwrap()),
        hash: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
    }
}

/// Encode a header into its on-disk bytes (reserved tail left zero).
pub fn encode_transaction_header(header: &TransactionHeader) -> [u8; TRANSACTION_HEADER_SIZE] {
    let mut buf = [0u8; TRANSACTION_HEADER_SIZE];
    buf[0..8].copy_from_slice(&header.marker.to_le_bytes());
    buf[8..16].copy_from_slice(&header.tx_id.to_le_bytes());
    buf[16..24].copy_from_slice(&header.last_page_number.to_le_bytes());
    buf[24..28].copy_from_slice(&header.page_count.to_le_bytes());
    buf[28..32].copy_from_slice(&header.flags.to_le_bytes());
    buf[32..40].copy_from_slice(&header.compressed_size.to_le_bytes());
    buf[40..48].copy_from_slice(&header.uncompressed_size.to_le_bytes());
    buf[48..56].copy_from_slice(&header.hash.to_le_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Per-page payload record (fixed 24 bytes)
// ---------------------------------------------------------------------------

/// Fixed-size record repeated `page_count` times at the start of the
/// decompressed payload.
///
/// Layout (little-endian):
///   page_number : i64  (8)
///   size        : i64  (8)  — uncompressed image length, may span pages
///   diff_size   : i64  (8)  — 0 means a verbatim image follows
pub const PAGE_INFO_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_number: i64,
    pub size: i64,
    pub diff_size: i64,
}

impl PageInfo {
    pub fn is_verbatim(&self) -> bool {
        self.diff_size == 0
    }
}

pub fn decode_page_info(buf: &[u8; PAGE_INFO_SIZE]) -> PageInfo {
    PageInfo {
        page_number: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
        size: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        diff_size: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
    }
}

pub fn encode_page_info(info: &PageInfo) -> [u8; PAGE_INFO_SIZE] {
    let mut buf = [0u8; PAGE_INFO_SIZE];
    buf[0..8].copy_from_slice(&info.page_number.to_le_bytes());
    buf[8..16].copy_from_slice(&info.size.to_le_bytes());
    buf[16..24].copy_from_slice(&info.diff_size.to_le_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal {journal}: transaction {tx_id}: {reason}")]
    JournalCorruption {
        journal: String,
        tx_id: TxId,
        reason: String,
    },

    #[error("malformed page diff: {0}")]
    MalformedDiff(String),

    #[error("page {page_number} is beyond the allocated range ({allocated} pages)")]
    PageOutOfBounds {
        page_number: PageNumber,
        allocated: u64,
    },

    #[error("could not grow pager to {requested_pages} pages: {source}")]
    GrowFailed {
        requested_pages: u64,
        source: std::io::Error,
    },

    #[error("decompression failed: {0}")]
    Decompression(String),
}

impl fmt::Display for TransactionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tx(id={}, pages={}, last_page={}, compressed={}, committed={})",
            self.tx_id,
            self.page_count,
            self.last_page_number,
            self.compressed_size,
            self.is_committed()
        )
    }
}
