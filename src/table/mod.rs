//! Immutable sorted reference tables.
//!
//! A **table** is a write-once, disk-backed, sorted mapping from reference
//! names to target values, where every record carries the `update_index`
//! (a monotonically increasing logical timestamp) of the write batch that
//! produced it. Tables are the building blocks of the
//! [`stack`](crate::stack): each successful write appends one table, and
//! compaction replaces a contiguous run of tables with a single merged one.
//!
//! ## Design Overview
//!
//! Tables are never modified in place. Updates — including deletions — are
//! expressed as new records in newer tables; a record with no value is a
//! **tombstone** that masks entries for the same name in older tables.
//! Per-table record order is strictly ascending by name, which makes the
//! k-way merge in [`MergedTable`] a simple heap walk.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header** — magic, format version, block size, CRC32.
//! - **Data blocks** — concatenated record cells, cut near the configured
//!   block size, each protected by a trailing CRC32.
//! - **Footer** — the `[min_update_index, max_update_index]` range the
//!   table covers, record count, data-section length, CRC32.
//!
//! There is no block index: tables stay small by construction (the stack
//! compacts them geometrically), so lookups scan blocks sequentially.
//!
//! # Sub-modules
//!
//! - [`writer`] — [`TableWriter`] builds a table from an ascending record
//!   stream.
//! - [`reader`] — [`TableReader`] memory-maps a table and iterates it.
//! - [`merged`] — [`MergedTable`] presents an ordered set of readers as one
//!   last-writer-wins view.
//!
//! # Guarantees
//!
//! - **Immutability:** a published table never changes.
//! - **Integrity:** header, footer, and every data block carry CRC32
//!   checksums; corruption is detected at open or during iteration.
//! - **Atomicity:** the stack writes tables under temporary names and
//!   publishes them by `rename`, so a crash cannot expose a partial table.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod merged;
pub mod reader;
pub mod writer;


// ------------------------------------------------------------------------------------------------
// Re-exports — public API surface
// ------------------------------------------------------------------------------------------------

pub use merged::{MergedIter, MergedTable};
pub use reader::{TableIter, TableReader};
pub use writer::{TableSummary, TableWriter};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const TABLE_MAGIC: [u8; 4] = *b"RFTS";
pub(crate) const TABLE_VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 16;
pub(crate) const FOOTER_SIZE: usize = 36;
pub(crate) const BLOCK_LEN_SIZE: usize = 4;
pub(crate) const BLOCK_CRC_SIZE: usize = 4;

/// Fixed per-table byte overhead (header plus footer).
///
/// The compaction policy deducts this from raw file sizes so that tables
/// holding similar record volumes land in the same size bucket even when
/// the payload is tiny.
pub const TABLE_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations (read, write, merge).
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk bytes do not describe a valid table.
    #[error("malformed table: {0}")]
    Format(String),

    /// Checksum mismatch.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Caller misuse of the writer API (descending names, records outside
    /// the declared update-index limits, missing limits).
    #[error("API misuse: {0}")]
    Api(String),
}

impl TableError {
    /// Returns `true` when this error is a `NotFound` on the underlying
    /// file — the signature of a table deleted by a concurrent compactor.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TableError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

// ------------------------------------------------------------------------------------------------
// Record model
// ------------------------------------------------------------------------------------------------

/// A single reference record: a name, the `update_index` of the write
/// batch that produced it, and the target value.
///
/// `value == None` is a **tombstone** — a deletion marker that masks
/// records for the same name in older tables during merged reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    /// Reference name (e.g. `refs/heads/main`). Opaque bytes; ordering is
    /// plain byte order.
    pub name: Vec<u8>,

    /// Logical timestamp of the write batch that produced this record.
    pub update_index: u64,

    /// Target value (typically an object hash); `None` marks a deletion.
    pub value: Option<Vec<u8>>,
}

impl RefRecord {
    /// Creates a record that sets `name` to `value` at `update_index`.
    pub fn new(name: impl Into<Vec<u8>>, update_index: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            update_index,
            value: Some(value.into()),
        }
    }

    /// Creates a tombstone for `name` at `update_index`.
    pub fn tombstone(name: impl Into<Vec<u8>>, update_index: u64) -> Self {
        Self {
            name: name.into(),
            update_index,
            value: None,
        }
    }

    /// Returns `true` when this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Table file header. Fixed [`HEADER_SIZE`] bytes at the start of the file.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TableHeader {
    /// Magic bytes identifying the table format (`b"RFTS"`).
    pub(crate) magic: [u8; 4],

    /// Table format version.
    pub(crate) version: u32,

    /// Block size the writer targeted. Informational; blocks are
    /// length-prefixed and do not require this to decode.
    pub(crate) block_size: u32,
}

impl TableHeader {
    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        let crc = crc32(&buf[0..12]);
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() < HEADER_SIZE {
            return Err(TableError::Format("header truncated".into()));
        }
        let stored_crc = u32::from_le_bytes(read4(buf, 12));
        if crc32(&buf[0..12]) != stored_crc {
            return Err(TableError::ChecksumMismatch);
        }
        let header = Self {
            magic: read4(buf, 0),
            version: u32::from_le_bytes(read4(buf, 4)),
            block_size: u32::from_le_bytes(read4(buf, 8)),
        };
        if header.magic != TABLE_MAGIC {
            return Err(TableError::Format("header magic mismatch".into()));
        }
        if header.version != TABLE_VERSION {
            return Err(TableError::Format(format!(
                "unsupported table version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

/// Table file footer. Fixed [`FOOTER_SIZE`] bytes at the end of the file.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TableFooter {
    /// Smallest update index this table covers (inclusive).
    pub(crate) min_update_index: u64,

    /// Largest update index this table covers (inclusive).
    pub(crate) max_update_index: u64,

    /// Number of record cells stored across all data blocks.
    pub(crate) record_count: u64,

    /// Total byte length of the data-block section between header and
    /// footer. Lets the reader validate the file length exactly.
    pub(crate) data_len: u64,
}

impl TableFooter {
    pub(crate) fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.min_update_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.max_update_index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_len.to_le_bytes());
        let crc = crc32(&buf[0..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() < FOOTER_SIZE {
            return Err(TableError::Format("footer truncated".into()));
        }
        let stored_crc = u32::from_le_bytes(read4(buf, 32));
        if crc32(&buf[0..32]) != stored_crc {
            return Err(TableError::ChecksumMismatch);
        }
        Ok(Self {
            min_update_index: u64::from_le_bytes(read8(buf, 0)),
            max_update_index: u64::from_le_bytes(read8(buf, 8)),
            record_count: u64::from_le_bytes(read8(buf, 16)),
            data_len: u64::from_le_bytes(read8(buf, 24)),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Record cell encoding
// ------------------------------------------------------------------------------------------------
//
// Cell layout inside a data block:
//
//   [name_len u32][tombstone u8][update_index u64][name bytes]
//   [value_len u32][value bytes]          (value section absent for tombstones)
//
// All integers little-endian.

const CELL_TOMBSTONE: u8 = 1;
const CELL_VALUE: u8 = 0;

/// Appends the encoded form of `rec` to `buf`.
pub(crate) fn encode_cell(rec: &RefRecord, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(rec.name.len() as u32).to_le_bytes());
    buf.push(if rec.is_tombstone() {
        CELL_TOMBSTONE
    } else {
        CELL_VALUE
    });
    buf.extend_from_slice(&rec.update_index.to_le_bytes());
    buf.extend_from_slice(&rec.name);
    if let Some(value) = &rec.value {
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
}

/// Decodes one cell from the front of `buf`, returning the record and the
/// number of bytes consumed.
pub(crate) fn decode_cell(buf: &[u8]) -> Result<(RefRecord, usize), TableError> {
    const CELL_HDR: usize = 4 + 1 + 8;
    if buf.len() < CELL_HDR {
        return Err(TableError::Format("record cell truncated".into()));
    }
    let name_len = u32::from_le_bytes(read4(buf, 0)) as usize;
    let tag = buf[4];
    let update_index = u64::from_le_bytes(read8(buf, 5));

    let mut off = CELL_HDR;
    if buf.len() < off + name_len {
        return Err(TableError::Format("record name truncated".into()));
    }
    let name = buf[off..off + name_len].to_vec();
    off += name_len;

    let value = match tag {
        CELL_TOMBSTONE => None,
        CELL_VALUE => {
            if buf.len() < off + 4 {
                return Err(TableError::Format("record value length truncated".into()));
            }
            let value_len = u32::from_le_bytes(read4(buf, off)) as usize;
            off += 4;
            if buf.len() < off + value_len {
                return Err(TableError::Format("record value truncated".into()));
            }
            let value = buf[off..off + value_len].to_vec();
            off += value_len;
            Some(value)
        }
        other => {
            return Err(TableError::Format(format!(
                "unknown record cell tag {other}"
            )));
        }
    };

    Ok((
        RefRecord {
            name,
            update_index,
            value,
        },
        off,
    ))
}

// ------------------------------------------------------------------------------------------------
// Small byte helpers
// ------------------------------------------------------------------------------------------------

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub(crate) fn read4(buf: &[u8], off: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[off..off + 4]);
    out
}

pub(crate) fn read8(buf: &[u8], off: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[off..off + 8]);
    out
}
