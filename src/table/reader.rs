//! Table reader — memory-mapped access to one immutable table.
//!
//! [`TableReader::open`] maps the file, verifies header and footer
//! integrity, and exposes the metadata the stack needs to order tables
//! (`min_update_index` / `max_update_index`) and to drive the compaction
//! policy (`size`). Record access is a sequential, block-by-block scan:
//! tables carry no index, and the stack keeps them small enough that
//! linear seeks are cheap.
//!
//! Block-level corruption discovered mid-scan is logged and treated as
//! end-of-table; header/footer corruption is rejected at open time.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use super::{
    BLOCK_CRC_SIZE, BLOCK_LEN_SIZE, FOOTER_SIZE, HEADER_SIZE, RefRecord, TableError, TableFooter,
    TableHeader, crc32, decode_cell, read4,
};

/// Read handle for a single table file.
#[derive(Debug)]
pub struct TableReader {
    /// Basename under the stack directory, e.g.
    /// `000000000001-000000000002.ref`.
    name: String,

    mmap: Mmap,

    footer: TableFooter,
}

impl TableReader {
    /// Opens and verifies a table.
    ///
    /// `name` is the basename the stack lists the table under. A missing
    /// file surfaces as [`TableError::Io`] with `ErrorKind::NotFound` —
    /// the reloader relies on that to detect concurrent compaction.
    pub fn open(path: &Path, name: impl Into<String>) -> Result<Self, TableError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(TableError::Format("file too small for a table".into()));
        }

        // Header checks magic, version, and its own CRC.
        TableHeader::decode(&mmap[..HEADER_SIZE])?;

        let footer = TableFooter::decode(&mmap[mmap.len() - FOOTER_SIZE..])?;
        let expected_len = HEADER_SIZE as u64 + footer.data_len + FOOTER_SIZE as u64;
        if expected_len != mmap.len() as u64 {
            return Err(TableError::Format(format!(
                "file length {} does not match footer ({} expected)",
                mmap.len(),
                expected_len
            )));
        }

        Ok(Self {
            name: name.into(),
            mmap,
            footer,
        })
    }

    /// Basename this table is listed under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// On-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Smallest update index this table covers (inclusive).
    pub fn min_update_index(&self) -> u64 {
        self.footer.min_update_index
    }

    /// Largest update index this table covers (inclusive).
    pub fn max_update_index(&self) -> u64 {
        self.footer.max_update_index
    }

    /// Number of records stored in this table.
    pub fn record_count(&self) -> u64 {
        self.footer.record_count
    }

    /// Iterates all records in ascending name order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            data: &self.mmap[HEADER_SIZE..self.mmap.len() - FOOTER_SIZE],
            pos: 0,
            block: Vec::new(),
            cursor: 0,
            pending: None,
        }
    }

    /// Iterates records starting at the first one whose name is
    /// `>= name`.
    pub fn seek(&self, name: &[u8]) -> TableIter<'_> {
        let mut iter = self.iter();
        iter.skip_to(name);
        iter
    }
}

/// Sequential record iterator over one table's data blocks.
pub struct TableIter<'a> {
    /// The data-block region of the file (header and footer stripped).
    data: &'a [u8],

    /// Offset of the next block within `data`.
    pos: usize,

    /// Decoded payload of the current block.
    block: Vec<u8>,

    /// Offset of the next cell within `block`.
    cursor: usize,

    /// Record decoded during a seek but not yet yielded.
    pending: Option<RefRecord>,
}

impl TableIter<'_> {
    /// Advances past every record whose name sorts before `name`, leaving
    /// the first record with `record.name >= name` pending.
    fn skip_to(&mut self, name: &[u8]) {
        while let Some(rec) = self.next() {
            if rec.name.as_slice() >= name {
                self.pending = Some(rec);
                return;
            }
        }
    }

    /// Loads the next data block into `self.block`. Returns `false` at
    /// end of data or on corruption (which is logged and ends the scan).
    fn load_block(&mut self) -> bool {
        if self.pos >= self.data.len() {
            return false;
        }
        if self.pos + BLOCK_LEN_SIZE > self.data.len() {
            warn!(pos = self.pos, "truncated block length; ending table scan");
            self.pos = self.data.len();
            return false;
        }
        let len = u32::from_le_bytes(read4(self.data, self.pos)) as usize;
        let payload_start = self.pos + BLOCK_LEN_SIZE;
        let payload_end = payload_start + len;
        if payload_end + BLOCK_CRC_SIZE > self.data.len() {
            warn!(pos = self.pos, len, "truncated data block; ending table scan");
            self.pos = self.data.len();
            return false;
        }
        let payload = &self.data[payload_start..payload_end];
        let stored_crc = u32::from_le_bytes(read4(self.data, payload_end));
        if crc32(payload) != stored_crc {
            warn!(pos = self.pos, "data block checksum mismatch; ending table scan");
            self.pos = self.data.len();
            return false;
        }
        self.block = payload.to_vec();
        self.cursor = 0;
        self.pos = payload_end + BLOCK_CRC_SIZE;
        true
    }
}

impl Iterator for TableIter<'_> {
    type Item = RefRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(rec) = self.pending.take() {
            return Some(rec);
        }
        loop {
            if self.cursor < self.block.len() {
                match decode_cell(&self.block[self.cursor..]) {
                    Ok((rec, consumed)) => {
                        self.cursor += consumed;
                        return Some(rec);
                    }
                    Err(e) => {
                        warn!(cursor = self.cursor, %e, "record decode error; ending table scan");
                        self.block.clear();
                        self.pos = self.data.len();
                        return None;
                    }
                }
            }
            if !self.load_block() {
                return None;
            }
        }
    }
}
