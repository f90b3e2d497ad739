//! Merged view — presents an ordered set of table readers as one store.
//!
//! [`MergedTable`] owns its readers, oldest first (the stack's list-file
//! order). Iteration is a heap-based k-way merge ordered by
//! `(name ASC, update_index DESC, stack position newest-first)` with
//! per-name deduplication: for every name exactly one record is yielded —
//! the most recent write, which is the last-writer-wins view of the stack.
//!
//! Tombstones **are** yielded: the compactor needs them to mask older
//! tables, and dropping them is only legal when compacting from the
//! bottom of the stack. Read paths that answer user queries filter them
//! via [`MergedTable::read_ref`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{RefRecord, TableIter, TableReader};

/// An ordered sequence of table readers presented as a single
/// last-writer-wins store.
#[derive(Debug)]
pub struct MergedTable {
    /// Readers in stack order: index 0 is the oldest table.
    readers: Vec<TableReader>,
}

impl MergedTable {
    /// Takes ownership of `readers` (oldest first).
    pub fn new(readers: Vec<TableReader>) -> Self {
        Self { readers }
    }

    /// An empty view, used before the first reload.
    pub fn empty() -> Self {
        Self {
            readers: Vec::new(),
        }
    }

    /// The readers composing this view, oldest first.
    pub fn readers(&self) -> &[TableReader] {
        &self.readers
    }

    /// Number of tables in this view.
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Returns `true` when the view holds no tables.
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Hands the owned readers back, leaving this view empty. The
    /// reloader uses this to move still-listed readers into the
    /// replacement view.
    pub(crate) fn take_readers(&mut self) -> Vec<TableReader> {
        std::mem::take(&mut self.readers)
    }

    /// Merged scan of all records, one winning record per name.
    pub fn iter(&self) -> MergedIter<'_> {
        MergedIter::new(self.readers.iter().map(|r| r.iter()).collect())
    }

    /// Merged scan starting at the first name `>= name`.
    pub fn seek(&self, name: &[u8]) -> MergedIter<'_> {
        MergedIter::new(self.readers.iter().map(|r| r.seek(name)).collect())
    }

    /// Point lookup: the current value of `name`, or `None` when the name
    /// is absent or its most recent record is a tombstone.
    pub fn read_ref(&self, name: &[u8]) -> Option<RefRecord> {
        self.seek(name)
            .next()
            .filter(|rec| rec.name == name && !rec.is_tombstone())
    }
}

// ------------------------------------------------------------------------------------------------
// MergedIter — heap-based k-way merge over table iterators
// ------------------------------------------------------------------------------------------------

/// Merge iterator yielding the winning record per name across all source
/// tables.
pub struct MergedIter<'a> {
    iters: Vec<TableIter<'a>>,
    heap: BinaryHeap<MergedHeapEntry>,
    last_name: Option<Vec<u8>>,
}

struct MergedHeapEntry {
    record: RefRecord,
    /// Index into `iters`; higher index = newer table.
    source: usize,
}

impl MergedHeapEntry {
    /// `(name ASC, update_index DESC, source DESC)` — the record that
    /// should win for a name sorts first.
    fn ordering(&self, other: &Self) -> Ordering {
        self.record
            .name
            .cmp(&other.record.name)
            .then_with(|| other.record.update_index.cmp(&self.record.update_index))
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl Ord for MergedHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so the winning record pops first.
        self.ordering(other).reverse()
    }
}

impl PartialOrd for MergedHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergedHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ordering(other) == Ordering::Equal
    }
}

impl Eq for MergedHeapEntry {}

impl<'a> MergedIter<'a> {
    pub(crate) fn new(mut iters: Vec<TableIter<'a>>) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, iter) in iters.iter_mut().enumerate() {
            if let Some(record) = iter.next() {
                heap.push(MergedHeapEntry { record, source });
            }
        }
        Self {
            iters,
            heap,
            last_name: None,
        }
    }
}

impl Iterator for MergedIter<'_> {
    type Item = RefRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.heap.pop()?;
            if let Some(next_record) = self.iters[entry.source].next() {
                self.heap.push(MergedHeapEntry {
                    record: next_record,
                    source: entry.source,
                });
            }
            // Older versions of a name sort directly after the winner.
            if self.last_name.as_deref() == Some(entry.record.name.as_slice()) {
                continue;
            }
            self.last_name = Some(entry.record.name.clone());
            return Some(entry.record);
        }
    }
}
