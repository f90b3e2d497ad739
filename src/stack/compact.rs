//! Range compaction — replace a contiguous run of tables with one
//! equivalent merged table.
//!
//! Compaction is the long-running stack operation, so it holds the list
//! lock only at the edges: once the target range is reserved with
//! per-table lock files, the list lock is released and appends may land
//! on top of the stack concurrently. The final splice re-acquires the
//! list lock, re-reads the list (which may have grown), substitutes the
//! merged table for the obsoleted range, and commits by rename.
//!
//! Tombstones are copied through unless the range starts at the bottom of
//! the stack — with no older tables left to mask, a deletion marker
//! carries no information.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::table::{MergedIter, TableWriter};

use super::lock::LockFile;
use super::{Stack, StackError, TempTable, fsync_dir, names};

impl Stack {
    /// Compacts every table into one. A no-op on stacks of fewer than two
    /// tables.
    pub fn compact_all(&mut self) -> Result<(), StackError> {
        if self.merged.len() < 2 {
            return Ok(());
        }
        self.compact_range(0, self.merged.len() - 1)
    }

    /// Runs the size-bucketing policy over the current table sizes and
    /// compacts the suggested range, if any.
    ///
    /// A transient [`StackError::Lock`] from the compaction is swallowed —
    /// another mutator owns the stack right now, and the heuristic will
    /// fire again after a future append. The failure still counts in
    /// [`compaction_stats`](Stack::compaction_stats).
    pub fn auto_compact(&mut self) -> Result<(), StackError> {
        let sizes: Vec<u64> = self
            .merged
            .readers()
            .iter()
            .map(|r| {
                r.size()
                    .saturating_sub(crate::table::TABLE_OVERHEAD as u64)
                    .max(1)
            })
            .collect();
        let Some(segment) = super::policy::suggest_compaction_segment(&sizes) else {
            return Ok(());
        };
        debug!(
            start = segment.start,
            end = segment.end,
            "auto-compaction triggered"
        );
        match self.compact_range(segment.start, segment.end - 1) {
            Err(err) if err.is_lock() => {
                debug!(%err, "auto-compaction skipped; stack is busy");
                Ok(())
            }
            other => other,
        }
    }

    /// Replaces tables `[first..=last]` with one equivalent table.
    ///
    /// Returns `Ok(())` when done (including the `first >= last` no-op),
    /// [`StackError::Lock`] when another mutator interfered (retry later);
    /// anything else is fatal. The stack is never left corrupted: either
    /// the list-file rename committed the swap, or every temporary
    /// artefact has been swept.
    pub fn compact_range(&mut self, first: usize, last: usize) -> Result<(), StackError> {
        self.stats.attempts += 1;
        match self.compact_range_inner(first, last) {
            Err(err) if err.is_lock() => {
                self.stats.failures += 1;
                Err(err)
            }
            other => other,
        }
    }

    fn compact_range_inner(&mut self, first: usize, last: usize) -> Result<(), StackError> {
        if first >= last {
            return Ok(());
        }
        if last >= self.merged.len() {
            return Err(StackError::Api(format!(
                "compaction range [{first}, {last}] exceeds stack of {} tables",
                self.merged.len()
            )));
        }

        let list_lock = LockFile::acquire(self.lock_path())?;
        if !self.uptodate()? {
            return Err(StackError::Lock(
                "stack view is stale; reload required".into(),
            ));
        }

        // Reserve the range. A held per-table lock means another
        // compactor owns part of it — transient, try again later.
        let mut table_locks: Vec<LockFile> = Vec::with_capacity(last - first + 1);
        let mut delete_on_success: Vec<PathBuf> = Vec::with_capacity(last - first + 1);
        let mut obsolete_names: Vec<String> = Vec::with_capacity(last - first + 1);
        for reader in &self.merged.readers()[first..=last] {
            let lock = LockFile::acquire(self.dir.join(format!("{}.lock", reader.name())))?;
            table_locks.push(lock);
            delete_on_success.push(self.dir.join(reader.name()));
            obsolete_names.push(reader.name().to_owned());
        }

        // The subtable locks now protect the range; drop the list lock so
        // concurrent appends can land on top while we merge.
        drop(list_lock);

        let readers = &self.merged.readers()[first..=last];
        let min = readers[0].min_update_index();
        let max = readers[readers.len() - 1].max_update_index();
        let input_bytes: u64 = readers.iter().map(|r| r.size()).sum();

        let (mut temp, file) = TempTable::create(&self.dir, min, max)?;
        let mut writer = TableWriter::new(file, self.block_size())?;
        writer.set_limits(min, max)?;

        // Compacting from the bottom leaves no older tables for a
        // tombstone to mask.
        let drop_tombstones = first == 0;
        let merge = MergedIter::new(readers.iter().map(|r| r.iter()).collect());
        for record in merge {
            if drop_tombstones && record.is_tombstone() {
                continue;
            }
            writer.add_ref(&record)?;
        }
        let summary = writer.finish()?;
        self.stats.bytes += input_bytes;

        // Re-acquire the list lock for the splice.
        let mut list_lock = LockFile::acquire(self.lock_path())?;

        let final_name =
            names::format_table_name(summary.min_update_index, summary.max_update_index);
        fs::rename(temp.path(), self.dir.join(&final_name))?;
        temp.disarm();

        // The list may have gained new tables on top since we released
        // the lock; splice the merged table into the fresh listing at the
        // position of the range it replaces.
        let names_now = names::read_list_file(self.list_file())?;
        let mut new_names: Vec<String> = Vec::with_capacity(names_now.len());
        let mut spliced = false;
        for name in names_now {
            if obsolete_names.contains(&name) {
                if !spliced {
                    new_names.push(final_name.clone());
                    spliced = true;
                }
                continue;
            }
            new_names.push(name);
        }
        if !spliced {
            return Err(StackError::Io(std::io::Error::other(
                "compacted tables disappeared from the list file",
            )));
        }

        list_lock.write(&names::format_names(&new_names))?;
        list_lock.commit(self.list_file())?;
        fsync_dir(&self.dir)?;

        info!(
            table = %final_name,
            replaced = obsolete_names.len(),
            records = summary.record_count,
            "compacted table range"
        );

        // The obsoleted tables are no longer referenced by any published
        // list; a straggling reader recovers via its reload retry loop.
        for path in delete_on_success {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), %e, "failed to remove compacted table file");
            }
        }
        drop(table_locks);

        self.reload()
    }
}
