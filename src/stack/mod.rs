//! # Reftable stack
//!
//! The stack is the mutation protocol over an append-only sequence of
//! immutable sorted tables living in a single directory. Membership is
//! recorded in one **list file** (`refs`): a newline-separated sequence
//! of table basenames, oldest first. The union of the listed tables — a
//! [`MergedTable`] — is the live reference database.
//!
//! ## Mutation protocol
//!
//! Every mutation follows the same shape:
//!
//! 1. acquire the list lock (`refs.lock`, exclusive creation),
//! 2. verify the in-memory view still matches the list file on disk,
//! 3. write new table files under temporary names and `rename` them in,
//! 4. write the next list contents into the lock file and promote it by
//!    `rename(refs.lock, refs)` — the atomic commit,
//! 5. reload the in-memory view.
//!
//! The list-file rename is the linearisation point: a concurrent reader
//! keeps seeing its coherent pre-commit view until its own `reload`
//! observes the post-commit list. No torn state is ever exposed.
//!
//! ## Concurrency model
//!
//! One `Stack` handle serves one caller at a time — mutators take
//! `&mut self` and the type carries no internal locking. Coordination
//! between *processes* (or between independent handles over the same
//! directory) is the lock-file protocol's job: a handle whose view went
//! stale fails its next mutation with [`StackError::Lock`], reloads, and
//! retries at the caller's discretion.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`names`] | List-file codec and the `NNN…-MMM….ref` filename grammar |
//! | [`lock`] | Exclusive-creation lock files with promote-by-rename |
//! | [`policy`] | Log₂ size-bucketing compaction heuristic |
//! | `compact` | Range compaction: select, lock, rewrite, swap |

pub mod lock;
pub mod names;
pub mod policy;

mod compact;

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distr::Alphanumeric;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::table::{MergedTable, TableError, TableReader, TableWriter};

use lock::{LockError, LockFile};

/// Basename of the list file inside a stack directory.
pub const LIST_FILENAME: &str = "refs";

/// Reload gives up only after this deadline has passed *and* more than
/// three attempts were made; the first attempts retry unconditionally.
const RELOAD_DEADLINE: Duration = Duration::from_secs(3);
const RELOAD_MAX_FAST_TRIES: u32 = 3;

/// Cap for the reloader's jittered exponential backoff.
const BACKOFF_CAP_MICROS: u64 = 100_000;

/// Attempts at picking an unused random temp-file suffix.
const TEMP_CREATE_TRIES: u32 = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by stack operations.
#[derive(Debug, Error)]
pub enum StackError {
    /// Another mutator holds the stack, or this handle's view is stale.
    /// Transient: reload and retry.
    #[error("stack is locked: {0}")]
    Lock(String),

    /// Caller misuse — typically writer limits below the required next
    /// update index.
    #[error("API misuse: {0}")]
    Api(String),

    /// Error from the table layer (corruption, missing file, table I/O).
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<LockError> for StackError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Held(path) => StackError::Lock(format!("{} is held", path.display())),
            LockError::Io(e) => StackError::Io(e),
        }
    }
}

impl StackError {
    /// Returns `true` for the transient band — the caller should reload
    /// and may retry.
    pub fn is_lock(&self) -> bool {
        matches!(self, StackError::Lock(_))
    }

    /// Returns `true` when the root cause is a missing table file — the
    /// signature of a concurrent compactor between list read and open.
    fn is_not_found(&self) -> bool {
        match self {
            StackError::Table(e) => e.is_not_found(),
            StackError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration and statistics
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Stack`] handle.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Target data-block size passed to every table writer the stack
    /// creates.
    pub block_size: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

/// Compaction statistics accumulated over a stack handle's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Raw on-disk bytes of the tables fed into compactions (input sizes,
    /// not output sizes).
    pub bytes: u64,

    /// Number of `compact_range` entries.
    pub attempts: u64,

    /// Number of transient (retryable) compaction failures.
    pub failures: u64,
}

// ------------------------------------------------------------------------------------------------
// Stack
// ------------------------------------------------------------------------------------------------

/// Handle to a reftable stack rooted at one directory.
#[derive(Debug)]
pub struct Stack {
    /// Directory holding the list file and every table.
    dir: PathBuf,

    /// Path of the list file (`dir/refs`).
    list_file: PathBuf,

    config: StackConfig,

    /// Current merged view; agrees with the list file after every
    /// successful mutation or reload.
    merged: MergedTable,

    pub(crate) stats: CompactionStats,
}

impl Stack {
    /// Opens (or creates) the stack rooted at `dir` and loads the current
    /// table set.
    pub fn open(dir: impl AsRef<Path>, config: StackConfig) -> Result<Self, StackError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let list_file = dir.join(LIST_FILENAME);
        let mut stack = Self {
            dir,
            list_file,
            config,
            merged: MergedTable::empty(),
            stats: CompactionStats::default(),
        };
        stack.reload()?;
        info!(dir = %stack.dir.display(), tables = stack.merged.len(), "opened stack");
        Ok(stack)
    }

    /// Directory this stack lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Borrow of the current merged view. Valid until the next mutating
    /// or reloading call on this handle.
    pub fn merged(&self) -> &MergedTable {
        &self.merged
    }

    /// Number of tables currently loaded.
    pub fn len(&self) -> usize {
        self.merged.len()
    }

    /// Returns `true` when no tables are loaded.
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Compaction statistics accumulated by this handle.
    pub fn compaction_stats(&self) -> CompactionStats {
        self.stats
    }

    /// The update index the next write batch must use: one past the top
    /// table's `max_update_index`, or 1 on an empty stack.
    pub fn next_update_index(&self) -> u64 {
        self.merged
            .readers()
            .last()
            .map(|r| r.max_update_index() + 1)
            .unwrap_or(1)
    }

    // --------------------------------------------------------------------
    // Reloader
    // --------------------------------------------------------------------

    /// Brings the in-memory merged view into agreement with the list file
    /// on disk.
    ///
    /// A table that vanishes between the list read and the file open means
    /// a concurrent compactor swapped the stack underneath us; the list is
    /// re-read and, if it changed, the open is retried under a capped
    /// jittered backoff. An unchanged list with a missing table is genuine
    /// corruption and fails immediately.
    pub fn reload(&mut self) -> Result<(), StackError> {
        let deadline = Instant::now() + RELOAD_DEADLINE;
        let mut tries: u32 = 0;
        let mut delay_micros: u64 = 0;
        let mut last_err: Option<StackError> = None;

        loop {
            tries += 1;
            if tries > RELOAD_MAX_FAST_TRIES && Instant::now() >= deadline {
                return Err(last_err.unwrap_or_else(|| {
                    StackError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "reload deadline exceeded",
                    ))
                }));
            }

            let names = names::read_list_file(&self.list_file)?;
            let err = match self.reload_once(&names) {
                Ok(()) => {
                    debug!(tables = self.merged.len(), "reloaded stack");
                    return Ok(());
                }
                Err(err) => err,
            };
            if !err.is_not_found() {
                return Err(err);
            }

            // A listed table is gone. If the list itself did not change,
            // nobody is racing us — the table is genuinely missing.
            let names_after = names::read_list_file(&self.list_file)?;
            if names_after == names {
                return Err(err);
            }

            debug!(tries, "list file changed during reload; backing off");
            last_err = Some(err);
            delay_micros = (delay_micros
                + rand::rng().random_range(0..=delay_micros)
                + 100)
                .min(BACKOFF_CAP_MICROS);
            thread::sleep(Duration::from_micros(delay_micros));
        }
    }

    /// One reload attempt against a fixed name list.
    ///
    /// Readers still listed are moved from the old merged view into the
    /// new one; the rest are opened fresh. All opens happen before any
    /// ownership moves, so a failure drops only the newly opened readers
    /// and leaves the current view untouched.
    fn reload_once(&mut self, names: &[String]) -> Result<(), StackError> {
        use std::collections::HashMap;

        // How many readers per name the current view can donate.
        let mut reusable: HashMap<String, usize> = HashMap::new();
        for reader in self.merged.readers() {
            *reusable.entry(reader.name().to_owned()).or_insert(0) += 1;
        }

        // Open every table the current view cannot supply. Dropping this
        // map on an error path closes the fresh readers.
        let mut fresh: HashMap<String, Vec<TableReader>> = HashMap::new();
        for name in names {
            let claimable = reusable.get_mut(name.as_str());
            match claimable {
                Some(n) if *n > 0 => *n -= 1,
                _ => {
                    let reader = TableReader::open(&self.dir.join(name), name.clone())?;
                    fresh.entry(name.clone()).or_default().push(reader);
                }
            }
        }

        // Assemble the new view in list order; infallible from here on.
        let mut donors: Vec<Option<TableReader>> =
            self.merged.take_readers().into_iter().map(Some).collect();
        let mut assembled = Vec::with_capacity(names.len());
        for name in names {
            let claimed = donors
                .iter_mut()
                .find(|slot| matches!(slot, Some(r) if r.name() == name.as_str()))
                .and_then(|slot| slot.take());
            match claimed {
                Some(reader) => assembled.push(reader),
                None => {
                    let reader = fresh
                        .get_mut(name.as_str())
                        .and_then(|v| v.pop())
                        .ok_or_else(|| {
                            StackError::Io(io::Error::other("reload lost an opened reader"))
                        })?;
                    assembled.push(reader);
                }
            }
        }

        self.merged = MergedTable::new(assembled);
        // Retired readers (still-Some donors) close when dropped here.
        Ok(())
    }

    /// Compares the loaded reader names element-by-element against the
    /// list file on disk.
    fn uptodate(&self) -> Result<bool, StackError> {
        let names = names::read_list_file(&self.list_file)?;
        let readers = self.merged.readers();
        if names.len() != readers.len() {
            return Ok(false);
        }
        Ok(names
            .iter()
            .zip(readers)
            .all(|(name, reader)| name.as_str() == reader.name()))
    }

    // --------------------------------------------------------------------
    // Appender
    // --------------------------------------------------------------------

    /// Appends one table produced by `write_cb`, then runs the automatic
    /// compaction heuristic.
    ///
    /// On [`StackError::Lock`] from the append, the stack reloads itself
    /// before returning so the caller can immediately retry its
    /// higher-level transaction against the fresh view.
    pub fn add<F>(&mut self, write_cb: F) -> Result<(), StackError>
    where
        F: FnOnce(&mut TableWriter) -> Result<(), TableError>,
    {
        match self.try_add(write_cb) {
            Ok(()) => self.auto_compact(),
            Err(err) if err.is_lock() => {
                self.reload()?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// One attempt at appending a table; fails with [`StackError::Lock`]
    /// when another mutator holds the stack or this handle's view is
    /// stale.
    pub fn try_add<F>(&mut self, write_cb: F) -> Result<(), StackError>
    where
        F: FnOnce(&mut TableWriter) -> Result<(), TableError>,
    {
        let mut list_lock = LockFile::acquire(self.lock_path())?;
        if !self.uptodate()? {
            return Err(StackError::Lock(
                "stack view is stale; reload required".into(),
            ));
        }

        let next = self.next_update_index();
        let (mut temp, file) = TempTable::create(&self.dir, next, next)?;

        let mut writer = TableWriter::new(file, self.config.block_size)?;
        write_cb(&mut writer)?;
        if writer.min_update_index() < next {
            return Err(StackError::Api(format!(
                "writer min_update_index {} below required {next}",
                writer.min_update_index()
            )));
        }
        let summary = writer.finish()?;

        let final_name = names::format_table_name(summary.min_update_index, summary.max_update_index);
        fs::rename(temp.path(), self.dir.join(&final_name))?;
        temp.disarm();

        let mut new_names: Vec<String> = self
            .merged
            .readers()
            .iter()
            .map(|r| r.name().to_owned())
            .collect();
        new_names.push(final_name.clone());
        list_lock.write(&names::format_names(&new_names))?;
        list_lock.commit(&self.list_file)?;
        fsync_dir(&self.dir)?;

        info!(
            table = %final_name,
            records = summary.record_count,
            "appended table"
        );
        self.reload()
    }

    // --------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{LIST_FILENAME}.lock"))
    }

    pub(crate) fn list_file(&self) -> &Path {
        &self.list_file
    }

    pub(crate) fn block_size(&self) -> usize {
        self.config.block_size
    }
}

// ------------------------------------------------------------------------------------------------
// Temp table files
// ------------------------------------------------------------------------------------------------

/// A `mkstemp`-style temporary table file: `<min>-<max>` plus six random
/// alphanumerics, never referenced from any list. Unlinked on drop unless
/// disarmed after the publishing rename.
pub(crate) struct TempTable {
    path: PathBuf,
    armed: bool,
}

impl TempTable {
    pub(crate) fn create(
        dir: &Path,
        min_update_index: u64,
        max_update_index: u64,
    ) -> Result<(Self, File), StackError> {
        for _ in 0..TEMP_CREATE_TRIES {
            let suffix: String = rand::rng()
                .sample_iter(Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            let path = dir.join(format!(
                "{min_update_index:012x}-{max_update_index:012x}{suffix}"
            ));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((Self { path, armed: true }, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StackError::Io(io::Error::other(
            "failed to create a unique temporary table file",
        )))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Call after the file was renamed into place; the guard then leaves
    /// the (now published) table alone.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempTable {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %e, "failed to remove temporary table file");
        }
    }
}

/// Makes a preceding `rename` in `dir` durable.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
