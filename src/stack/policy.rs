//! Compaction policy — logarithmic size bucketing.
//!
//! Given the per-table sizes of the stack (oldest first, with the fixed
//! per-table overhead already deducted by the caller), the policy chooses
//! a contiguous range whose compaction keeps the stack geometrically
//! balanced: every table roughly twice the size of the one above it.
//!
//! Tables are partitioned into maximal runs ("segments") sharing a log₂
//! size bucket. The smallest-bucket segment of at least two tables is
//! selected and then extended toward the bottom of the stack as long as
//! the combined bytes dominate the next older table. A freshly appended
//! small table therefore triggers nothing until peers of its size
//! accumulate, while repeated merges eventually fold into the larger,
//! older tables.

/// A compaction candidate: a contiguous `[start, end)` range of tables
/// sharing a size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First table index (inclusive).
    pub start: usize,

    /// One past the last table index (exclusive).
    pub end: usize,

    /// Common `log2` bucket of the segment's tables.
    pub log: u32,

    /// Total adjusted bytes across the segment.
    pub bytes: u64,
}

impl Segment {
    /// Number of tables in the segment.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` for a degenerate empty range.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// `floor(log₂ x) + 1` for `x >= 1`. Zero sizes are forbidden — the
/// caller floors adjusted sizes at one byte.
pub(crate) fn log2(x: u64) -> u32 {
    assert!(x > 0, "log2 of zero table size");
    64 - x.leading_zeros()
}

/// Partitions `sizes` into maximal runs sharing a `log2` bucket.
pub(crate) fn segment_sizes(sizes: &[u64]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current: Option<Segment> = None;

    for (i, &size) in sizes.iter().enumerate() {
        let log = log2(size);
        match current.as_mut() {
            Some(seg) if seg.log == log => {
                seg.end = i + 1;
                seg.bytes += size;
            }
            _ => {
                if let Some(seg) = current.take() {
                    segments.push(seg);
                }
                current = Some(Segment {
                    start: i,
                    end: i + 1,
                    log,
                    bytes: size,
                });
            }
        }
    }
    if let Some(seg) = current {
        segments.push(seg);
    }
    segments
}

/// Chooses the compaction range for the given adjusted table sizes
/// (oldest first), or `None` when no two adjacent tables share a bucket.
pub fn suggest_compaction_segment(sizes: &[u64]) -> Option<Segment> {
    let mut chosen = segment_sizes(sizes)
        .into_iter()
        .filter(|seg| seg.len() >= 2)
        .min_by_key(|seg| seg.log)?;

    // Absorb older tables while the accumulated bytes dominate them.
    while chosen.start > 0 && log2(chosen.bytes) >= log2(sizes[chosen.start - 1]) {
        chosen.start -= 1;
        chosen.bytes += sizes[chosen.start];
    }

    Some(chosen)
}
