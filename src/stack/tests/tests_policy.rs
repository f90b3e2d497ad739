//! Compaction-policy bucketing and selection tests.

#[cfg(test)]
mod tests {
    use crate::stack::policy::{Segment, segment_sizes, suggest_compaction_segment};

    #[test]
    fn segments_group_by_log_bucket() {
        // logs: 1 (size 1), 3 (sizes 4..7), 6 (size 32)
        let segments = segment_sizes(&[1, 4, 5, 7, 32]);
        assert_eq!(
            segments,
            vec![
                Segment { start: 0, end: 1, log: 1, bytes: 1 },
                Segment { start: 1, end: 4, log: 3, bytes: 16 },
                Segment { start: 4, end: 5, log: 6, bytes: 32 },
            ]
        );
    }

    #[test]
    fn empty_and_single_table_suggest_nothing() {
        assert_eq!(suggest_compaction_segment(&[]), None);
        assert_eq!(suggest_compaction_segment(&[128]), None);
    }

    #[test]
    fn geometric_stack_suggests_nothing() {
        // Every table in its own bucket — the desired steady state.
        assert_eq!(suggest_compaction_segment(&[64, 16, 4, 1]), None);
    }

    #[test]
    fn uniform_stack_compacts_whole() {
        let seg = suggest_compaction_segment(&[5, 5, 5, 5]).unwrap();
        assert_eq!((seg.start, seg.end), (0, 4));
    }

    #[test]
    fn smallest_bucket_wins() {
        // Two candidate segments: logs 7 (sizes 64,65) and 2 (sizes 2,3).
        let seg = suggest_compaction_segment(&[64, 65, 2, 3]).unwrap();
        assert_eq!((seg.start, seg.end), (2, 4));
        assert_eq!(seg.log, 2);
    }

    #[test]
    fn first_occurrence_breaks_ties() {
        // Both pairs land in the same bucket; the earlier one is chosen,
        // and the left extension does not reach the unrelated large table.
        let seg = suggest_compaction_segment(&[1024, 2, 2, 900, 3, 3]).unwrap();
        assert_eq!((seg.start, seg.end), (1, 3));
    }

    #[test]
    fn chosen_segment_absorbs_dominated_older_tables() {
        // Segment [1, 3) holds 8 bytes; log2(8) = 4 >= log2(8) of the
        // older table, so it is absorbed.
        let seg = suggest_compaction_segment(&[8, 4, 4]).unwrap();
        assert_eq!((seg.start, seg.end), (0, 3));
        assert_eq!(seg.bytes, 16);
    }

    #[test]
    fn absorption_stops_at_dominant_older_tables() {
        // 4 + 4 = 8 bytes; log2(8) = 4 < log2(128) = 8 — not absorbed.
        let seg = suggest_compaction_segment(&[128, 4, 4]).unwrap();
        assert_eq!((seg.start, seg.end), (1, 3));
    }

    #[test]
    fn fresh_small_table_on_top_is_left_alone() {
        // A small newcomer has no same-size peer yet.
        assert_eq!(suggest_compaction_segment(&[512, 64, 3]), None);
    }
}
