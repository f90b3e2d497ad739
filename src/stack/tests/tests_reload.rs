//! Reloader tests: diffing against the list file, reader reuse, missing
//! tables.

#[cfg(test)]
mod tests {
    use crate::stack::tests::helpers::{add_ref, assert_list_agreement, open_stack, reopen_stack};
    use crate::stack::{Stack, StackConfig, StackError};
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn reload_is_a_no_op_when_current() {
        let dir = TempDir::new().unwrap();
        let mut stack = open_stack(&dir);
        add_ref(&mut stack, "refs/x", b"v");

        stack.reload().unwrap();
        assert_eq!(stack.len(), 1);
        assert_list_agreement(&stack);
    }

    /// A second handle observes another handle's appends only after its
    /// own reload.
    #[test]
    fn reload_picks_up_external_appends() {
        let dir = TempDir::new().unwrap();
        let mut a = open_stack(&dir);
        let mut b = reopen_stack(dir.path());

        add_ref(&mut a, "refs/x", b"v");

        // Pre-reload, b coherently sees the old (empty) view.
        assert!(b.merged().read_ref(b"refs/x").is_none());

        b.reload().unwrap();
        assert!(b.merged().read_ref(b"refs/x").is_some());
        assert_list_agreement(&b);
    }

    /// # Scenario
    /// A handle holds a three-table view while an external compactor
    /// replaces the middle tables and deletes their files.
    ///
    /// # Actions
    /// 1. Handle `a` loads `[t1, t2, t3]`.
    /// 2. Handle `b` compacts the whole stack (deleting all three files)
    ///    and appends another batch.
    /// 3. `a.reload()`.
    ///
    /// # Expected behavior
    /// `a` converges on `b`'s published view and serves all values.
    #[test]
    fn reload_survives_external_compaction() {
        let dir = TempDir::new().unwrap();
        let mut a = open_stack(&dir);
        let mut b = reopen_stack(dir.path());

        add_ref(&mut b, "refs/one", b"1");
        b.reload().unwrap();
        add_ref(&mut b, "refs/two", b"2");
        b.reload().unwrap();
        add_ref(&mut b, "refs/three", b"3");

        a.reload().unwrap();
        let before = a.len();
        assert!(before >= 1);

        b.compact_all().unwrap();
        add_ref(&mut b, "refs/four", b"4");

        a.reload().unwrap();
        for name in [&b"refs/one"[..], b"refs/two", b"refs/three", b"refs/four"] {
            assert!(a.merged().read_ref(name).is_some(), "missing {name:?}");
        }
        assert_list_agreement(&a);
    }

    /// Readers for still-listed tables are reused, not reopened: a
    /// reload with an unchanged list succeeds even after the table file
    /// was unlinked, because no open is attempted for a claimed reader.
    #[test]
    fn reload_reuses_unchanged_readers() {
        let dir = TempDir::new().unwrap();
        let mut stack = open_stack(&dir);
        add_ref(&mut stack, "refs/x", b"v");

        fs::remove_file(dir.path().join("000000000001-000000000001.ref")).unwrap();

        stack.reload().unwrap();
        assert_eq!(stack.len(), 1);
        assert!(stack.merged().read_ref(b"refs/x").is_some());
    }

    /// A list entry whose table is genuinely gone (no concurrent writer
    /// changing the list) is corruption, not a race: reload fails
    /// without burning the full retry deadline.
    #[test]
    fn missing_table_with_stable_list_fails_fast() {
        let dir = TempDir::new().unwrap();
        {
            let mut stack = open_stack(&dir);
            add_ref(&mut stack, "refs/x", b"v");
        }
        fs::remove_file(dir.path().join("000000000001-000000000001.ref")).unwrap();

        let started = Instant::now();
        let err = Stack::open(dir.path(), StackConfig::default()).unwrap_err();
        assert!(matches!(err, StackError::Table(_)));
        assert!(
            started.elapsed().as_secs() < 3,
            "reload should not wait out the deadline on a stable list"
        );
    }

    /// An empty list file after tables existed retires every reader.
    #[test]
    fn truncated_list_empties_the_view() {
        let dir = TempDir::new().unwrap();
        let mut stack = open_stack(&dir);
        add_ref(&mut stack, "refs/x", b"v");
        assert_eq!(stack.len(), 1);

        fs::write(dir.path().join("refs"), b"").unwrap();
        stack.reload().unwrap();
        assert!(stack.is_empty());
        assert_eq!(stack.next_update_index(), 1);
    }
}
