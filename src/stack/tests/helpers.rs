use std::path::Path;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::stack::{Stack, StackConfig};
use crate::table::RefRecord;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opens a stack with the default 4 KiB block size.
pub fn open_stack(dir: &TempDir) -> Stack {
    init_tracing();
    Stack::open(dir.path(), StackConfig::default()).expect("stack open failed")
}

/// Opens a second handle over an existing stack directory.
pub fn reopen_stack(path: &Path) -> Stack {
    Stack::open(path, StackConfig::default()).expect("stack reopen failed")
}

/// Appends one batch setting `name = value` at the stack's next update
/// index.
pub fn add_ref(stack: &mut Stack, name: &str, value: &[u8]) {
    let next = stack.next_update_index();
    let rec = RefRecord::new(name, next, value.to_vec());
    stack
        .add(move |w| {
            w.set_limits(next, next)?;
            w.add_ref(&rec)
        })
        .expect("add failed");
}

/// Appends one batch deleting `name` at the stack's next update index.
pub fn delete_ref(stack: &mut Stack, name: &str) {
    let next = stack.next_update_index();
    let rec = RefRecord::tombstone(name, next);
    stack
        .add(move |w| {
            w.set_limits(next, next)?;
            w.add_ref(&rec)
        })
        .expect("delete failed");
}

/// Names currently recorded in the list file.
pub fn list_names(stack: &Stack) -> Vec<String> {
    crate::stack::names::read_list_file(&stack.dir().join(crate::stack::LIST_FILENAME))
        .expect("list read failed")
}

/// Asserts the invariant that the loaded readers agree with the list
/// file, element by element.
pub fn assert_list_agreement(stack: &Stack) {
    let listed = list_names(stack);
    let loaded: Vec<String> = stack
        .merged()
        .readers()
        .iter()
        .map(|r| r.name().to_owned())
        .collect();
    assert_eq!(listed, loaded, "list file and loaded readers disagree");
}
