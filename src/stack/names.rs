//! List-file codec and table filename grammar.
//!
//! The list file is the single persistent pointer to stack membership: a
//! newline-terminated sequence of table basenames, oldest first. A missing
//! or empty file denotes an empty stack. Names are opaque here — UTF-8 is
//! not policed — but every name the stack itself produces follows the
//! `NNNNNNNNNNNN-MMMMMMMMMMMM.ref` grammar, where both halves are
//! 12-hex-digit zero-padded update-index bounds.

use std::fs;
use std::io;
use std::path::Path;

/// Suffix of published table files.
pub const TABLE_SUFFIX: &str = ".ref";

/// Splits a list-file buffer into table names, dropping empty entries
/// (the required trailing newline produces one).
pub fn parse_names(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

/// Emits the inverse of [`parse_names`]: every name followed by `\n`.
pub fn format_names(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Reads and parses a list file. A missing file is an empty stack, not an
/// error.
pub fn read_list_file(path: &Path) -> io::Result<Vec<String>> {
    match fs::read(path) {
        Ok(buf) => Ok(parse_names(&buf)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Formats the published filename for a table covering
/// `[min_update_index, max_update_index]`.
pub fn format_table_name(min_update_index: u64, max_update_index: u64) -> String {
    format!("{min_update_index:012x}-{max_update_index:012x}{TABLE_SUFFIX}")
}

/// Parses a published table filename back into its
/// `(min_update_index, max_update_index)` bounds. Returns `None` for
/// anything outside the exact `[0-9a-f]{12}-[0-9a-f]{12}.ref` grammar.
pub fn parse_table_name(name: &str) -> Option<(u64, u64)> {
    let body = name.strip_suffix(TABLE_SUFFIX)?;
    let (min_hex, max_hex) = body.split_once('-')?;
    if min_hex.len() != 12 || max_hex.len() != 12 {
        return None;
    }
    let lowercase_hex =
        |s: &str| s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !lowercase_hex(min_hex) || !lowercase_hex(max_hex) {
        return None;
    }
    let min = u64::from_str_radix(min_hex, 16).ok()?;
    let max = u64::from_str_radix(max_hex, 16).ok()?;
    Some((min, max))
}
