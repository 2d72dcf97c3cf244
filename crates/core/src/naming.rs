//! Output file naming.
//!
//! Completed outputs are named after the input file's stem, with a marker
//! distinguishing the unrefined from the refined image. When a candidate
//! name already exists on disk, a numeric suffix is appended instead of
//! overwriting.

use std::path::{Path, PathBuf};

/// Build the output file name for an input stem.
///
/// ```
/// use batchfan_core::naming::output_file_name;
///
/// assert_eq!(output_file_name("cat", false), "cat_.png");
/// assert_eq!(output_file_name("cat", true), "cat_refined.png");
/// ```
pub fn output_file_name(stem: &str, refined: bool) -> String {
    if refined {
        format!("{stem}_refined.png")
    } else {
        format!("{stem}_.png")
    }
}

/// Return `candidate` if it does not exist yet, otherwise the first
/// `stem_1.ext`, `stem_2.ext`, ... sibling that does not exist.
pub fn unique_path(candidate: &Path) -> PathBuf {
    if !candidate.exists() {
        return candidate.to_path_buf();
    }

    let parent = candidate.parent().unwrap_or_else(|| Path::new(""));
    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = candidate
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let next = parent.join(format!("{stem}_{counter}{ext}"));
        if !next.exists() {
            return next;
        }
        counter += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
