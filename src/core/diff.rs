//! Textual diff between the known-good rules and a candidate

use crate::core::error::Result;
use crate::core::store::RulesetLocation;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Unified diff from `old` to `new`, or `None` when they are identical.
///
/// Directories are compared file by file on their relative paths. A side
/// that does not exist reads as empty.
pub fn ruleset_diff(old: &RulesetLocation, new: &RulesetLocation) -> Result<Option<String>> {
    let mut out = String::new();

    if old.path().is_dir() || new.path().is_dir() {
        let mut relative = BTreeSet::new();
        relative.extend(list_files(old.path()));
        relative.extend(list_files(new.path()));
        for rel in relative {
            diff_file(
                &old.path().join(&rel),
                &new.path().join(&rel),
                &rel.to_string_lossy(),
                &mut out,
            )?;
        }
    } else {
        diff_file(old.path(), new.path(), &new.path().to_string_lossy(), &mut out)?;
    }

    Ok((!out.is_empty()).then_some(out))
}

fn list_files(root: &Path) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}

fn read_or_empty(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&fs::read(path)?).into_owned())
}

fn diff_file(old: &Path, new: &Path, label: &str, out: &mut String) -> Result<()> {
    let old_text = read_or_empty(old)?;
    let new_text = read_or_empty(new)?;
    if old_text == new_text {
        return Ok(());
    }

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let _ = write!(
        out,
        "{}",
        diff.unified_diff()
            .context_radius(3)
            .header(&format!("a/{label}"), &format!("b/{label}"))
    );
    Ok(())
}
