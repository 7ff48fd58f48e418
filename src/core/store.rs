//! Ruleset artifacts on disk
//!
//! A ruleset location is either a single file or a directory holding a
//! `pf.conf` (plus whatever anchors it includes). The store promotes a
//! candidate over the known-good location, keeping exactly one `.bak`
//! generation of what it replaced.
//!
//! Every write goes through a staging path in the destination's parent
//! directory and is swapped into place with `rename`, so a failed copy
//! never leaves a half-written ruleset behind.

use crate::core::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File looked up inside a directory location
pub const DIRECTORY_ENTRY: &str = "pf.conf";

const BACKUP_SUFFIX: &str = ".bak";
const STAGING_PREFIX: &str = ".pfguard-stage-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LocationKind {
    File,
    Directory,
    Missing,
}

/// A path naming a ruleset file or a directory containing one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RulesetLocation(PathBuf);

impl RulesetLocation {
    /// Stores `path` without trailing separators or `.` components, so
    /// `/etc/pf/` and `/etc/pf` name the same location.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into().components().collect())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn kind(&self) -> LocationKind {
        match fs::metadata(&self.0) {
            Ok(meta) if meta.is_dir() => LocationKind::Directory,
            Ok(_) => LocationKind::File,
            Err(_) => LocationKind::Missing,
        }
    }

    pub fn exists(&self) -> bool {
        self.kind() != LocationKind::Missing
    }

    /// Resolves the effective ruleset file: `<dir>/pf.conf` for directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] with the effective path if it is not a file.
    pub fn resolve(&self) -> Result<PathBuf> {
        let effective = if self.0.is_dir() {
            self.0.join(DIRECTORY_ENTRY)
        } else {
            self.0.clone()
        };

        if effective.is_file() {
            Ok(effective)
        } else {
            Err(Error::NotFound(effective))
        }
    }

    /// `<location>.bak`
    pub fn backup_path(&self) -> PathBuf {
        let mut name = OsString::from(self.0.as_os_str());
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }
}

impl std::fmt::Display for RulesetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for RulesetLocation {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for RulesetLocation {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

/// What a successful promotion did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    /// Where the previous known-good rules were archived, if there were any
    pub backup: Option<PathBuf>,
    /// Number of files now under the destination
    pub files: usize,
    /// Number of files whose candidate path references were rewritten
    pub rewritten: usize,
}

/// Manipulates ruleset artifacts
pub trait RuleStore: Send + Sync {
    /// Replaces `<good>.bak` with a copy of `good`. No-op when `good` is missing.
    fn backup(&self, good: &RulesetLocation) -> Result<Option<PathBuf>>;

    /// Backs up `destination`, then replaces it with a copy of `candidate`
    /// whose references to the candidate path point at the destination.
    fn promote(
        &self,
        candidate: &RulesetLocation,
        destination: &RulesetLocation,
    ) -> Result<Promotion>;

    /// Rewrites `candidate_path` to `destination_path` in every file under
    /// `destination`. Returns the number of files changed.
    fn rewrite_references(
        &self,
        destination: &RulesetLocation,
        candidate_path: &str,
        destination_path: &str,
    ) -> Result<usize>;
}

/// [`RuleStore`] on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRuleStore;

impl FsRuleStore {
    pub fn new() -> Self {
        Self
    }
}

impl RuleStore for FsRuleStore {
    fn backup(&self, good: &RulesetLocation) -> Result<Option<PathBuf>> {
        if !good.exists() {
            debug!("Nothing to back up at {good}");
            return Ok(None);
        }

        let backup = good.backup_path();
        let stage = staging_dir(&backup)?;
        let staged = stage.path().join("payload");
        copy_tree(good.path(), &staged)?;

        remove_any(&backup)?;
        fs::rename(&staged, &backup).map_err(|e| copy_error(&backup, e))?;

        info!("Backed up {good} to {}", backup.display());
        Ok(Some(backup))
    }

    fn promote(
        &self,
        candidate: &RulesetLocation,
        destination: &RulesetLocation,
    ) -> Result<Promotion> {
        let candidate_kind = candidate.kind();
        let destination_kind = destination.kind();

        if candidate_kind == LocationKind::Missing {
            return Err(Error::NotFound(candidate.path().to_path_buf()));
        }
        if destination_kind != LocationKind::Missing && destination_kind != candidate_kind {
            return Err(Error::Precondition(format!(
                "cannot promote {candidate_kind} {candidate} over {destination_kind} {destination}"
            )));
        }

        let stage = staging_dir(destination.path())?;
        let staged = RulesetLocation::new(stage.path().join("payload"));
        copy_tree(candidate.path(), staged.path())?;

        let expected = fingerprint(candidate.path())?;
        let actual = fingerprint(staged.path())?;
        if expected != actual {
            return Err(Error::Copy {
                path: candidate.path().to_path_buf(),
                source: std::io::Error::other(format!(
                    "staged copy checksum mismatch: expected {expected}, got {actual}"
                )),
            });
        }

        let rewritten = self.rewrite_references(
            &staged,
            &candidate.path().to_string_lossy(),
            &destination.path().to_string_lossy(),
        )?;
        let files = count_files(staged.path());

        let backup = self.backup(destination)?;
        swap_into_place(staged.path(), destination.path(), stage.path())?;

        info!(
            "Promoted {candidate} to {destination} ({files} file(s), {rewritten} rewritten)"
        );
        Ok(Promotion {
            backup,
            files,
            rewritten,
        })
    }

    fn rewrite_references(
        &self,
        destination: &RulesetLocation,
        candidate_path: &str,
        destination_path: &str,
    ) -> Result<usize> {
        if candidate_path.is_empty() || candidate_path == destination_path {
            return Ok(0);
        }

        let mut changed = 0;
        for entry in WalkDir::new(destination.path()) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let bytes = fs::read(path)?;
            let Ok(text) = std::str::from_utf8(&bytes) else {
                debug!("Skipping non-text file {}", path.display());
                continue;
            };

            if let Cow::Owned(updated) =
                replace_path_references(text, candidate_path, destination_path)
            {
                write_in_place(path, updated.as_bytes())?;
                debug!("Rewrote references in {}", path.display());
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Substitutes `from` with `to` so that running it twice changes nothing.
///
/// At each position the longer of the two patterns is tried first, which
/// keeps an existing `to` intact when `from` is its prefix (`/etc/pf` ->
/// `/etc/pf.d`) and still rewrites `from` when `to` is its prefix
/// (`/etc/pf.conf.new` -> `/etc/pf.conf`).
pub fn replace_path_references<'a>(text: &'a str, from: &str, to: &str) -> Cow<'a, str> {
    if from.is_empty() || to.is_empty() || from == to || !text.contains(from) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut replaced = false;
    while !rest.is_empty() {
        let keep_first = to.len() > from.len();
        if keep_first && rest.starts_with(to) {
            out.push_str(to);
            rest = &rest[to.len()..];
        } else if rest.starts_with(from) {
            out.push_str(to);
            rest = &rest[from.len()..];
            replaced = true;
        } else {
            let Some(ch) = rest.chars().next() else { break };
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }

    if replaced {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(text)
    }
}

/// SHA-256 over a file's contents, or over every file (relative path and
/// contents, in path order) under a directory.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    if path.is_dir() {
        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .min_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect();
        files.sort();
        for file in files {
            let relative = file.strip_prefix(path).unwrap_or(&file);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(fs::read(&file)?);
            hasher.update([0]);
        }
    } else {
        hasher.update(fs::read(path)?);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn copy_error(path: &Path, source: std::io::Error) -> Error {
    Error::Copy {
        path: path.to_path_buf(),
        source,
    }
}

/// Temporary directory next to `target`, so renames stay on one filesystem.
fn staging_dir(target: &Path) -> Result<tempfile::TempDir> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent)
        .map_err(|e| copy_error(target, e))
}

/// Recursive copy of a file or directory; symlinks are recreated, not followed.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        fs::copy(src, dst).map_err(|e| copy_error(src, e))?;
        return Ok(());
    }

    fs::create_dir_all(dst).map_err(|e| copy_error(dst, e))?;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| copy_error(src, e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| copy_error(&target, e))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| copy_error(entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &target).map_err(|e| copy_error(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| copy_error(entry.path(), e))?;
        }
    }
    Ok(())
}

fn count_files(path: &Path) -> usize {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Moves `staged` to `destination`.
///
/// Files are replaced by a single atomic rename. A directory cannot be
/// renamed over a non-empty one, so the old tree is first parked inside
/// `stage` and moved back if the second rename fails.
fn swap_into_place(staged: &Path, destination: &Path, stage: &Path) -> Result<()> {
    if !destination.is_dir() {
        return fs::rename(staged, destination).map_err(|e| copy_error(destination, e));
    }

    let parked = stage.join("previous");
    fs::rename(destination, &parked).map_err(|e| copy_error(destination, e))?;
    if let Err(e) = fs::rename(staged, destination) {
        warn!(
            "Swapping in {} failed, restoring previous rules: {e}",
            destination.display()
        );
        fs::rename(&parked, destination)?;
        return Err(copy_error(destination, e));
    }
    Ok(())
}

/// Rewrites a file through a sibling temp file, keeping its permissions.
fn write_in_place(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or(Path::new("."));
    let permissions = fs::metadata(path)?.permissions();
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), permissions)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
