//! Stat and directory-listing primitives used by reconciliation.
//!
//! Both run synchronously: the window between listing, stat and attaching a
//! watch stays as small as possible, and every caller treats a vanished
//! entry as "not found" rather than as a failure.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

/// Type of a filesystem entry, links followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    File,
    Directory,
    Other,
}

/// Last-known stat of a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) kind: EntryKind,
    /// Device and inode number, where the platform exposes them.
    pub(crate) inode: Option<(u64, u64)>,
    pub(crate) birth: Option<SystemTime>,
}

/// How a fresh stat relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Identity {
    /// Still the same entry.
    Same,
    /// A different entry now lives at the path.
    Replaced,
    /// The entry is gone even though a stat succeeded.
    Vanished,
}

impl Snapshot {
    fn from_metadata(meta: &Metadata) -> Self {
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else if meta.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Self {
            kind,
            inode: inode(meta),
            birth: meta.created().ok().filter(|t| *t != SystemTime::UNIX_EPOCH),
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Compare with a newer stat of the same path.
    ///
    /// A birth time that was known and is now missing counts as a deletion.
    /// Otherwise device+inode decide where available, then birth times.
    pub(crate) fn identity(&self, current: &Snapshot) -> Identity {
        if self.birth.is_some() && current.birth.is_none() {
            return Identity::Vanished;
        }

        if let (Some(before), Some(after)) = (self.inode, current.inode) {
            return if before == after {
                Identity::Same
            } else {
                Identity::Replaced
            };
        }

        match (self.birth, current.birth) {
            (Some(before), Some(after)) if before != after => Identity::Replaced,
            _ => Identity::Same,
        }
    }
}

#[cfg(unix)]
fn inode(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

/// Stat a path, following symlinks.
pub(crate) fn stat(path: &Path) -> io::Result<Snapshot> {
    std::fs::metadata(path).map(|meta| Snapshot::from_metadata(&meta))
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Listed {
    pub(crate) path: PathBuf,
    pub(crate) is_dir: bool,
    pub(crate) is_symlink: bool,
}

/// List the direct children of `dir` without following symlinks, sorted by
/// name. Children that vanish while being read are skipped.
pub(crate) fn list_dir(dir: &Path) -> io::Result<Vec<Listed>> {
    let mut listed = Vec::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // depth 0 is the directory itself: that failure is the listing's
            Err(err) if err.depth() > 0 && is_vanished_walk(&err) => continue,
            Err(err) => return Err(err.into()),
        };

        let file_type = entry.file_type();
        listed.push(Listed {
            path: entry.into_path(),
            is_dir: file_type.is_dir(),
            is_symlink: file_type.is_symlink(),
        });
    }

    Ok(listed)
}

fn is_vanished_walk(err: &walkdir::Error) -> bool {
    err.io_error().is_some_and(is_vanished)
}

/// Whether an error means the path no longer exists.
pub(crate) fn is_vanished(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}
