//! The set of individually watched paths.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::native::NativeWatch;
use crate::scan::Snapshot;

/// One watched path: last stat, how it was discovered, and its native watch.
pub(crate) struct WatchEntry {
    pub(crate) snapshot: Snapshot,
    /// Discovered as a symbolic link. A stat through the link cannot tell
    /// this afterwards.
    pub(crate) symlink: bool,
    watch: Box<dyn NativeWatch>,
}

impl WatchEntry {
    pub(crate) fn new(snapshot: Snapshot, symlink: bool, watch: Box<dyn NativeWatch>) -> Self {
        Self {
            snapshot,
            symlink,
            watch,
        }
    }
}

/// Watched paths and the native watch each one owns.
///
/// A path maps to exactly one entry, so it can never hold two native
/// watches. Removal closes the watch before dropping it.
#[derive(Default)]
pub(crate) struct WatchSet {
    entries: HashMap<PathBuf, WatchEntry>,
}

impl WatchSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub(crate) fn get(&self, path: &Path) -> Option<&WatchEntry> {
        self.entries.get(path)
    }

    pub(crate) fn get_mut(&mut self, path: &Path) -> Option<&mut WatchEntry> {
        self.entries.get_mut(path)
    }

    /// Add an entry. A path that is already watched keeps its entry and the
    /// incoming watch is closed.
    pub(crate) fn insert(&mut self, path: PathBuf, mut entry: WatchEntry) -> bool {
        match self.entries.entry(path) {
            Entry::Occupied(_) => {
                entry.watch.close();
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove `path` and everything nested under it, closing each watch.
    /// Returns how many entries were removed.
    pub(crate) fn remove_tree(&mut self, path: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|watched, entry| {
            if watched.starts_with(path) {
                entry.watch.close();
                debug!("Stopped watching: {}", watched.display());
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    /// Watched paths whose parent is `dir`.
    pub(crate) fn children_of<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        self.entries
            .keys()
            .filter(move |path| path.parent() == Some(dir))
            .map(PathBuf::as_path)
    }

    /// Close and remove every entry.
    pub(crate) fn drain(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.watch.close();
        }
        count
    }

    pub(crate) fn set_referenced(&mut self, referenced: bool) {
        for entry in self.entries.values_mut() {
            entry.watch.set_referenced(referenced);
        }
    }

    pub(crate) fn any_referenced(&self) -> bool {
        self.entries.values().any(|entry| entry.watch.is_referenced())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeWatcher;
    use crate::native::fake::FakeBackend;
    use crate::scan::EntryKind;
    use pretty_assertions::assert_eq;

    fn entry(backend: &FakeBackend, path: &Path) -> WatchEntry {
        let snapshot = Snapshot {
            kind: EntryKind::File,
            inode: None,
            birth: None,
        };
        WatchEntry::new(snapshot, false, backend.watch(path, true).unwrap())
    }

    #[test]
    fn test_insert_twice_keeps_one_watch() {
        let backend = FakeBackend::default();
        let mut set = WatchSet::new();
        let path = PathBuf::from("/tree/a");

        assert!(set.insert(path.clone(), entry(&backend, &path)));
        assert!(!set.insert(path.clone(), entry(&backend, &path)));

        assert_eq!(set.len(), 1);
        assert_eq!(backend.active(&path), 1);
    }

    #[test]
    fn test_remove_tree_is_component_wise() {
        let backend = FakeBackend::default();
        let mut set = WatchSet::new();
        for path in ["/tree/a", "/tree/a/b", "/tree/a/b/c", "/tree/ab"] {
            let path = PathBuf::from(path);
            set.insert(path.clone(), entry(&backend, &path));
        }

        assert_eq!(set.remove_tree(Path::new("/tree/a")), 3);

        assert_eq!(set.paths().collect::<Vec<_>>(), vec![Path::new("/tree/ab")]);
        assert_eq!(backend.active_paths(), vec![PathBuf::from("/tree/ab")]);
    }

    #[test]
    fn test_children_of_lists_direct_children() {
        let backend = FakeBackend::default();
        let mut set = WatchSet::new();
        for path in ["/tree", "/tree/a", "/tree/a/b", "/tree/c"] {
            let path = PathBuf::from(path);
            set.insert(path.clone(), entry(&backend, &path));
        }

        let mut children: Vec<_> = set.children_of(Path::new("/tree")).collect();
        children.sort();
        assert_eq!(children, vec![Path::new("/tree/a"), Path::new("/tree/c")]);
    }

    #[test]
    fn test_drain_closes_everything() {
        let backend = FakeBackend::default();
        let mut set = WatchSet::new();
        for path in ["/tree", "/tree/a"] {
            let path = PathBuf::from(path);
            set.insert(path.clone(), entry(&backend, &path));
        }

        set.set_referenced(false);
        assert!(!set.any_referenced());
        assert!(!backend.is_referenced(Path::new("/tree/a")));

        assert_eq!(set.drain(), 2);
        assert_eq!(set.len(), 0);
        assert!(backend.active_paths().is_empty());
    }
}
