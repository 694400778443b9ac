//! Recursive tree watcher implementation.
//!
//! One native watch is held per file and directory under the root. Signals
//! from those watches are reconciled one at a time on the consumer's task:
//! the changed path is stat'ed again, the watch set is updated, and a
//! `rename` or `change` is queued with the path relative to the root.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use path_absolutize::Absolutize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{FilenameEncoding, IgnoreSet, WatchOptions};
use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, ChangeKind, EventQueue, Filename, WatchEvent};
use crate::native::{BackendFactory, NativeWatcher, Signal, SignalReceiver, notify_factory};
use crate::scan::{self, Identity, Listed, Snapshot};
use crate::watch_set::{WatchEntry, WatchSet};

/// Watches a file, or a directory and everything beneath it.
pub struct RecursiveWatcher {
    options: WatchOptions,
    factory: BackendFactory,
    session: Option<Session>,
    queue: EventQueue,
    closed: bool,
}

impl RecursiveWatcher {
    /// Create a watcher using the `notify` backend from `options`.
    pub fn new(options: WatchOptions) -> Self {
        let factory = notify_factory(options.backend.clone());
        Self::with_backend(options, factory)
    }

    /// Create a watcher with a custom native backend.
    pub fn with_backend(options: WatchOptions, factory: BackendFactory) -> Self {
        let queue = EventQueue::new(options.max_queue, options.overflow);
        Self {
            options,
            factory,
            session: None,
            queue,
            closed: false,
        }
    }

    /// Start watching `path`.
    ///
    /// Fails if the path cannot be stat'ed or its own watch cannot be
    /// attached. Problems further down the tree are reported as
    /// [`WatchEvent::Error`] instead. A watcher must be closed before it can
    /// be started again.
    pub fn start(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(session) = &self.session {
            return Err(WatcherError::AlreadyWatching(session.root.clone()));
        }

        let path = path.as_ref();
        let root = path
            .absolutize()
            .map_err(|source| WatcherError::Stat {
                path: path.to_path_buf(),
                source,
            })?
            .into_owned();
        let snapshot = scan::stat(&root).map_err(|source| WatcherError::Stat {
            path: root.clone(),
            source,
        })?;

        let (sender, signals) = mpsc::unbounded_channel();
        let backend = (self.factory)(sender)?;

        let mut session = Session {
            root: root.clone(),
            single_file: !snapshot.is_dir(),
            recursive: self.options.recursive,
            encoding: self.options.encoding,
            ignore: IgnoreSet::new(&self.options.ignore),
            referenced: self.options.persistent,
            backend,
            signals,
            pending: Vec::new(),
            fresh: HashSet::new(),
            set: WatchSet::new(),
        };

        session
            .attach(&root, false)
            .map_err(|source| WatcherError::Watch {
                path: root.clone(),
                source,
            })?;

        // a close left unread by the previous session must not end this one
        self.queue.clear();
        self.closed = false;
        if session.recursive && !session.single_file {
            // the baseline is reported in full; `max_queue` bounds live changes
            self.queue.unbounded(|queue| session.watch_folder(&root, queue));
        }
        session.fresh.clear();

        info!(
            "Started watching {} ({} paths)",
            root.display(),
            session.set.len()
        );
        self.session = Some(session);
        Ok(())
    }

    /// Stop watching: close every native watch and queue one
    /// [`WatchEvent::Close`]. Does nothing if already closed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut session) = self.session.take() {
            let count = session.set.drain();
            info!(
                "Stopped watching {} ({count} watches closed)",
                session.root.display()
            );
        }
        self.queue.push_close();
    }

    /// Let held watches keep [`next`](Self::next) waiting.
    pub fn reference(&mut self) {
        self.set_referenced(true);
    }

    /// Stop held watches from keeping [`next`](Self::next) waiting.
    pub fn unreference(&mut self) {
        self.set_referenced(false);
    }

    fn set_referenced(&mut self, referenced: bool) {
        if let Some(session) = &mut self.session {
            session.referenced = referenced;
            session.set.set_referenced(referenced);
        }
    }

    /// Whether any held watch keeps the consumer waiting.
    pub fn is_referenced(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.set.any_referenced())
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the close event has been read, before `start`,
    /// or when the watcher is unreferenced and nothing is pending. Dropping
    /// the future loses nothing.
    ///
    /// After the first signal arrives, waits for
    /// [`debounce_ms`](WatchOptions::debounce_ms) so that everything one
    /// filesystem operation caused is reconciled as a single batch.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            if let Some(event) = self.try_next() {
                return Some(event);
            }
            if !self.is_referenced() {
                return None;
            }

            let session = self.session.as_mut()?;
            let signal = session.signals.recv().await?;
            session.pending.push(signal);

            if let Some(window) = self.options.debounce() {
                tokio::time::sleep(window).await;
            }
        }
    }

    /// Reconcile whatever the native watches delivered so far and return the
    /// next event, without waiting.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.pump();

        if let Some(max_queue) = self.queue.take_overflow() {
            self.close();
            return Some(WatchEvent::Error(WatcherError::QueueOverflow(max_queue)));
        }
        self.queue.pop()
    }

    fn pump(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut batch = std::mem::take(&mut session.pending);
        while let Ok(signal) = session.signals.try_recv() {
            batch.push(signal);
        }
        if batch.is_empty() {
            return;
        }

        if session.process(batch, &mut self.queue) {
            info!("Watch root {} is gone", session.root.display());
            self.close();
        }
    }

    /// The absolute root of the running session.
    pub fn root(&self) -> Option<&Path> {
        self.session.as_ref().map(|session| session.root.as_path())
    }

    /// Whether `close` has run (or the root was deleted).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of individually watched paths.
    pub fn watch_count(&self) -> usize {
        self.session.as_ref().map_or(0, |session| session.set.len())
    }

    /// Whether `path` (absolute) holds a watch.
    pub fn is_watching(&self, path: &Path) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.set.contains(path))
    }

    /// Every watched path, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .session
            .iter()
            .flat_map(|session| session.set.paths().map(Path::to_path_buf))
            .collect();
        paths.sort();
        paths
    }

    /// The options this watcher was created with.
    pub fn options(&self) -> &WatchOptions {
        &self.options
    }
}

impl Drop for RecursiveWatcher {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.set.drain();
        }
    }
}

/// State of one `start` .. `close` cycle.
struct Session {
    root: PathBuf,
    single_file: bool,
    recursive: bool,
    encoding: FilenameEncoding,
    ignore: IgnoreSet,
    /// Ref state given to newly attached watches.
    referenced: bool,
    backend: Box<dyn NativeWatcher>,
    signals: SignalReceiver,
    /// Received but not yet reconciled.
    pending: Vec<Signal>,
    /// Paths attached while handling the current batch.
    fresh: HashSet<PathBuf>,
    set: WatchSet,
}

impl Session {
    /// Handle a batch of signals. Returns true when the root is gone.
    fn process(&mut self, batch: Vec<Signal>, queue: &mut EventQueue) -> bool {
        self.fresh.clear();

        // one reconciliation per path; a rename outranks a change
        let mut fired: IndexMap<PathBuf, ChangeKind> = IndexMap::new();
        for signal in batch {
            match signal {
                Signal::Fired { path, kind } => {
                    let slot = fired.entry(path).or_insert(kind);
                    if kind == ChangeKind::Rename {
                        *slot = ChangeKind::Rename;
                    }
                }
                Signal::Failed(err) => queue.push_error(WatcherError::Notify(err)),
            }
        }

        for (path, kind) in fired {
            let root_gone = if self.recursive {
                self.dispatch(&path, kind, queue)
            } else {
                self.passthrough(&path, kind, queue)
            };
            if root_gone {
                return true;
            }
        }
        false
    }

    /// Route a signal to the watched path it names, and for structural
    /// changes also to its watched parent directory.
    fn dispatch(&mut self, path: &Path, kind: ChangeKind, queue: &mut EventQueue) -> bool {
        // already reported by a walk earlier in this batch
        if self.fresh.contains(path) {
            return false;
        }
        if self.set.contains(path) && self.reconcile(path, queue) {
            return true;
        }

        if kind == ChangeKind::Rename
            && let Some(parent) = path.parent()
            && self.set.contains(parent)
        {
            return self.reconcile(parent, queue);
        }
        false
    }

    /// Re-stat a watched path and bring the watch set up to date.
    fn reconcile(&mut self, path: &Path, queue: &mut EventQueue) -> bool {
        let Some(entry) = self.set.get(path) else {
            return false;
        };
        let (previous, symlink) = (entry.snapshot, entry.symlink);

        let Ok(current) = scan::stat(path) else {
            return self.vanished(path, queue);
        };

        match previous.identity(&current) {
            Identity::Vanished => self.vanished(path, queue),
            Identity::Replaced => self.replace(path, current, symlink, queue),
            Identity::Same => {
                if let Some(entry) = self.set.get_mut(path) {
                    entry.snapshot = current;
                }

                if path == self.root && self.single_file {
                    self.emit(ChangeKind::Change, path, queue);
                } else if symlink {
                    // a stat through the link cannot tell a retarget from an edit
                    self.emit(ChangeKind::Rename, path, queue);
                } else if current.is_dir() {
                    self.watch_folder(path, queue);
                } else {
                    self.emit(ChangeKind::Change, path, queue);
                }
                false
            }
        }
    }

    /// `path` is gone. When its watched parent directories are gone too,
    /// the topmost of them is removed instead, so a deleted subtree reports
    /// one `rename` whichever of its signals is reconciled first.
    fn vanished(&mut self, path: &Path, queue: &mut EventQueue) -> bool {
        let mut top = path;
        while top != self.root
            && let Some(parent) = top.parent()
            && self.set.contains(parent)
            && scan::stat(parent).is_err()
        {
            top = parent;
        }
        self.remove(top, queue)
    }

    /// Drop `path` and everything under it; report one `rename`.
    fn remove(&mut self, path: &Path, queue: &mut EventQueue) -> bool {
        let removed = self.set.remove_tree(path);
        debug!("Removed {} ({removed} watches)", path.display());
        self.emit(ChangeKind::Rename, path, queue);
        path == self.root
    }

    /// A different entry now lives at `path`: watch it afresh.
    fn replace(
        &mut self,
        path: &Path,
        current: Snapshot,
        symlink: bool,
        queue: &mut EventQueue,
    ) -> bool {
        if !self.reattach(path, symlink, queue) {
            return self.remove(path, queue);
        }

        let kind = if path == self.root && self.single_file {
            ChangeKind::Change
        } else {
            ChangeKind::Rename
        };
        self.emit(kind, path, queue);

        if current.is_dir() && !symlink {
            self.watch_folder(path, queue);
        }
        false
    }

    /// Swap the watches under `path` for a fresh one on `path`. Returns
    /// false if the path could not be watched again.
    fn reattach(&mut self, path: &Path, symlink: bool, queue: &mut EventQueue) -> bool {
        self.set.remove_tree(path);
        match self.attach(path, symlink) {
            Ok(()) => true,
            Err(e) if scan::is_vanished(&e) => false,
            Err(source) => {
                queue.push_error(WatcherError::Watch {
                    path: path.to_path_buf(),
                    source,
                });
                false
            }
        }
    }

    /// Non-recursive mode: report what the single native watch saw on the
    /// root or its direct children.
    fn passthrough(&mut self, path: &Path, kind: ChangeKind, queue: &mut EventQueue) -> bool {
        let is_root = path == self.root;
        if !is_root && (path.parent() != Some(self.root.as_path()) || self.is_ignored(path)) {
            return false;
        }

        if is_root {
            let Ok(current) = scan::stat(path) else {
                return self.remove(path, queue);
            };
            let identity = self
                .set
                .get(path)
                .map_or(Identity::Same, |entry| entry.snapshot.identity(&current));
            match identity {
                Identity::Vanished => return self.remove(path, queue),
                Identity::Replaced => {
                    if !self.reattach(path, false, queue) {
                        return self.remove(path, queue);
                    }
                }
                Identity::Same => {
                    if let Some(entry) = self.set.get_mut(path) {
                        entry.snapshot = current;
                    }
                }
            }
        }

        self.emit(kind, path, queue);
        false
    }

    /// Walk `folder`, reporting and watching every entry not yet watched.
    fn watch_folder(&mut self, folder: &Path, queue: &mut EventQueue) {
        let mut pending = vec![folder.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let listing = match scan::list_dir(&dir) {
                Ok(listing) => listing,
                Err(source) => {
                    if let Some(err) = listing_failed(dir, source) {
                        queue.push_error(err);
                    }
                    continue;
                }
            };

            self.prune(&dir, &listing, queue);

            for entry in listing {
                if self.set.contains(&entry.path) || self.is_ignored(&entry.path) {
                    continue;
                }

                // first sight counts as a creation
                self.emit(ChangeKind::Rename, &entry.path, queue);

                match self.attach(&entry.path, entry.is_symlink) {
                    Ok(()) if entry.is_dir && !entry.is_symlink => pending.push(entry.path),
                    Ok(()) => {}
                    Err(e) if scan::is_vanished(&e) => {
                        debug!("{} vanished before it could be watched", entry.path.display());
                    }
                    Err(source) => queue.push_error(WatcherError::Watch {
                        path: entry.path,
                        source,
                    }),
                }
            }
        }
    }

    /// Children still watched under `dir` but missing from its listing.
    fn prune(&mut self, dir: &Path, listing: &[Listed], queue: &mut EventQueue) {
        let present: HashSet<&Path> = listing.iter().map(|l| l.path.as_path()).collect();
        let mut stale: Vec<PathBuf> = self
            .set
            .children_of(dir)
            .filter(|path| !present.contains(path))
            .map(Path::to_path_buf)
            .collect();
        stale.sort();

        for path in stale {
            self.remove(&path, queue);
        }
    }

    /// Attach a native watch to `path` unless it already has one.
    fn attach(&mut self, path: &Path, symlink: bool) -> io::Result<()> {
        if self.set.contains(path) {
            return Ok(());
        }

        let snapshot = scan::stat(path)?;
        let watch = self.backend.watch(path, self.referenced)?;
        self.set
            .insert(path.to_path_buf(), WatchEntry::new(snapshot, symlink, watch));
        self.fresh.insert(path.to_path_buf());
        debug!("Watching: {}", path.display());
        Ok(())
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.matches(&self.relative(path))
    }

    /// `path` relative to the root; the root itself reports its file name.
    fn relative(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => self
                .root
                .file_name()
                .map_or_else(|| path.to_path_buf(), PathBuf::from),
        }
    }

    fn emit(&self, kind: ChangeKind, path: &Path, queue: &mut EventQueue) {
        let filename = Filename::encode(&self.relative(path), self.encoding);
        queue.push_change(ChangeEvent::new(kind, filename));
    }
}

/// The error to report for a directory that could not be listed, if any.
/// A directory deleted in the meantime is left to its own signal.
fn listing_failed(dir: PathBuf, source: io::Error) -> Option<WatcherError> {
    if scan::is_vanished(&source) {
        debug!("{} vanished before it could be listed", dir.display());
        return None;
    }
    Some(WatcherError::ReadDir { path: dir, source })
}
