//! Single-path native watches.
//!
//! A [`NativeWatcher`] hands out one [`NativeWatch`] per path. Whatever it
//! observes is forwarded as [`Signal`]s over an unbounded channel; the
//! watcher drains that channel and reconciles on its own task, so backend
//! callbacks never touch the watch set.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::config::Backend;
use crate::error::Result;
use crate::event::ChangeKind;

/// Something a native watch observed.
#[derive(Debug)]
pub enum Signal {
    /// Activity on `path`.
    Fired { path: PathBuf, kind: ChangeKind },

    /// The backend reported an error.
    Failed(notify::Error),
}

/// Sending half of the signal channel.
pub type SignalSender = mpsc::UnboundedSender<Signal>;

/// Receiving half of the signal channel.
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

/// Builds the native watcher for one session.
pub type BackendFactory = Box<dyn Fn(SignalSender) -> Result<Box<dyn NativeWatcher>> + Send>;

/// Hands out single-path watches.
pub trait NativeWatcher: Send {
    /// Start watching exactly `path`. Directories report activity on their
    /// direct children.
    fn watch(&self, path: &Path, referenced: bool) -> io::Result<Box<dyn NativeWatch>>;
}

/// An owned watch on one path.
///
/// `close` must be idempotent; implementations also close on drop.
pub trait NativeWatch: Send {
    /// Stop watching. Safe to call more than once.
    fn close(&mut self);

    /// Whether this watch keeps the consumer waiting.
    fn set_referenced(&mut self, referenced: bool);

    /// Current ref state.
    fn is_referenced(&self) -> bool;
}

/// Factory for the `notify` backend selected by `backend`.
pub fn notify_factory(backend: Backend) -> BackendFactory {
    Box::new(move |sender| {
        let watcher = NotifyWatcher::new(&backend, sender)?;
        Ok(Box::new(watcher) as Box<dyn NativeWatcher>)
    })
}

/// [`NativeWatcher`] over one shared `notify` watcher.
///
/// Every path is registered non-recursively on the same underlying watcher,
/// so a large tree costs one inotify instance (or one poll thread), not one
/// per path. A plain file whose parent directory is registered is covered
/// by that directory's registration: the backend already reports activity
/// on direct children, and a second registration would deliver every
/// change to the file twice.
pub struct NotifyWatcher {
    shared: Arc<Mutex<Shared>>,
}

struct Shared {
    watcher: Box<dyn Watcher + Send>,
    registered: HashMap<PathBuf, Registration>,
}

/// How a path is known to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    /// Own registration on a directory; covers its plain-file children.
    Directory,
    /// Own registration on a file, symlink, or other entry.
    Entry,
    /// Reported through the parent directory's registration.
    Covered,
}

impl NotifyWatcher {
    /// Create the backend; events are forwarded to `sender`.
    pub fn new(backend: &Backend, sender: SignalSender) -> Result<Self> {
        let handler = move |res: notify::Result<notify::Event>| forward(&sender, res);

        let watcher: Box<dyn Watcher + Send> = match backend.poll_interval() {
            None => Box::new(RecommendedWatcher::new(handler, notify::Config::default())?),
            Some(interval) => Box::new(PollWatcher::new(
                handler,
                notify::Config::default().with_poll_interval(interval),
            )?),
        };

        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                watcher,
                registered: HashMap::new(),
            })),
        })
    }

    #[cfg(test)]
    fn registration(&self, path: &Path) -> Option<Registration> {
        self.shared.lock().registered.get(path).copied()
    }
}

impl NativeWatcher for NotifyWatcher {
    fn watch(&self, path: &Path, referenced: bool) -> io::Result<Box<dyn NativeWatch>> {
        let file_type = std::fs::symlink_metadata(path)?.file_type();
        let mut shared = self.shared.lock();

        let parent_registered = path
            .parent()
            .and_then(|parent| shared.registered.get(parent))
            .is_some_and(|r| *r == Registration::Directory);

        let registration = if file_type.is_dir() {
            Registration::Directory
        } else if file_type.is_file() && parent_registered {
            Registration::Covered
        } else {
            Registration::Entry
        };

        if registration != Registration::Covered {
            shared
                .watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(into_io)?;
        }
        shared.registered.insert(path.to_path_buf(), registration);

        Ok(Box::new(NotifyWatch {
            path: path.to_path_buf(),
            shared: Arc::clone(&self.shared),
            closed: false,
            referenced,
        }))
    }
}

struct NotifyWatch {
    path: PathBuf,
    shared: Arc<Mutex<Shared>>,
    closed: bool,
    referenced: bool,
}

impl NativeWatch for NotifyWatch {
    fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }

        let mut shared = self.shared.lock();
        match shared.registered.remove(&self.path) {
            Some(Registration::Directory | Registration::Entry) => {
                // The kernel drops watches on deleted inodes by itself.
                if let Err(e) = shared.watcher.unwatch(&self.path) {
                    trace!("Unwatch {} ignored: {e}", self.path.display());
                }
            }
            Some(Registration::Covered) | None => {}
        }
    }

    fn set_referenced(&mut self, referenced: bool) {
        self.referenced = referenced;
    }

    fn is_referenced(&self) -> bool {
        self.referenced && !self.closed
    }
}

impl Drop for NotifyWatch {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward(sender: &SignalSender, res: notify::Result<notify::Event>) {
    match res {
        Ok(event) => {
            let Some(kind) = ChangeKind::from_notify(event.kind) else {
                return;
            };
            for path in event.paths {
                if sender.send(Signal::Fired { path, kind }).is_err() {
                    trace!("Watcher gone, dropping native event");
                    return;
                }
            }
        }
        Err(e) => {
            warn!("Native watch error: {e}");
            let _ = sender.send(Signal::Failed(e));
        }
    }
}

/// Convert a `notify` error into the `io::Error` the watch contract uses.
fn into_io(err: notify::Error) -> io::Error {
    match err.kind {
        notify::ErrorKind::Io(e) => e,
        notify::ErrorKind::PathNotFound => io::Error::from(io::ErrorKind::NotFound),
        notify::ErrorKind::MaxFilesWatch => io::Error::other("too many watched paths"),
        other => io::Error::other(format!("{other:?}")),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_not_found_maps_to_io_not_found() {
        let err = into_io(notify::Error::path_not_found());
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err = into_io(notify::Error::io(io::Error::from(
            io::ErrorKind::PermissionDenied,
        )));
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_forward_skips_access_events() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let access = notify::Event::new(notify::EventKind::Access(
            notify::event::AccessKind::Any,
        ))
        .add_path(PathBuf::from("/tree/a"));
        let create = notify::Event::new(notify::EventKind::Create(
            notify::event::CreateKind::File,
        ))
        .add_path(PathBuf::from("/tree/b"));

        forward(&sender, Ok(access));
        forward(&sender, Ok(create));

        match receiver.try_recv() {
            Ok(Signal::Fired { path, kind }) => {
                assert_eq!(path, PathBuf::from("/tree/b"));
                assert_eq!(kind, ChangeKind::Rename);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_fake_close_is_idempotent() {
        let backend = fake::FakeBackend::default();
        let path = Path::new("/tree/a");

        let mut watch = backend.watch(path, true).unwrap();
        assert_eq!(backend.active(path), 1);

        watch.close();
        watch.close();
        drop(watch);
        assert_eq!(backend.active(path), 0);
        assert_eq!(backend.attaches(path), 1);
    }

    #[test]
    fn test_files_under_a_watched_directory_share_its_registration() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        let lone = tempfile::NamedTempFile::new().unwrap();

        let (sender, _receiver) = mpsc::unbounded_channel();
        let backend = NotifyWatcher::new(&Backend::Native, sender).unwrap();

        let lone_watch = backend.watch(lone.path(), true).unwrap();
        let root_watch = backend.watch(root, true).unwrap();
        let mut file_watch = backend.watch(&root.join("a.txt"), true).unwrap();
        let _sub_watch = backend.watch(&root.join("sub"), true).unwrap();

        assert_eq!(backend.registration(lone.path()), Some(Registration::Entry));
        assert_eq!(backend.registration(root), Some(Registration::Directory));
        assert_eq!(
            backend.registration(&root.join("a.txt")),
            Some(Registration::Covered)
        );
        assert_eq!(
            backend.registration(&root.join("sub")),
            Some(Registration::Directory)
        );

        file_watch.close();
        assert_eq!(backend.registration(&root.join("a.txt")), None);
        assert_eq!(backend.registration(root), Some(Registration::Directory));

        drop(root_watch);
        drop(lone_watch);
        assert_eq!(backend.registration(root), None);
        assert_eq!(backend.registration(lone.path()), None);
    }

    #[test]
    fn test_watch_missing_path_is_not_found() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let (sender, _receiver) = mpsc::unbounded_channel();
        let backend = NotifyWatcher::new(&Backend::Native, sender).unwrap();

        let err = backend.watch(&temp_dir.path().join("gone"), true).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
