//! # Tree Watcher
//!
//! Recursive file system watching built from single-path native watches.
//!
//! Every file and directory under the root gets its own non-recursive
//! watch. Whenever one fires, the affected path is stat'ed and listed again
//! so the set of watches follows the tree as entries are created, deleted,
//! replaced, or turned from files into directories and back.
//!
//! ## Events
//!
//! - `rename`: an entry appeared, disappeared, or was replaced
//! - `change`: an entry was modified in place
//!
//! Filenames are relative to the root. Watching a single file reports its
//! own name.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RecursiveWatcher                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  NativeWatcher ──► Signal ──► reconcile ──► EventQueue       │
//! │       │                          │              │            │
//! │       ▼                          ▼              ▼            │
//! │  NativeWatch (per path)   WatchSet + scan    WatchStream     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> codex_tree_watcher::Result<()> {
//! use codex_tree_watcher::{WatchOptions, watch};
//!
//! let mut stream = watch("/tmp/project", WatchOptions::default())?;
//! while let Some(change) = stream.next().await {
//!     let change = change?;
//!     println!("{} {}", change.kind, change.filename);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod native;
mod scan;
pub mod stream;
mod watch_set;
pub mod watcher;

pub use config::{
    Backend, DEFAULT_DEBOUNCE_MS, DEFAULT_MAX_QUEUE, FilenameEncoding, OverflowPolicy, WatchOptions,
};
pub use error::{Result, WatcherError};
pub use event::{ChangeEvent, ChangeKind, Filename, WatchEvent};
pub use native::{BackendFactory, NativeWatch, NativeWatcher, NotifyWatcher, Signal};
pub use stream::{WatchStream, watch};
pub use watcher::RecursiveWatcher;
