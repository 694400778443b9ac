//! Events reported by the tree watcher.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;

use notify::event::{EventKind, ModifyKind};
use serde::Serialize;
use tracing::warn;

use crate::config::{FilenameEncoding, OverflowPolicy};
use crate::error::WatcherError;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// An entry appeared, disappeared, or changed identity.
    Rename,

    /// Contents or metadata changed in place.
    Change,
}

impl ChangeKind {
    /// The event type name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rename => "rename",
            Self::Change => "change",
        }
    }

    /// Classify a native event. Access events are not reported.
    pub(crate) fn from_notify(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Access(_) => None,
            EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Any
            | EventKind::Other => Some(Self::Rename),
            EventKind::Modify(_) => Some(Self::Change),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reported filename, relative to the watch root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Filename {
    /// UTF-8 text.
    Text(String),

    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Filename {
    /// Encode a relative path.
    pub fn encode(relative: &Path, encoding: FilenameEncoding) -> Self {
        match encoding {
            FilenameEncoding::Utf8 => Self::Text(relative.to_string_lossy().into_owned()),
            FilenameEncoding::Buffer => Self::Bytes(path_bytes(relative)),
        }
    }

    /// The text form, if this filename is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(_) => None,
        }
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// A change to one entry of the watched tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    /// What happened.
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,

    /// Path relative to the watch root.
    pub filename: Filename,
}

impl ChangeEvent {
    /// Create a new change event.
    pub fn new(kind: ChangeKind, filename: Filename) -> Self {
        Self { kind, filename }
    }
}

/// Everything a watcher reports.
#[derive(Debug)]
pub enum WatchEvent {
    /// A `rename` or `change` in the tree.
    Change(ChangeEvent),

    /// Listing or watching some path failed.
    Error(WatcherError),

    /// The watcher was closed; nothing follows.
    Close,
}

impl WatchEvent {
    /// The change, if this is a change event.
    pub fn as_change(&self) -> Option<&ChangeEvent> {
        match self {
            Self::Change(change) => Some(change),
            _ => None,
        }
    }
}

/// Bounded queue of events waiting to be read.
///
/// Only change events count against the bound; errors and the close event
/// are always kept.
#[derive(Debug)]
pub(crate) struct EventQueue {
    events: VecDeque<WatchEvent>,
    pending_changes: usize,
    max_queue: usize,
    overflow: OverflowPolicy,
    overflowed: bool,
    bounded: bool,
}

impl EventQueue {
    pub(crate) fn new(max_queue: usize, overflow: OverflowPolicy) -> Self {
        Self {
            events: VecDeque::new(),
            pending_changes: 0,
            max_queue: max_queue.max(1),
            overflow,
            overflowed: false,
            bounded: true,
        }
    }

    pub(crate) fn push_change(&mut self, change: ChangeEvent) {
        if !self.bounded || self.pending_changes < self.max_queue {
            self.pending_changes += 1;
            self.events.push_back(WatchEvent::Change(change));
            return;
        }

        match self.overflow {
            OverflowPolicy::Ignore => {
                warn!(
                    "Event queue full ({} pending), dropping {} {}",
                    self.max_queue, change.kind, change.filename
                );
            }
            OverflowPolicy::Error => self.overflowed = true,
        }
    }

    /// Run `fill` with the bound lifted. The initial walk reports the whole
    /// tree before anyone can read, so none of it may be dropped.
    pub(crate) fn unbounded<R>(&mut self, fill: impl FnOnce(&mut Self) -> R) -> R {
        self.bounded = false;
        let result = fill(self);
        self.bounded = true;
        result
    }

    pub(crate) fn push_error(&mut self, error: WatcherError) {
        self.events.push_back(WatchEvent::Error(error));
    }

    pub(crate) fn push_close(&mut self) {
        self.events.push_back(WatchEvent::Close);
    }

    pub(crate) fn pop(&mut self) -> Option<WatchEvent> {
        let event = self.events.pop_front()?;
        if matches!(event, WatchEvent::Change(_)) {
            self.pending_changes -= 1;
        }
        Some(event)
    }

    /// Forget everything still pending, including an unread close.
    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.pending_changes = 0;
        self.overflowed = false;
    }

    /// Returns the bound once if an event was refused under
    /// [`OverflowPolicy::Error`].
    pub(crate) fn take_overflow(&mut self) -> Option<usize> {
        std::mem::take(&mut self.overflowed).then_some(self.max_queue)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}
