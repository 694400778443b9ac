//! Configuration types for tree watching.

use std::ffi::OsStr;
use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::error::{Result, WatcherError};

/// Default bound on events waiting to be read.
pub const DEFAULT_MAX_QUEUE: usize = 2048;

/// Default time to let a burst of native events settle.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Options for a watch session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Whether held watches keep `next()` waiting for more events.
    pub persistent: bool,

    /// Walk and watch the whole tree under a directory root.
    pub recursive: bool,

    /// How reported filenames are encoded.
    pub encoding: FilenameEncoding,

    /// Wildcard patterns for entries that are neither watched nor reported.
    pub ignore: Vec<String>,

    /// Which native watch primitive to use.
    pub backend: Backend,

    /// Maximum number of events waiting to be read.
    pub max_queue: usize,

    /// What to do when the event queue is full.
    pub overflow: OverflowPolicy,

    /// Milliseconds to wait after the first native event before
    /// reconciling, so one filesystem operation is handled as one batch.
    /// 0 reconciles immediately.
    pub debounce_ms: u64,
}

impl WatchOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self {
            persistent: true,
            recursive: true,
            encoding: FilenameEncoding::default(),
            ignore: Vec::new(),
            backend: Backend::default(),
            max_queue: DEFAULT_MAX_QUEUE,
            overflow: OverflowPolicy::default(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }

    /// Set whether held watches keep the consumer waiting.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set recursive mode.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Set the filename encoding.
    pub fn with_encoding(mut self, encoding: FilenameEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Add an ignore pattern.
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore.push(pattern.into());
        self
    }

    /// Set the native backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the queue bound.
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set the debounce window in milliseconds.
    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    /// Debounce window, if any.
    pub fn debounce(&self) -> Option<Duration> {
        (self.debounce_ms > 0).then_some(Duration::from_millis(self.debounce_ms))
    }

    /// Parse options from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(content).map_err(|e| WatcherError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WatcherError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.max_queue == 0 {
            return Err(WatcherError::Config("max_queue must be at least 1".to_string()));
        }
        if let Backend::Poll { interval_ms: 0 } = self.backend {
            return Err(WatcherError::Config(
                "poll interval must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoding of reported filenames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenameEncoding {
    /// UTF-8 text, invalid sequences replaced.
    #[default]
    Utf8,

    /// Raw platform bytes.
    Buffer,
}

/// Native watch primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    /// The platform's recommended event backend.
    #[default]
    Native,

    /// Stat polling at a fixed interval.
    Poll {
        /// Poll interval in milliseconds.
        interval_ms: u64,
    },
}

impl Backend {
    /// Poll interval, for the polling backend.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            Self::Native => None,
            Self::Poll { interval_ms } => Some(Duration::from_millis(*interval_ms)),
        }
    }
}

/// What happens when events arrive faster than they are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the event and log a warning.
    #[default]
    Ignore,

    /// Fail the next read and close the watcher.
    Error,
}

/// Compiled ignore patterns.
#[derive(Debug, Default)]
pub(crate) struct IgnoreSet {
    patterns: Vec<WildMatch>,
}

impl IgnoreSet {
    pub(crate) fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| WildMatch::new(p)).collect(),
        }
    }

    /// Match against the root-relative path (with `/` separators) and the
    /// file name.
    pub(crate) fn matches(&self, relative: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let joined = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        let name = relative
            .file_name()
            .map(OsStr::to_string_lossy)
            .unwrap_or_default();

        self.patterns
            .iter()
            .any(|p| p.matches(&joined) || p.matches(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_options_defaults() {
        let options = WatchOptions::default();

        assert!(options.persistent);
        assert!(options.recursive);
        assert_eq!(options.encoding, FilenameEncoding::Utf8);
        assert_eq!(options.backend, Backend::Native);
        assert_eq!(options.max_queue, DEFAULT_MAX_QUEUE);
        assert_eq!(options.overflow, OverflowPolicy::Ignore);
        assert_eq!(options.debounce(), Some(Duration::from_millis(DEFAULT_DEBOUNCE_MS)));
        assert_eq!(options.with_debounce_ms(0).debounce(), None);
    }

    #[test]
    fn test_options_builder() {
        let options = WatchOptions::new()
            .with_recursive(false)
            .with_persistent(false)
            .with_encoding(FilenameEncoding::Buffer)
            .with_backend(Backend::Poll { interval_ms: 50 })
            .ignore("*.log");

        assert!(!options.recursive);
        assert!(!options.persistent);
        assert_eq!(options.encoding, FilenameEncoding::Buffer);
        assert_eq!(
            options.backend.poll_interval(),
            Some(Duration::from_millis(50))
        );
        assert_eq!(options.ignore, vec!["*.log".to_string()]);
    }

    #[test]
    fn test_options_from_toml() {
        let options = WatchOptions::from_toml_str(
            r#"
            recursive = false
            encoding = "buffer"
            ignore = ["target", "*.swp"]
            max_queue = 16
            overflow = "error"
            debounce_ms = 10

            [backend]
            kind = "poll"
            interval_ms = 250
            "#,
        )
        .unwrap();

        assert!(!options.recursive);
        assert!(options.persistent);
        assert_eq!(options.encoding, FilenameEncoding::Buffer);
        assert_eq!(options.ignore.len(), 2);
        assert_eq!(options.max_queue, 16);
        assert_eq!(options.overflow, OverflowPolicy::Error);
        assert_eq!(options.backend, Backend::Poll { interval_ms: 250 });
        assert_eq!(options.debounce_ms, 10);
    }

    #[test]
    fn test_options_reject_invalid_values() {
        assert!(matches!(
            WatchOptions::from_toml_str("max_queue = 0"),
            Err(WatcherError::Config(_))
        ));
        assert!(matches!(
            WatchOptions::from_toml_str("encoding = \"latin1\""),
            Err(WatcherError::Config(_))
        ));
    }

    #[test]
    fn test_ignore_matches_path_or_name() {
        let ignore = IgnoreSet::new(&["node_modules".to_string(), "*.tmp".to_string()]);

        assert!(ignore.matches(Path::new("node_modules")));
        assert!(ignore.matches(Path::new("web/node_modules")));
        assert!(ignore.matches(Path::new("a/b/c.tmp")));
        assert!(!ignore.matches(Path::new("src/main.rs")));
        assert!(!IgnoreSet::default().matches(Path::new("anything")));
    }
}
