//! # codex-tree-watch
//!
//! Print every change under a path, one line per event.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use codex_tree_watcher::{Backend, ChangeEvent, FilenameEncoding, WatchOptions, WatcherError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "codex-tree-watch")]
#[command(about = "Watch a file or directory tree and print its changes", long_about = None)]
struct Args {
    /// File or directory to watch
    path: PathBuf,

    /// TOML file with watch options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Watch only PATH itself
    #[arg(long)]
    no_recursive: bool,

    /// Use the polling backend with this interval in milliseconds
    #[arg(long, value_name = "MS")]
    poll: Option<u64>,

    /// Wait this long after the first native event before reporting
    #[arg(long, value_name = "MS")]
    debounce: Option<u64>,

    /// Ignore entries matching this pattern (repeatable)
    #[arg(long, value_name = "PATTERN")]
    ignore: Vec<String>,

    /// Report filenames as raw bytes
    #[arg(long)]
    buffer: bool,

    /// Report the initial tree and exit
    #[arg(long)]
    no_persistent: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn options(&self) -> anyhow::Result<WatchOptions> {
        let mut options = match &self.config {
            Some(path) => WatchOptions::load(path)?,
            None => WatchOptions::default(),
        };

        if self.no_recursive {
            options.recursive = false;
        }
        if let Some(interval_ms) = self.poll {
            anyhow::ensure!(interval_ms > 0, "--poll interval must be at least 1ms");
            options.backend = Backend::Poll { interval_ms };
        }
        if let Some(debounce_ms) = self.debounce {
            options.debounce_ms = debounce_ms;
        }
        if self.buffer {
            options.encoding = FilenameEncoding::Buffer;
        }
        if self.no_persistent {
            options.persistent = false;
        }
        options.ignore.extend(self.ignore.iter().cloned());
        Ok(options)
    }
}

fn print_change(change: &ChangeEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(change)?);
    } else {
        println!("{}\t{}", change.kind, change.filename);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = args.options()?;

    let token = CancellationToken::new();
    let mut stream = codex_tree_watcher::watch(&args.path, options)
        .with_context(|| format!("cannot watch {}", args.path.display()))?
        .with_cancellation(token.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            token.cancel();
        }
    });

    while let Some(item) = stream.next().await {
        match item {
            Ok(change) => print_change(&change, args.json)?,
            Err(WatcherError::Cancelled) => break,
            Err(WatcherError::QueueOverflow(max_queue)) => {
                anyhow::bail!("more than {max_queue} events pending, watcher closed")
            }
            Err(err) => warn!("{err}"),
        }
    }

    Ok(())
}
