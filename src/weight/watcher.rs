//! Debounced configuration file watcher.
//!
//! A background task polls the file's metadata and collapses bursts of
//! writes into a single reload after a quiet period. Removal is tolerated
//! with a bounded retry, after which the watcher keeps running and picks
//! the file up again if it reappears.

use super::config::{Config, Format};
use super::CancelToken;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Quiet period after the last observed change before reloading.
pub const DEBOUNCE: Duration = Duration::from_millis(500);
/// Metadata poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Attempts to find a removed file before giving up on it for now.
const REMOVAL_RETRIES: u32 = 5;
const REMOVAL_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Buffered configurations on the output stream.
const CHANNEL_CAPACITY: usize = 100;

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;

/// Change detection key: modification time plus length, so rewrites on
/// filesystems with coarse timestamps are still seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> std::io::Result<FileStamp> {
    let meta = fs::metadata(path)?;
    Ok(FileStamp {
        mtime: meta.modified().ok(),
        len: meta.len(),
    })
}

fn read_config(path: &Path, format: Format) -> Result<Config> {
    let raw = fs::read_to_string(path).map_err(|e| Error::InvalidConfiguration {
        scope: "watcher".to_string(),
        detail: format!("failed to read {}: {e}", path.display()),
    })?;
    format.decode(&raw)
}

/// Watches one configuration file and emits each decoded revision on a
/// finite single-producer stream. Not restartable after close.
pub struct FileWatcher {
    format: Format,
    path: PathBuf,
    state: AtomicU8,
    cancel: CancelToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    /// Validates the format tag and stats the file once up front.
    pub fn new(format: Format, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        stamp(&path).map_err(|e| {
            Error::BadArgument(format!("cannot stat {}: {e}", path.display()))
        })?;
        Ok(Self {
            format,
            path,
            state: AtomicU8::new(STATE_STOPPED),
            cancel: CancelToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and emit the current configuration, then start the watch
    /// loop. Fails if the watcher is already running or was closed.
    pub fn watch(&self) -> Result<mpsc::Receiver<Config>> {
        if self.cancel.is_cancelled() {
            return Err(Error::BufferClosed);
        }
        if self
            .state
            .compare_exchange(
                STATE_STOPPED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::BadArgument("watcher is already running".to_string()));
        }

        let initial = match read_config(&self.path, self.format) {
            Ok(initial) => initial,
            Err(err) => {
                self.state.store(STATE_STOPPED, Ordering::Release);
                return Err(err);
            }
        };
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        // Capacity is fresh; the initial push cannot fail.
        let _ = tx.try_send(initial);
        info!(path = %self.path.display(), format = %self.format, "watching configuration file");

        let handle = tokio::spawn(watch_loop(
            self.path.clone(),
            self.format,
            tx,
            self.cancel.clone(),
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(rx)
    }

    /// Stop watching: exactly-once transition out of `Running`. Any
    /// pending debounce is cancelled and the output stream closes.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.cancel.cancel();
            info!(path = %self.path.display(), "watcher closed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }
}

async fn watch_loop(path: PathBuf, format: Format, tx: mpsc::Sender<Config>, cancel: CancelToken) {
    let mut last_seen = stamp(&path).ok();
    let mut reload_at: Option<Instant> = None;
    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(path = %path.display(), "watch loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match stamp(&path) {
            Ok(current) => {
                if last_seen != Some(current) {
                    debug!(path = %path.display(), "file change detected");
                    last_seen = Some(current);
                    reload_at = Some(Instant::now() + DEBOUNCE);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "configuration file removed or renamed");
                reload_at = None;
                if await_restore(&path, &cancel).await {
                    debug!(path = %path.display(), "configuration file restored");
                    last_seen = stamp(&path).ok();
                    reload_at = Some(Instant::now() + DEBOUNCE);
                } else if cancel.is_cancelled() {
                    break;
                } else {
                    error!(
                        path = %path.display(),
                        "configuration file not restored; still watching"
                    );
                    last_seen = None;
                }
            }
            Err(e) => error!(path = %path.display(), %e, "failed to stat configuration file"),
        }

        if let Some(deadline) = reload_at {
            if Instant::now() >= deadline {
                reload_at = None;
                match read_config(&path, format) {
                    Ok(cfg) => {
                        debug!(path = %path.display(), version = %cfg.version, "reloaded");
                        if tx.try_send(cfg).is_err() {
                            warn!("configuration stream full, dropping update");
                        }
                    }
                    Err(err) => error!(%err, "failed to reload configuration file"),
                }
            }
        }
    }
    debug!(path = %path.display(), "watch loop stopped");
}

/// Wait for a removed file to come back, bounded by the retry budget.
async fn await_restore(path: &Path, cancel: &CancelToken) -> bool {
    for _ in 0..REMOVAL_RETRIES {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = sleep(REMOVAL_RETRY_DELAY) => {}
        }
        if stamp(path).is_ok() {
            return true;
        }
    }
    false
}
