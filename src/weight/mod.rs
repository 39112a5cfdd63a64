//! Weight-driven tuning: a debounced configuration watcher feeds a
//! normalizing processor, whose output fans out through an event hub to
//! the category managers. Failed dispatches land in a bounded dead-letter
//! queue.

pub mod config;
pub mod dlq;
pub mod hub;
pub mod processor;
pub mod watcher;

pub use config::{Config, Format, GlobalConfig, SizeClassDetail, SizeClassWeight};
pub use dlq::{DeadLetterQueue, DlqEvent};
pub use hub::{Event, EventHub, EventStream, EventType};
pub use processor::WeightProcessor;
pub use watcher::FileWatcher;

use crate::size_class::SizeCategory;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Milliseconds since the Unix epoch; event and queue timestamps.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Cooperative cancellation shared by the watcher, the hub, and the
/// dead-letter queue. Cloning yields another handle to the same flag.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trip the token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is tripped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive decoded configurations from a watcher stream into the hub:
/// normalize, then dispatch one global event plus one size-class event
/// per category. Parse or validation failures keep the last good
/// configuration in force.
pub fn spawn_tuning_pipeline(
    mut configs: mpsc::Receiver<Config>,
    hub: Arc<EventHub>,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let processor = WeightProcessor::new();
        loop {
            let cfg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cfg = configs.recv() => match cfg {
                    Some(cfg) => cfg,
                    None => break,
                },
            };

            let normalized = match processor.normalize(&cfg) {
                Ok(normalized) => normalized,
                Err(err) => {
                    error!(%err, version = %cfg.version, "rejected configuration update");
                    continue;
                }
            };
            info!(version = %normalized.version, "applying configuration update");

            let global_event = Event::global_change(normalized.global);
            hub.dispatch(global_event).await;

            for (category, detail) in [
                (SizeCategory::Small, &normalized.size_class.small),
                (SizeCategory::Medium, &normalized.size_class.medium),
                (SizeCategory::Large, &normalized.size_class.large),
            ] {
                let event = Event::size_class_change(category, detail.clone());
                hub.dispatch(event).await;
            }
            debug!(version = %normalized.version, "configuration fanned out");
        }
    })
}
