//! Category-filtered fan-out of configuration-change events to
//! registered listeners, with a per-listener send deadline so one slow
//! consumer cannot stall the pipeline.

use super::config::{GlobalConfig, SizeClassDetail};
use super::dlq::{DeadLetterQueue, DlqEvent};
use super::{now_millis, CancelToken};
use crate::error::{Error, Result};
use crate::size_class::SizeCategory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Per-listener send deadline during dispatch.
pub const DISPATCH_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    GlobalConfigChange,
    SizeClassConfigChange,
}

/// A configuration-change notification.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: i64,
    /// Category the event concerns; `All` for global changes.
    pub category: SizeCategory,
    pub global: Option<GlobalConfig>,
    pub details: Option<SizeClassDetail>,
}

impl Event {
    pub fn global_change(global: GlobalConfig) -> Event {
        Event {
            event_type: EventType::GlobalConfigChange,
            timestamp: now_millis(),
            category: SizeCategory::All,
            global: Some(global),
            details: None,
        }
    }

    pub fn size_class_change(category: SizeCategory, details: SizeClassDetail) -> Event {
        Event {
            event_type: EventType::SizeClassConfigChange,
            timestamp: now_millis(),
            category,
            global: None,
            details: Some(details),
        }
    }
}

#[derive(Clone)]
enum ListenerTx {
    Bounded(mpsc::Sender<Event>),
    Unbounded(mpsc::UnboundedSender<Event>),
}

/// Receiving half handed back from [`EventHub::register`].
pub enum EventStream {
    Bounded(mpsc::Receiver<Event>),
    Unbounded(mpsc::UnboundedReceiver<Event>),
}

impl EventStream {
    /// Next event, or `None` once the listener is unregistered or the
    /// hub is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        match self {
            EventStream::Bounded(rx) => rx.recv().await,
            EventStream::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        match self {
            EventStream::Bounded(rx) => rx.try_recv().ok(),
            EventStream::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

#[derive(Clone)]
struct Listener {
    tag: String,
    category: SizeCategory,
    tx: ListenerTx,
}

fn matches(listener: &Listener, event: &Event) -> bool {
    listener.category == event.category
        || listener.category == SizeCategory::All
        || event.category == SizeCategory::All
}

/// Multi-subscriber event fan-out. Dispatch copies the listener list
/// under a read lock and releases it before any send.
pub struct EventHub {
    listeners: RwLock<Vec<Listener>>,
    shutdown: CancelToken,
    closed: AtomicBool,
    dlq: Option<Arc<DeadLetterQueue>>,
    dlq_ctx: CancelToken,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            shutdown: CancelToken::new(),
            closed: AtomicBool::new(false),
            dlq: None,
            dlq_ctx: CancelToken::new(),
        }
    }

    /// Attach a dead-letter queue; dispatch failures are recorded there.
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Add a listener. `buffer_size` 0 creates an unbounded channel.
    /// Tags must be unique within the hub.
    pub fn register(
        &self,
        tag: impl Into<String>,
        category: SizeCategory,
        buffer_size: usize,
    ) -> Result<EventStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BufferClosed);
        }
        let tag = tag.into();
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if listeners.iter().any(|l| l.tag == tag) {
            return Err(Error::BadArgument(format!(
                "listener tag {tag:?} already registered"
            )));
        }

        let (tx, stream) = if buffer_size == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (ListenerTx::Unbounded(tx), EventStream::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(buffer_size);
            (ListenerTx::Bounded(tx), EventStream::Bounded(rx))
        };
        debug!(tag = %tag, %category, buffer_size, "listener registered");
        listeners.push(Listener { tag, category, tx });
        Ok(stream)
    }

    /// Remove a listener and close its stream.
    pub fn unregister(&self, tag: &str) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.tag != tag);
        if listeners.len() != before {
            debug!(tag, "listener unregistered");
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fan `event` out to every matching listener. Each send gets
    /// [`DISPATCH_DEADLINE`]; a timed-out or closed listener is skipped
    /// (and dead-lettered when a queue is attached). A close signal
    /// aborts the remaining sends. Returns the number delivered.
    pub async fn dispatch(&self, event: Event) -> usize {
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|&l| matches(l, &event))
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for listener in targets {
            if self.shutdown.is_cancelled() {
                info!("dispatch aborted by close signal");
                break;
            }
            match &listener.tx {
                ListenerTx::Unbounded(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        self.dead_letter(&listener, &event, Error::BufferClosed);
                    }
                }
                ListenerTx::Bounded(tx) => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            info!("dispatch aborted by close signal");
                            break;
                        }
                        sent = timeout(DISPATCH_DEADLINE, tx.send(event.clone())) => {
                            match sent {
                                Ok(Ok(())) => delivered += 1,
                                Ok(Err(_)) => {
                                    self.dead_letter(&listener, &event, Error::BufferClosed);
                                }
                                Err(_) => {
                                    error!(
                                        listener = %listener.tag,
                                        "dispatch deadline exceeded"
                                    );
                                    self.dead_letter(
                                        &listener,
                                        &event,
                                        Error::Timeout("dispatch deadline exceeded".to_string()),
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        delivered
    }

    fn dead_letter(&self, listener: &Listener, event: &Event, err: Error) {
        let Some(dlq) = &self.dlq else {
            return;
        };
        let entry = DlqEvent::new(
            event.clone(),
            format!("dispatch to {:?} failed", listener.tag),
            Some(err.to_string()),
        );
        if let Err(push_err) = dlq.push(entry, &self.dlq_ctx) {
            warn!(%push_err, "failed to dead-letter dispatch failure");
        }
    }

    /// Shut the hub down exactly once: trip the close signal, then close
    /// every listener stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.clear();
        info!("event hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
