//! Change notification for the namespace and role stores.
//!
//! Every write to either store produces a [`ChangeEvent`] on the matching [`Channel`].
//! Consumers never inspect the payload: any event means "re-fetch the whole table".
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Store writes   │────>│ ChangeNotifier  │────>│ Snapshot caches │
//! │ (pg triggers or │     │ (broadcast fan- │     │  (reload+swap)  │
//! │  sqlite repos)  │     │  out per chan.) │     │                 │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! Two implementations exist: [`LocalNotifier`] for single-process deployments (SQLite)
//! and tests, and `PgChangeNotifier` which turns PostgreSQL `NOTIFY` into events so that
//! writes from any server process reach every other process.

#[cfg(feature = "database-postgres")]
mod postgres;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
#[cfg(feature = "database-postgres")]
pub use postgres::PgChangeNotifier;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default buffer of the in-process fan-out. A subscriber further behind than this
/// receives a single synthetic event instead of the events it missed.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Logical notification channels, one per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Namespaces,
    Roles,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Namespaces, Channel::Roles];

    /// Name of the PostgreSQL `LISTEN` channel fed by the migration's triggers.
    pub fn pg_channel(&self) -> &'static str {
        match self {
            Self::Namespaces => "runledger_namespaces",
            Self::Roles => "runledger_roles",
        }
    }

    pub fn from_pg_channel(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.pg_channel() == name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaces => f.write_str("namespaces"),
            Self::Roles => f.write_str("roles"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub channel: Channel,
    /// Opaque, possibly empty
    pub payload: String,
}

impl ChangeEvent {
    pub fn new(channel: Channel, payload: impl Into<String>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Event emitted when the notifier cannot prove nothing was missed
    /// (reconnect, subscriber lag).
    pub fn synthetic(channel: Channel) -> Self {
        Self::new(channel, "")
    }

    pub fn is_synthetic(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[cfg(feature = "database-postgres")]
    #[error("Failed to subscribe to change notifications: {0}")]
    Subscribe(#[from] sqlx::Error),

    #[error("Notifier already started")]
    AlreadyStarted,
}

/// Source of store change events.
///
/// `subscribe` may be called before or after `start`; a stream obtained before
/// `start` receives everything published afterwards.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Stream of events for one channel. Lazy; ends only when the notifier is dropped.
    fn subscribe(&self, channel: Channel) -> BoxStream<'static, ChangeEvent>;

    /// Begin listening. Failure to establish the subscription is fatal to the caller.
    async fn start(&self) -> Result<(), NotifierError>;

    /// Stop the background listener, if any.
    fn close(&self);
}

/// In-process broadcast shared by every notifier implementation.
#[derive(Debug)]
pub(crate) struct Fanout {
    sender: broadcast::Sender<ChangeEvent>,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

impl Fanout {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Returns the number of subscribers that received the event.
    pub(crate) fn publish(&self, event: ChangeEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub(crate) fn publish_synthetic_all(&self) {
        for channel in Channel::ALL {
            self.publish(ChangeEvent::synthetic(channel));
        }
    }

    pub(crate) fn subscribe(&self, channel: Channel) -> BoxStream<'static, ChangeEvent> {
        let rx = self.sender.subscribe();
        futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.channel == channel => return Some((event, rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            channel = %channel,
                            missed,
                            "Change subscriber lagged, forcing a full reload"
                        );
                        return Some((ChangeEvent::synthetic(channel), rx));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub(crate) fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub(crate) fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

/// Notifier whose events originate in this process.
///
/// The SQLite store layer calls [`LocalNotifier::notify`] after each committed write.
/// Tests drive caches with it directly. Clones share one fan-out.
#[derive(Debug, Clone)]
pub struct LocalNotifier {
    fanout: Arc<Fanout>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fanout: Arc::new(Fanout::with_capacity(capacity)),
        }
    }

    /// Announce a change on `channel`. Returns the number of subscribers reached.
    pub fn notify(&self, channel: Channel) -> usize {
        self.publish(ChangeEvent::new(channel, "local"))
    }

    pub fn publish(&self, event: ChangeEvent) -> usize {
        tracing::trace!(channel = %event.channel, "Publishing change event");
        self.fanout.publish(event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }

    pub fn events_published(&self) -> u64 {
        self.fanout.events_published()
    }

    pub fn events_dropped(&self) -> u64 {
        self.fanout.events_dropped()
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeNotifier for LocalNotifier {
    fn subscribe(&self, channel: Channel) -> BoxStream<'static, ChangeEvent> {
        self.fanout.subscribe(channel)
    }

    async fn start(&self) -> Result<(), NotifierError> {
        Ok(())
    }

    fn close(&self) {}
}
