//! Reload-and-swap machinery shared by the namespace and role caches.
//!
//! A cache holds one immutable, fully built snapshot behind `RwLock<Arc<_>>`. Readers
//! clone the `Arc` and never observe a partially built state. Writers (reloads) build a
//! new snapshot off to the side and publish it with a single pointer swap.
//!
//! Reloads are serialized by an async mutex and coalesced with request tickets: every
//! reload request takes a ticket, and a reload covers every ticket issued before it
//! started reading. A request whose ticket is already covered when it acquires the mutex
//! returns without touching the database.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::error::{CacheError, CacheResult};
use crate::{
    db::DbResult,
    events::{ChangeEvent, ChangeNotifier, Channel},
};

/// Produces a complete snapshot from the backing store.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    type Snapshot: Send + Sync + 'static;

    /// Cache name for logs and errors.
    const NAME: &'static str;

    async fn load(&self) -> DbResult<Self::Snapshot>;
}

/// A snapshot tagged with the version it was published under.
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub data: T,
}

struct Inner<S: SnapshotSource> {
    source: S,
    current: RwLock<Arc<Versioned<S::Snapshot>>>,
    reload_lock: Mutex<()>,
    /// Last ticket handed out
    requested: AtomicU64,
    /// Every ticket up to this one has been served by a completed reload
    covered: AtomicU64,
    version_tx: watch::Sender<u64>,
}

impl<S: SnapshotSource> Inner<S> {
    fn current_version(&self) -> u64 {
        self.current.read().version
    }

    async fn reload(&self) -> CacheResult<u64> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.reload_lock.lock().await;

        if self.covered.load(Ordering::SeqCst) >= ticket {
            tracing::trace!(cache = S::NAME, ticket, "Reload already covered");
            return Ok(self.current_version());
        }

        // Everything requested so far is satisfied by a read that starts now.
        let target = self.requested.load(Ordering::SeqCst);
        let data = self
            .source
            .load()
            .await
            .map_err(|source| CacheError::Reload {
                cache: S::NAME,
                source,
            })?;

        let version = {
            let mut current = self.current.write();
            let version = current.version + 1;
            *current = Arc::new(Versioned { version, data });
            version
        };
        self.covered.fetch_max(target, Ordering::SeqCst);
        self.version_tx.send_replace(version);

        tracing::debug!(cache = S::NAME, version, "Cache reloaded");
        Ok(version)
    }
}

/// A cache kept consistent with its store by change events and periodic resync.
pub struct SnapshotCache<S: SnapshotSource> {
    inner: Arc<Inner<S>>,
    cancel: CancellationToken,
}

impl<S: SnapshotSource> SnapshotCache<S> {
    /// Subscribe to `channel`, load synchronously, then start the refresh task.
    ///
    /// Subscribing before the first load means no change can slip between the two.
    /// `resync_interval = None` disables the periodic reload.
    pub async fn new(
        source: S,
        notifier: &dyn ChangeNotifier,
        channel: Channel,
        resync_interval: Option<Duration>,
        task_tracker: &TaskTracker,
    ) -> CacheResult<Self> {
        let events = notifier.subscribe(channel);

        let data = source.load().await.map_err(|source| CacheError::InitialLoad {
            cache: S::NAME,
            source,
        })?;

        let (version_tx, _) = watch::channel(1);
        let inner = Arc::new(Inner {
            source,
            current: RwLock::new(Arc::new(Versioned { version: 1, data })),
            reload_lock: Mutex::new(()),
            requested: AtomicU64::new(0),
            covered: AtomicU64::new(0),
            version_tx,
        });

        let cancel = CancellationToken::new();
        task_tracker.spawn(run_refresh(
            Arc::clone(&inner),
            events,
            channel,
            resync_interval,
            cancel.clone(),
        ));

        tracing::info!(cache = S::NAME, channel = %channel, "Cache loaded");
        Ok(Self { inner, cancel })
    }

    /// The current snapshot. Cheap; never touches the database.
    pub fn snapshot(&self) -> Arc<Versioned<S::Snapshot>> {
        Arc::clone(&self.inner.current.read())
    }

    pub fn version(&self) -> u64 {
        self.inner.current_version()
    }

    /// Watch published versions.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.inner.version_tx.subscribe()
    }

    /// Reload now. Returns the version that covers this request.
    pub async fn refresh(&self) -> CacheResult<u64> {
        self.inner.reload().await
    }

    /// Stop the refresh task. A reload already in progress runs to completion.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl<S: SnapshotSource> Drop for SnapshotCache<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Trigger {
    Event(ChangeEvent),
    Resync,
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_refresh<S: SnapshotSource>(
    inner: Arc<Inner<S>>,
    mut events: BoxStream<'static, ChangeEvent>,
    channel: Channel,
    resync_interval: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut ticker = resync_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        // Cancellation is only observed here, between reloads.
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => Trigger::Event(event),
                None => {
                    tracing::warn!(
                        cache = S::NAME,
                        channel = %channel,
                        "Change stream closed, relying on periodic resync"
                    );
                    events = futures::stream::pending().boxed();
                    continue;
                }
            },
            _ = next_tick(&mut ticker) => Trigger::Resync,
        };

        // Events that queued up while we were idle are all answered by one reload.
        let mut coalesced = 0usize;
        while let Some(Some(_)) = events.next().now_or_never() {
            coalesced += 1;
        }

        match &trigger {
            Trigger::Event(event) => tracing::debug!(
                cache = S::NAME,
                synthetic = event.is_synthetic(),
                coalesced,
                "Change event received"
            ),
            Trigger::Resync => tracing::trace!(cache = S::NAME, "Periodic resync"),
        }

        if let Err(e) = inner.reload().await {
            tracing::warn!(
                cache = S::NAME,
                error = %e,
                version = inner.current_version(),
                "Cache reload failed, serving previous snapshot"
            );
        }
    }

    tracing::debug!(cache = S::NAME, "Cache refresh task stopped");
}
