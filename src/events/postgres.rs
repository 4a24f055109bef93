use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::{PgPool, postgres::PgListener};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    Channel, ChangeEvent, ChangeNotifier, DEFAULT_CHANNEL_CAPACITY, Fanout, NotifierError,
};

/// Delay between reconnect attempts after the listener connection fails.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Cross-process notifier backed by PostgreSQL `LISTEN/NOTIFY`.
///
/// Triggers installed by the PostgreSQL migration `pg_notify` on every statement that
/// touches the namespace or role tables. One dedicated connection listens on both
/// channels and forwards notifications into the in-process fan-out.
pub struct PgChangeNotifier {
    pool: PgPool,
    fanout: Arc<Fanout>,
    cancel: CancellationToken,
    task_tracker: TaskTracker,
    started: AtomicBool,
}

impl PgChangeNotifier {
    pub fn new(pool: PgPool, task_tracker: TaskTracker) -> Self {
        Self {
            pool,
            fanout: Arc::new(Fanout::with_capacity(DEFAULT_CHANNEL_CAPACITY)),
            cancel: CancellationToken::new(),
            task_tracker,
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChangeNotifier for PgChangeNotifier {
    fn subscribe(&self, channel: Channel) -> BoxStream<'static, ChangeEvent> {
        self.fanout.subscribe(channel)
    }

    async fn start(&self) -> Result<(), NotifierError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NotifierError::AlreadyStarted);
        }

        let listener = match connect_listener(&self.pool).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        tracing::info!(
            channels = ?Channel::ALL.map(|c| c.pg_channel()),
            "Listening for store change notifications"
        );

        let fanout = Arc::clone(&self.fanout);
        let cancel = self.cancel.clone();
        self.task_tracker.spawn(listen_loop(listener, fanout, cancel));
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

async fn connect_listener(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener
        .listen_all(Channel::ALL.iter().map(|c| c.pg_channel()))
        .await?;
    Ok(listener)
}

async fn listen_loop(mut listener: PgListener, fanout: Arc<Fanout>, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = listener.try_recv() => received,
        };

        match received {
            Ok(Some(notification)) => match Channel::from_pg_channel(notification.channel()) {
                Some(channel) => {
                    tracing::debug!(
                        channel = %channel,
                        payload = notification.payload(),
                        "Store change notification"
                    );
                    fanout.publish(ChangeEvent::new(channel, notification.payload()));
                }
                None => {
                    tracing::debug!(
                        channel = notification.channel(),
                        "Ignoring notification on unknown channel"
                    );
                }
            },
            Ok(None) => {
                tracing::warn!("Change listener connection lost, reconnecting");
                if !reconnect(&mut listener, &cancel).await {
                    break;
                }
                // Anything committed while the connection was down produced no NOTIFY we
                // could see.
                fanout.publish_synthetic_all();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Change listener receive failed");
                if !reconnect(&mut listener, &cancel).await {
                    break;
                }
                fanout.publish_synthetic_all();
            }
        }
    }
    tracing::debug!("Change listener stopped");
}

/// Re-establish the listener connection. Returns false if cancelled first.
///
/// Executing any statement through the listener reconnects it and re-issues `LISTEN`
/// for every channel it was subscribed to.
async fn reconnect(listener: &mut PgListener, cancel: &CancellationToken) -> bool {
    loop {
        match sqlx::query("SELECT 1").execute(&mut *listener).await {
            Ok(_) => {
                tracing::info!("Change listener reconnected");
                return true;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    backoff_secs = RECONNECT_BACKOFF.as_secs(),
                    "Change listener reconnect failed"
                );
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{
        db::{
            NamespaceRepo, RoleRepo,
            postgres::{PostgresNamespaceRepo, PostgresRoleRepo},
            tests::harness::postgres::{isolated_postgres_pool, migrated_postgres_pool},
        },
        models::{CreateNamespace, PermissionLevel, RoleGrant, UpsertRole},
    };

    async fn next_event(
        stream: &mut BoxStream<'static, ChangeEvent>,
    ) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out waiting for notification")
            .expect("stream ended")
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn test_triggers_reach_subscribers() {
        let pool = migrated_postgres_pool().await;

        let tracker = TaskTracker::new();
        let notifier = PgChangeNotifier::new(pool.clone(), tracker.clone());
        let mut namespaces = notifier.subscribe(Channel::Namespaces);
        let mut roles = notifier.subscribe(Channel::Roles);
        notifier.start().await.unwrap();

        PostgresNamespaceRepo::new(pool.clone(), None)
            .create(CreateNamespace {
                code: "from-trigger".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        let event = next_event(&mut namespaces).await;
        assert_eq!(event.channel, Channel::Namespaces);
        assert!(event.payload.starts_with("namespaces:"));

        PostgresRoleRepo::new(pool.clone(), None)
            .upsert(UpsertRole {
                name: "ns:from-trigger".into(),
                grant: RoleGrant::Namespaces(vec!["from-trigger".into()]),
                users: vec!["alice".into()],
                permission: PermissionLevel::ReadWrite,
            })
            .await
            .unwrap();
        assert_eq!(next_event(&mut roles).await.channel, Channel::Roles);

        notifier.close();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("listener did not stop");
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn test_start_twice_fails() {
        let pool = isolated_postgres_pool().await;
        let notifier = PgChangeNotifier::new(pool, TaskTracker::new());
        notifier.start().await.unwrap();
        assert!(matches!(
            notifier.start().await,
            Err(NotifierError::AlreadyStarted)
        ));
        notifier.close();
    }
}
