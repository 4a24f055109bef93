use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use super::{
    error::CacheResult,
    snapshot::{SnapshotCache, SnapshotSource},
};
use crate::{
    db::{DbResult, NamespaceRepo},
    events::{ChangeNotifier, Channel},
    models::{CreateNamespace, Namespace, UpdateNamespace},
};

/// Point-in-time copy of every live namespace, indexed by code and by ID.
#[derive(Debug, Default)]
pub struct NamespaceSnapshot {
    ordered: Vec<Arc<Namespace>>,
    by_code: HashMap<String, Arc<Namespace>>,
    by_id: HashMap<i64, Arc<Namespace>>,
}

impl NamespaceSnapshot {
    pub fn build(namespaces: Vec<Namespace>) -> Self {
        let mut snapshot = Self {
            ordered: Vec::with_capacity(namespaces.len()),
            by_code: HashMap::with_capacity(namespaces.len()),
            by_id: HashMap::with_capacity(namespaces.len()),
        };
        for namespace in namespaces {
            let namespace = Arc::new(namespace);
            snapshot
                .by_code
                .insert(namespace.code.clone(), Arc::clone(&namespace));
            snapshot.by_id.insert(namespace.id, Arc::clone(&namespace));
            snapshot.ordered.push(namespace);
        }
        snapshot.ordered.sort_by_key(|ns| ns.id);
        snapshot
    }

    pub fn get_by_code(&self, code: &str) -> Option<&Arc<Namespace>> {
        self.by_code.get(code)
    }

    pub fn get_by_id(&self, id: i64) -> Option<&Arc<Namespace>> {
        self.by_id.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Namespace>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

struct NamespaceSource {
    repo: Arc<dyn NamespaceRepo>,
}

#[async_trait]
impl SnapshotSource for NamespaceSource {
    type Snapshot = NamespaceSnapshot;
    const NAME: &'static str = "namespace";

    async fn load(&self) -> DbResult<NamespaceSnapshot> {
        Ok(NamespaceSnapshot::build(self.repo.list_all().await?))
    }
}

/// In-memory namespace lookups kept consistent with the namespace store.
///
/// Lookups never touch the database. Writes go straight to the store and are followed
/// by a refresh so the writing process sees its own write without waiting for the
/// notification round trip.
pub struct CachedNamespaceRepo {
    repo: Arc<dyn NamespaceRepo>,
    cache: SnapshotCache<NamespaceSource>,
}

impl CachedNamespaceRepo {
    pub async fn new(
        repo: Arc<dyn NamespaceRepo>,
        notifier: &dyn ChangeNotifier,
        resync_interval: Option<Duration>,
        task_tracker: &TaskTracker,
    ) -> CacheResult<Self> {
        let cache = SnapshotCache::new(
            NamespaceSource {
                repo: Arc::clone(&repo),
            },
            notifier,
            Channel::Namespaces,
            resync_interval,
            task_tracker,
        )
        .await?;
        Ok(Self { repo, cache })
    }

    pub fn get_by_code(&self, code: &str) -> Option<Arc<Namespace>> {
        self.cache.snapshot().data.get_by_code(code).cloned()
    }

    pub fn get_by_id(&self, id: i64) -> Option<Arc<Namespace>> {
        self.cache.snapshot().data.get_by_id(id).cloned()
    }

    /// All namespaces ordered by ID, from one snapshot.
    pub fn list(&self) -> Vec<Arc<Namespace>> {
        self.cache.snapshot().data.iter().cloned().collect()
    }

    pub fn version(&self) -> u64 {
        self.cache.version()
    }

    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.cache.watch_version()
    }

    pub async fn refresh(&self) -> CacheResult<u64> {
        self.cache.refresh().await
    }

    pub async fn create(&self, input: CreateNamespace) -> DbResult<Namespace> {
        let namespace = self.repo.create(input).await?;
        self.refresh_after_write().await;
        Ok(namespace)
    }

    pub async fn update(&self, id: i64, input: UpdateNamespace) -> DbResult<Namespace> {
        let namespace = self.repo.update(id, input).await?;
        self.refresh_after_write().await;
        Ok(namespace)
    }

    pub fn close(&self) {
        self.cache.close();
    }

    /// The write is committed either way; a failed refresh only delays visibility until
    /// the next event or resync.
    async fn refresh_after_write(&self) {
        if let Err(e) = self.cache.refresh().await {
            tracing::warn!(error = %e, "Namespace cache refresh after write failed");
        }
    }
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use super::*;
    use crate::{
        db::{DbError, tests::harness::create_sqlite_db},
        events::LocalNotifier,
        models::DEFAULT_NAMESPACE_CODE,
    };

    fn create_input(code: &str) -> CreateNamespace {
        CreateNamespace {
            code: code.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_snapshot_indexes() {
        let now = chrono::Utc::now();
        let ns = |id: i64, code: &str| Namespace {
            id,
            code: code.to_string(),
            description: String::new(),
            default_experiment_id: None,
            created_at: now,
            updated_at: now,
        };
        let snapshot = NamespaceSnapshot::build(vec![ns(3, "c"), ns(1, "a"), ns(2, "b")]);

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get_by_code("b").unwrap().id, 2);
        assert_eq!(snapshot.get_by_id(3).unwrap().code, "c");
        assert!(snapshot.get_by_code("z").is_none());
        let ids: Vec<i64> = snapshot.iter().map(|ns| ns.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_loads_existing_namespaces() {
        let db = create_sqlite_db().await;
        db.namespaces().ensure_default().await.unwrap();
        let notifier = db.change_notifier(&TaskTracker::new());

        let cache = CachedNamespaceRepo::new(db.namespaces(), notifier.as_ref(), None, &TaskTracker::new())
            .await
            .unwrap();

        assert_eq!(cache.get_by_code(DEFAULT_NAMESPACE_CODE).unwrap().id, 1);
        assert_eq!(cache.get_by_id(1).unwrap().code, DEFAULT_NAMESPACE_CODE);
        assert!(cache.get_by_code("missing").is_none());
        assert!(cache.get_by_id(42).is_none());
    }

    #[tokio::test]
    async fn test_create_is_visible_to_writer_immediately() {
        let db = create_sqlite_db().await;
        let notifier = db.change_notifier(&TaskTracker::new());
        let cache = CachedNamespaceRepo::new(db.namespaces(), notifier.as_ref(), None, &TaskTracker::new())
            .await
            .unwrap();

        let created = cache.create(create_input("temp")).await.unwrap();

        assert_eq!(cache.get_by_code("temp").unwrap().id, created.id);
        assert!(cache.version() >= 2);
    }

    #[tokio::test]
    async fn test_write_by_another_party_arrives_via_event() {
        let db = create_sqlite_db().await;
        let notifier = db.change_notifier(&TaskTracker::new());
        let cache = CachedNamespaceRepo::new(db.namespaces(), notifier.as_ref(), None, &TaskTracker::new())
            .await
            .unwrap();
        let mut versions = cache.watch_version();

        // Straight to the store, bypassing the cache
        db.namespaces().create(create_input("ns1")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), versions.wait_for(|v| *v >= 2))
            .await
            .expect("event did not trigger reload")
            .unwrap();
        assert!(cache.get_by_code("ns1").is_some());
    }

    #[tokio::test]
    async fn test_rename_conflict_leaves_cache_unchanged() {
        let db = create_sqlite_db().await;
        let notifier = db.change_notifier(&TaskTracker::new());
        let cache = CachedNamespaceRepo::new(db.namespaces(), notifier.as_ref(), None, &TaskTracker::new())
            .await
            .unwrap();

        cache.create(create_input("existing")).await.unwrap();
        let temp = cache.create(create_input("temp")).await.unwrap();

        let result = cache
            .update(
                temp.id,
                UpdateNamespace {
                    code: "existing".into(),
                    description: String::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(DbError::Conflict(_))));

        cache.refresh().await.unwrap();
        assert_eq!(cache.get_by_id(temp.id).unwrap().code, "temp");
        assert_eq!(cache.get_by_code("existing").unwrap().code, "existing");
    }

    #[tokio::test]
    async fn test_snapshot_survives_concurrent_readers() {
        let db = create_sqlite_db().await;
        let notifier = LocalNotifier::new();
        let cache = Arc::new(
            CachedNamespaceRepo::new(db.namespaces(), &notifier, None, &TaskTracker::new())
                .await
                .unwrap(),
        );

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        // Each list comes from one complete snapshot
                        let list = cache.list();
                        assert!(list.windows(2).all(|w| w[0].id < w[1].id));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for i in 0..20 {
            cache.create(create_input(&format!("ns{i}"))).await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(cache.list().len(), 20);
    }
}
