use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use super::{
    error::CacheResult,
    snapshot::{SnapshotCache, SnapshotSource},
};
use crate::{
    auth::Identity,
    db::{DbResult, RoleRepo},
    events::{ChangeNotifier, Channel},
    models::{ADMIN_ROLE, PermissionLevel, Role, RoleGrant},
};

/// Namespaces an identity may act in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "codes", rename_all = "snake_case")]
pub enum PermittedNamespaces {
    All,
    Only(BTreeSet<String>),
}

impl PermittedNamespaces {
    pub fn contains(&self, code: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(codes) => codes.contains(code),
        }
    }
}

/// Access derived from one or more role bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Access {
    admin: bool,
    namespaces: HashMap<String, PermissionLevel>,
}

impl Access {
    fn from_grant(grant: &RoleGrant, permission: PermissionLevel) -> Self {
        match grant {
            RoleGrant::All => Self {
                admin: true,
                namespaces: HashMap::new(),
            },
            RoleGrant::Namespaces(codes) => Self {
                admin: false,
                namespaces: codes.iter().map(|c| (c.clone(), permission)).collect(),
            },
        }
    }

    /// Union the namespace sets; where both grant a namespace the higher level wins.
    fn merge(&mut self, other: &Access) {
        self.admin |= other.admin;
        for (code, level) in &other.namespaces {
            self.namespaces
                .entry(code.clone())
                .and_modify(|current| *current = (*current).max(*level))
                .or_insert(*level);
        }
    }

    fn level_for(&self, code: &str) -> Option<PermissionLevel> {
        if self.admin {
            return Some(PermissionLevel::ReadWrite);
        }
        self.namespaces.get(code).copied()
    }

    fn permitted(&self) -> PermittedNamespaces {
        if self.admin {
            PermittedNamespaces::All
        } else {
            PermittedNamespaces::Only(self.namespaces.keys().cloned().collect())
        }
    }
}

/// Indexes derived from every role in one pass over a consistent read.
#[derive(Debug, Default)]
pub struct RoleSnapshot {
    by_user: HashMap<String, Access>,
    by_role: HashMap<String, Access>,
    users_by_namespace: HashMap<String, BTreeSet<String>>,
    admins: BTreeSet<String>,
}

impl RoleSnapshot {
    pub fn build(roles: &[Role]) -> Self {
        let mut snapshot = Self::default();
        for role in roles {
            let access = Access::from_grant(&role.grant, role.permission);

            for user in &role.users {
                snapshot
                    .by_user
                    .entry(user.clone())
                    .or_default()
                    .merge(&access);
                if access.admin {
                    snapshot.admins.insert(user.clone());
                }
                for code in access.namespaces.keys() {
                    snapshot
                        .users_by_namespace
                        .entry(code.clone())
                        .or_default()
                        .insert(user.clone());
                }
            }

            snapshot.by_role.insert(role.name.clone(), access);
        }
        snapshot
    }

    /// Access held by the role named in a token claim. Only stored roles count, except
    /// the admin role, which needs no row.
    fn role_access(&self, role_name: &str) -> Option<Access> {
        if let Some(access) = self.by_role.get(role_name) {
            return Some(access.clone());
        }
        (role_name == ADMIN_ROLE)
            .then(|| Access::from_grant(&RoleGrant::All, PermissionLevel::ReadWrite))
    }

    /// `None` means unrestricted.
    fn access_for(&self, identity: &Identity) -> Option<Access> {
        if identity.is_unrestricted() {
            return None;
        }

        let mut access = self
            .by_user
            .get(identity.principal())
            .cloned()
            .unwrap_or_default();
        for role_name in identity.claimed_roles() {
            if let Some(role_access) = self.role_access(role_name) {
                access.merge(&role_access);
            }
        }
        Some(access)
    }

    pub fn permitted_namespaces(&self, identity: &Identity) -> PermittedNamespaces {
        match self.access_for(identity) {
            None => PermittedNamespaces::All,
            Some(access) => access.permitted(),
        }
    }

    pub fn is_admin(&self, identity: &Identity) -> bool {
        match self.access_for(identity) {
            None => true,
            Some(access) => access.admin,
        }
    }

    pub fn permission_for(&self, identity: &Identity, code: &str) -> Option<PermissionLevel> {
        match self.access_for(identity) {
            None => Some(PermissionLevel::ReadWrite),
            Some(access) => access.level_for(code),
        }
    }

    /// Users bound to a role that lists `code` explicitly. Admins are not included.
    pub fn users_for_namespace(&self, code: &str) -> Vec<String> {
        self.users_by_namespace
            .get(code)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn admins(&self) -> Vec<String> {
        self.admins.iter().cloned().collect()
    }
}

struct RoleSource {
    repo: Arc<dyn RoleRepo>,
}

#[async_trait]
impl SnapshotSource for RoleSource {
    type Snapshot = RoleSnapshot;
    const NAME: &'static str = "role";

    async fn load(&self) -> DbResult<RoleSnapshot> {
        let roles = self.repo.list_all().await?;
        Ok(RoleSnapshot::build(&roles))
    }
}

/// In-memory role bindings kept consistent with the role store.
pub struct CachedRoleRepo {
    cache: SnapshotCache<RoleSource>,
}

impl CachedRoleRepo {
    pub async fn new(
        repo: Arc<dyn RoleRepo>,
        notifier: &dyn ChangeNotifier,
        resync_interval: Option<Duration>,
        task_tracker: &TaskTracker,
    ) -> CacheResult<Self> {
        let cache = SnapshotCache::new(
            RoleSource { repo },
            notifier,
            Channel::Roles,
            resync_interval,
            task_tracker,
        )
        .await?;
        Ok(Self { cache })
    }

    pub fn get_permitted_namespaces(&self, identity: &Identity) -> PermittedNamespaces {
        self.cache.snapshot().data.permitted_namespaces(identity)
    }

    pub fn is_admin(&self, identity: &Identity) -> bool {
        self.cache.snapshot().data.is_admin(identity)
    }

    pub fn permission_for(&self, identity: &Identity, code: &str) -> Option<PermissionLevel> {
        self.cache.snapshot().data.permission_for(identity, code)
    }

    pub fn users_for_namespace(&self, code: &str) -> Vec<String> {
        self.cache.snapshot().data.users_for_namespace(code)
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

    pub fn close(&self) {
        self.cache.close();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    #[cfg(feature = "database-sqlite")]
    use crate::{db::tests::harness::create_sqlite_db, models::UpsertRole};

    fn role(name: &str, grant: RoleGrant, users: &[&str], permission: PermissionLevel) -> Role {
        Role {
            id: 0,
            name: name.to_string(),
            grant,
            users: users.iter().map(|u| u.to_string()).collect(),
            permission,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn ns(codes: &[&str]) -> RoleGrant {
        RoleGrant::Namespaces(codes.iter().map(|c| c.to_string()).collect())
    }

    fn user(name: &str) -> Identity {
        Identity::User {
            name: name.to_string(),
        }
    }

    fn scenario() -> RoleSnapshot {
        RoleSnapshot::build(&[
            role("r1", ns(&["ns1", "ns2"]), &["user1"], PermissionLevel::ReadWrite),
            role("r2", ns(&["ns2", "ns3"]), &["user2"], PermissionLevel::ReadWrite),
            role(ADMIN_ROLE, RoleGrant::All, &["user3"], PermissionLevel::ReadWrite),
        ])
    }

    #[rstest]
    #[case("user1", "ns1", true)]
    #[case("user1", "ns2", true)]
    #[case("user1", "ns3", false)]
    #[case("user2", "ns1", false)]
    #[case("user2", "ns3", true)]
    #[case("user3", "ns3", true)]
    #[case("user3", "anything", true)]
    #[case("stranger", "ns1", false)]
    fn test_scenario_permissions(#[case] name: &str, #[case] code: &str, #[case] allowed: bool) {
        let snapshot = scenario();
        assert_eq!(
            snapshot.permission_for(&user(name), code).is_some(),
            allowed,
            "{name} -> {code}"
        );
        assert_eq!(snapshot.permitted_namespaces(&user(name)).contains(code), allowed);
    }

    #[test]
    fn test_permitted_namespaces_sets() {
        let snapshot = scenario();
        assert_eq!(
            snapshot.permitted_namespaces(&user("user1")),
            PermittedNamespaces::Only(["ns1".to_string(), "ns2".to_string()].into())
        );
        assert_eq!(
            snapshot.permitted_namespaces(&user("user3")),
            PermittedNamespaces::All
        );
        assert_eq!(
            snapshot.permitted_namespaces(&user("nobody")),
            PermittedNamespaces::Only(BTreeSet::new())
        );
    }

    #[test]
    fn test_user_in_two_roles_gets_union_and_highest_level() {
        let snapshot = RoleSnapshot::build(&[
            role("readers", ns(&["a", "b"]), &["alice"], PermissionLevel::ReadOnly),
            role("writers", ns(&["b", "c"]), &["alice"], PermissionLevel::ReadWrite),
        ]);
        let alice = user("alice");

        assert_eq!(snapshot.permission_for(&alice, "a"), Some(PermissionLevel::ReadOnly));
        assert_eq!(snapshot.permission_for(&alice, "b"), Some(PermissionLevel::ReadWrite));
        assert_eq!(snapshot.permission_for(&alice, "c"), Some(PermissionLevel::ReadWrite));
        assert_eq!(snapshot.permission_for(&alice, "d"), None);
    }

    #[test]
    fn test_admin_overrides_other_bindings() {
        let snapshot = RoleSnapshot::build(&[
            role("readers", ns(&["a"]), &["root"], PermissionLevel::ReadOnly),
            role(ADMIN_ROLE, RoleGrant::All, &["root"], PermissionLevel::ReadWrite),
        ]);
        let root = user("root");

        assert!(snapshot.is_admin(&root));
        assert_eq!(snapshot.permission_for(&root, "a"), Some(PermissionLevel::ReadWrite));
        assert_eq!(snapshot.permitted_namespaces(&root), PermittedNamespaces::All);
        assert_eq!(snapshot.admins(), vec!["root"]);
    }

    #[test]
    fn test_unrestricted_identities() {
        let snapshot = RoleSnapshot::default();
        for identity in [
            Identity::Anonymous,
            Identity::SharedBasic {
                username: "ops".into(),
            },
        ] {
            assert!(snapshot.is_admin(&identity));
            assert_eq!(snapshot.permitted_namespaces(&identity), PermittedNamespaces::All);
            assert_eq!(
                snapshot.permission_for(&identity, "x"),
                Some(PermissionLevel::ReadWrite)
            );
        }
    }

    #[test]
    fn test_oidc_role_claims_contribute() {
        let snapshot = RoleSnapshot::build(&[
            role("ml-team", ns(&["vision", "nlp"]), &[], PermissionLevel::ReadOnly),
            role("direct", ns(&["sandbox"]), &["sub-1"], PermissionLevel::ReadWrite),
        ]);
        let identity = Identity::Oidc {
            subject: "sub-1".into(),
            email: None,
            roles: vec!["ml-team".into(), "ns:adhoc".into(), "unknown".into()],
        };

        assert_eq!(
            snapshot.permission_for(&identity, "vision"),
            Some(PermissionLevel::ReadOnly)
        );
        assert_eq!(
            snapshot.permission_for(&identity, "sandbox"),
            Some(PermissionLevel::ReadWrite)
        );
        // A role name alone grants nothing without a stored row
        assert_eq!(snapshot.permission_for(&identity, "adhoc"), None);
        assert_eq!(
            snapshot.permitted_namespaces(&identity),
            PermittedNamespaces::Only(["nlp", "sandbox", "vision"].map(String::from).into())
        );
        assert!(!snapshot.is_admin(&identity));
    }

    #[test]
    fn test_oidc_admin_claim() {
        let snapshot = RoleSnapshot::default();
        let identity = Identity::Oidc {
            subject: "boss".into(),
            email: None,
            roles: vec![ADMIN_ROLE.to_string()],
        };
        assert!(snapshot.is_admin(&identity));
        assert_eq!(snapshot.permitted_namespaces(&identity), PermittedNamespaces::All);
    }

    #[test]
    fn test_users_for_namespace() {
        let snapshot = scenario();
        assert_eq!(snapshot.users_for_namespace("ns2"), vec!["user1", "user2"]);
        assert_eq!(snapshot.users_for_namespace("ns3"), vec!["user2"]);
        assert!(snapshot.users_for_namespace("ns9").is_empty());
    }

    #[cfg(feature = "database-sqlite")]
    #[tokio::test]
    async fn test_revoking_binding_rejects_after_event() {
        let db = create_sqlite_db().await;
        let roles = db.roles();
        roles
            .upsert(UpsertRole {
                name: "ns:ns1".into(),
                grant: ns(&["ns1"]),
                users: vec!["user1".into()],
                permission: PermissionLevel::ReadWrite,
            })
            .await
            .unwrap();

        let tracker = TaskTracker::new();
        let notifier = db.change_notifier(&tracker);
        let cache = CachedRoleRepo::new(db.roles(), notifier.as_ref(), None, &tracker)
            .await
            .unwrap();
        let mut versions = cache.watch_version();
        assert!(cache.permission_for(&user("user1"), "ns1").is_some());

        roles.remove_user("ns:ns1", "user1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), versions.wait_for(|v| *v >= 2))
            .await
            .expect("event did not trigger reload")
            .unwrap();
        assert!(cache.permission_for(&user("user1"), "ns1").is_none());
        assert!(cache.users_for_namespace("ns1").is_empty());
    }
}
