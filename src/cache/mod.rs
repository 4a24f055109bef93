//! Process-wide caches of the namespace and role stores.
//!
//! Both caches serve every lookup from memory and reload their whole table when the
//! change notifier reports a write, or when the periodic resync fires.

mod error;
mod namespaces;
mod roles;
mod snapshot;

pub use error::{CacheError, CacheResult};
pub use namespaces::{CachedNamespaceRepo, NamespaceSnapshot};
pub use roles::{CachedRoleRepo, PermittedNamespaces, RoleSnapshot};
pub use snapshot::{SnapshotCache, SnapshotSource, Versioned};
