mod namespaces;
mod roles;

pub use namespaces::SqliteNamespaceRepo;
pub use roles::SqliteRoleRepo;
