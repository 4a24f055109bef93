mod namespaces;
mod roles;

pub use namespaces::PostgresNamespaceRepo;
pub use roles::PostgresRoleRepo;
