mod namespaces;

pub use namespaces::{NamespaceError, NamespaceService};
