mod namespaces;
mod roles;

pub use namespaces::*;
pub use roles::*;
