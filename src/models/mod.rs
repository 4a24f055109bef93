mod namespace;
mod role;
mod validators;

pub use namespace::*;
pub use role::*;
pub use validators::NAMESPACE_CODE_REGEX;
