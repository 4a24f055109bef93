//! Router-level tests and the fixtures they share with module tests.

#[cfg(feature = "database-sqlite")]
mod namespace_access;
