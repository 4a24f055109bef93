//! Shared database repository test infrastructure
//!
//! The same test logic runs against both SQLite and PostgreSQL implementations:
//!
//! - **Unit tests (SQLite)**: Fast, in-memory tests that run with every `cargo test`
//! - **Integration tests (PostgreSQL)**: Slower tests using testcontainers, run with `cargo test -- --ignored`
//!
//! Each repository has a test module containing shared test functions that take
//! `&dyn XxxRepo`, plus one `sqlite_test!` and one `postgres_test!` instantiation per
//! function.
//!
//! ```bash
//! cargo test                       # Run fast SQLite tests only
//! cargo test -- --ignored          # Run PostgreSQL integration tests (requires Docker)
//! cargo test -- --include-ignored  # Run all tests
//! ```
