//! Integration tests for db-relay.
//!
//! SQLite and object-store tests run everywhere. PostgreSQL tests need a
//! running server: set DATABASE_URL to run them.
//!
//! Run with: `cargo test --test integration_tests`

mod integration;
