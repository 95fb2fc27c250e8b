//! Integration tests for db-relay.

pub mod common;
pub mod postgres_test;
pub mod runner_test;
pub mod sqlite_test;
pub mod store_test;
