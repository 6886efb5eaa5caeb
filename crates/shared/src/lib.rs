//! SchoolPay shared infrastructure
//!
//! Database pool construction and embedded migrations used by the API
//! server and the background worker.

pub mod db;

pub use db::{create_migration_pool, create_pool, run_migrations, DbError};
