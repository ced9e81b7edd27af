//! # Connections Module
//!
//! Persistent connections to external stores.

/// PostgreSQL persistence gateway over a `deadpool-postgres` pool.
pub mod db_postgres;

pub use db_postgres::{PgGateway, PgSettings};
