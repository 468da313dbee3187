//! Parley Database Crate
//!
//! SQLite persistence for the relay's collaborators: the offline envelope store and
//! the room membership directory. Connection setup and embedded migrations live
//! here as well.

use parley_config::DatabaseConfig;
use sqlx::SqlitePool;

pub mod connection;
pub mod error;
pub mod migrations;
pub mod repos;

pub use connection::prepare_database;
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::run_migrations;
pub use repos::{EnvelopeRepository, RoomRepository, StoredEnvelope};

/// Open the pool and bring the schema up to date.
pub async fn initialize_database(config: &DatabaseConfig) -> DatabaseResult<SqlitePool> {
    let pool = prepare_database(config)
        .await
        .map_err(|e| DatabaseError::ConnectionError(format!("{e:#}")))?;

    run_migrations(&pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("{e:#}")))?;

    Ok(pool)
}
