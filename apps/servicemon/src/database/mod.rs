/// Datastore access layer
///
/// Every read of checker configuration and every event write goes through
/// the gateway, which owns the single datastore connection. Events reach it
/// through the writer's queue.
pub mod gateway;
pub mod migrations;
pub mod models;
pub mod writer;

pub use gateway::{Datastore, DatastoreGateway};
pub use writer::{EventWriter, WriterConfig};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
