use deadpool::managed::{self, Object, Pool, RecycleError, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};
use tracing::debug;

/// Hands out libsql connections, probing each one before reuse.
pub struct LibsqlManager {
    database: Database,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        debug!("Opened datastore connection");
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        // A connection that cannot answer this is closed and replaced by the pool.
        let mut rows = conn.query("SELECT 1", ()).await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(RecycleError::Message("liveness probe returned no rows".into())),
        }
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Pool of exactly one connection: holding the object is holding the cursor.
pub fn single_connection_pool(database: Database) -> Result<LibsqlPool, managed::BuildError> {
    Pool::builder(LibsqlManager::new(database)).max_size(1).build()
}

/// Remove a connection from the pool so the next checkout opens a fresh one.
pub fn discard(conn: Object<LibsqlManager>) {
    drop(Object::take(conn));
    debug!("Discarded datastore connection");
}
