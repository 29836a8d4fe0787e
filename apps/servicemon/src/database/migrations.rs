use anyhow::{Context, Result};
use libsql::Connection;
use tracing::{debug, info};

/// One schema step; statements run in a single transaction together with
/// the bookkeeping row.
struct Migration {
    version: i32,
    description: &'static str,
    statements: &'static [&'static str],
}

/// In a full deployment the inventory and event tables are owned by the
/// management system; these only create what is missing so an embedded
/// datastore is usable on its own.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Inventory tables: netbox, service, serviceproperty",
        statements: &[
            "CREATE TABLE IF NOT EXISTS netbox (
                netboxid INTEGER PRIMARY KEY AUTOINCREMENT,
                deviceid INTEGER,
                ip TEXT NOT NULL,
                sysname TEXT NOT NULL,
                up TEXT NOT NULL DEFAULT 'y'
            )",
            "CREATE TABLE IF NOT EXISTS service (
                serviceid INTEGER PRIMARY KEY AUTOINCREMENT,
                netboxid INTEGER NOT NULL REFERENCES netbox(netboxid) ON DELETE CASCADE,
                active INTEGER NOT NULL DEFAULT 1,
                handler TEXT NOT NULL,
                version TEXT,
                up TEXT NOT NULL DEFAULT 'y'
            )",
            "CREATE TABLE IF NOT EXISTS serviceproperty (
                serviceid INTEGER NOT NULL REFERENCES service(serviceid) ON DELETE CASCADE,
                property TEXT NOT NULL,
                value TEXT,
                PRIMARY KEY (serviceid, property)
            )",
            "CREATE INDEX IF NOT EXISTS idx_service_netboxid ON service(netboxid)",
        ],
    },
    Migration {
        version: 2,
        description: "Event queue tables: eventq, eventqvar",
        statements: &[
            "CREATE TABLE IF NOT EXISTS eventq (
                eventqid INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                deviceid INTEGER,
                netboxid INTEGER,
                subid INTEGER,
                time TEXT NOT NULL,
                eventtypeid TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'x',
                value INTEGER NOT NULL DEFAULT 100,
                severity INTEGER NOT NULL DEFAULT 50
            )",
            "CREATE TABLE IF NOT EXISTS eventqvar (
                eventqid INTEGER NOT NULL REFERENCES eventq(eventqid) ON DELETE CASCADE,
                var TEXT NOT NULL,
                val TEXT NOT NULL,
                PRIMARY KEY (eventqid, var)
            )",
            "CREATE INDEX IF NOT EXISTS idx_eventq_target ON eventq(target)",
        ],
    },
];

/// Bring the schema up to the newest migration
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!("Datastore schema is current (version {})", current);
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration)
            .await
            .with_context(|| format!("migration v{} ({})", migration.version, migration.description))?;
        info!("Applied migration v{}: {}", migration.version, migration.description);
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction().await?;
    for statement in migration.statements {
        tx.execute(statement, ()).await?;
    }
    tx.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
        libsql::params![migration.version, chrono::Utc::now().timestamp(), migration.description],
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Highest applied migration, 0 for a fresh datastore
async fn schema_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ()).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i32>(0)?),
        None => Ok(0),
    }
}
