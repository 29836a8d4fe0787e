use async_trait::async_trait;
use libsql::{Connection, Row, params};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::models::{ACCEPTED_SOURCES, CheckerSpec, Event, EventKind};
use crate::error::DatastoreError;
use crate::monitoring::types::ServiceStatus;
use crate::pool::{self, LibsqlPool};

/// Everything the monitor needs from the datastore
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Load every service joined with its node and properties.
    ///
    /// Never fails: when the datastore cannot be read the last successful
    /// result is returned instead. With `force_full_refresh` the persisted
    /// `up` flag seeds each service's status; otherwise it starts unknown.
    async fn fetch_checker_specs(&self, force_full_refresh: bool) -> Vec<CheckerSpec>;

    /// Whether the most recent statement reached the datastore.
    fn is_reachable(&self) -> bool;

    /// Persist one event in its own transaction.
    async fn commit_event(&self, event: &Event) -> Result<(), DatastoreError>;
}

const PROPERTIES_QUERY: &str =
    "SELECT serviceid, property, value FROM serviceproperty ORDER BY serviceid";

const SERVICES_QUERY: &str = "SELECT service.serviceid, service.netboxid, netbox.deviceid, \
     service.active, service.handler, service.version, netbox.ip, netbox.sysname, service.up \
     FROM service JOIN netbox ON service.netboxid = netbox.netboxid ORDER BY service.serviceid";

/// libsql-backed gateway; all statements share one pooled connection
pub struct DatastoreGateway {
    pool: LibsqlPool,
    cache: Mutex<Vec<CheckerSpec>>,
    reachable: AtomicBool,
}

impl DatastoreGateway {
    /// Open (or create) the datastore file and bring its schema up to date
    pub async fn open(path: &Path) -> Result<Self, DatastoreError> {
        let database =
            libsql::Builder::new_local(path).build().await.map_err(DatastoreError::Open)?;
        let pool = pool::single_connection_pool(database)
            .map_err(|e| DatastoreError::Pool(e.to_string()))?;

        {
            let conn = pool.get().await.map_err(|e| DatastoreError::Connection(e.to_string()))?;
            super::initialize_database(&conn).await.map_err(DatastoreError::Migration)?;
        }

        info!("Datastore ready at {}", path.display());
        Ok(Self::new_from_pool(pool))
    }

    /// Create a gateway over an existing pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool, cache: Mutex::new(Vec::new()), reachable: AtomicBool::new(false) }
    }

    /// Run `op` on the connection, reconnecting and retrying it once on failure.
    ///
    /// The pool holds a single connection, so the checkout serializes every
    /// caller for the whole duration of `op`.
    async fn run<T, F, Fut>(&self, context: &'static str, op: F) -> Result<T, DatastoreError>
    where
        F: Fn(Connection) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, libsql::Error>> + Send,
        T: Send,
    {
        let conn = self.checkout().await?;
        let err = match op((*conn).clone()).await {
            Ok(value) => {
                self.reachable.store(true, Ordering::Relaxed);
                return Ok(value);
            }
            Err(err) => err,
        };

        warn!("{} failed ({}), reconnecting to datastore", context, err);
        pool::discard(conn);

        let conn = self.checkout().await?;
        match op((*conn).clone()).await {
            Ok(value) => {
                info!("Successfully reconnected to datastore");
                self.reachable.store(true, Ordering::Relaxed);
                Ok(value)
            }
            Err(source) => {
                self.reachable.store(false, Ordering::Relaxed);
                pool::discard(conn);
                Err(DatastoreError::Query { context, source })
            }
        }
    }

    async fn checkout(&self) -> Result<deadpool::managed::Object<pool::LibsqlManager>, DatastoreError> {
        self.pool.get().await.map_err(|e| {
            self.reachable.store(false, Ordering::Relaxed);
            DatastoreError::Connection(e.to_string())
        })
    }

    async fn load_checker_specs(&self, use_db_status: bool) -> Result<Vec<CheckerSpec>, DatastoreError> {
        let properties = self
            .run("load service properties", |conn| async move {
                let mut rows = conn.query(PROPERTIES_QUERY, ()).await?;
                let mut properties: HashMap<i64, HashMap<String, String>> = HashMap::new();
                while let Some(row) = rows.next().await? {
                    let service_id: i64 = row.get(0)?;
                    let property: String = row.get(1)?;
                    let value: Option<String> = row.get(2)?;
                    if let Some(value) = value.filter(|v| !v.is_empty()) {
                        properties.entry(service_id).or_default().insert(property, value);
                    }
                }
                Ok(properties)
            })
            .await?;

        let rows = self
            .run("load services", |conn| async move {
                let mut rows = conn.query(SERVICES_QUERY, ()).await?;
                let mut services = Vec::new();
                while let Some(row) = rows.next().await? {
                    services.push(ServiceRow::from_row(&row)?);
                }
                Ok(services)
            })
            .await?;

        let mut specs = Vec::with_capacity(rows.len());
        for row in rows {
            let ip: IpAddr = match row.ip.trim().parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("Invalid checker {}: unparseable address {:?}", row.service_id, row.ip);
                    continue;
                }
            };
            specs.push(CheckerSpec {
                id: row.service_id,
                netbox_id: row.netbox_id,
                device_id: row.device_id,
                ip,
                sysname: row.sysname,
                handler: row.handler,
                args: properties.get(&row.service_id).cloned().unwrap_or_default(),
                status: if use_db_status {
                    ServiceStatus::from_db_flag(&row.up)
                } else {
                    ServiceStatus::Unknown
                },
                version: row.version.filter(|v| !v.is_empty()),
                active: row.active != 0,
            });
        }
        Ok(specs)
    }
}

/// Raw `service JOIN netbox` row
struct ServiceRow {
    service_id: i64,
    netbox_id: i64,
    device_id: Option<i64>,
    active: i64,
    handler: String,
    version: Option<String>,
    ip: String,
    sysname: String,
    up: String,
}

impl ServiceRow {
    fn from_row(row: &Row) -> Result<Self, libsql::Error> {
        Ok(Self {
            service_id: row.get(0)?,
            netbox_id: row.get(1)?,
            device_id: row.get(2)?,
            active: row.get(3)?,
            handler: row.get(4)?,
            version: row.get(5)?,
            ip: row.get(6)?,
            sysname: row.get(7)?,
            up: row.get(8)?,
        })
    }
}

#[async_trait]
impl Datastore for DatastoreGateway {
    async fn fetch_checker_specs(&self, force_full_refresh: bool) -> Vec<CheckerSpec> {
        match self.load_checker_specs(force_full_refresh).await {
            Ok(specs) => {
                debug!("Returned {} checkers", specs.len());
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                *cache = specs.clone();
                specs
            }
            Err(err) => {
                let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                warn!("Could not refresh checkers, reusing {} cached: {}", cache.len(), err);
                cache.clone()
            }
        }
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    async fn commit_event(&self, event: &Event) -> Result<(), DatastoreError> {
        if !ACCEPTED_SOURCES.contains(&event.source.as_str()) {
            warn!("Invalid source for event, discarding: {}", event);
            return Ok(());
        }

        match &event.kind {
            EventKind::Version { version } => {
                self.run("update service version", |conn| async move {
                    conn.execute(
                        "UPDATE service SET version = ?1 WHERE serviceid = ?2",
                        params![version.as_str(), event.service_id],
                    )
                    .await?;
                    Ok(())
                })
                .await
            }
            EventKind::ServiceState { status } => {
                let status = *status;
                let event_id = self
                    .run("commit state event", |conn| async move {
                        let tx = conn.transaction().await?;
                        tx.execute(
                            "INSERT INTO eventq (source, target, deviceid, netboxid, subid, time, \
                             eventtypeid, state, value) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                            params![
                                event.source.as_str(),
                                event.target.as_str(),
                                event.device_id,
                                event.netbox_id,
                                event.service_id,
                                event.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                                event.event_type(),
                                event.state_code(),
                                event.value()
                            ],
                        )
                        .await?;
                        let event_id = tx.last_insert_rowid();
                        tx.execute(
                            "INSERT INTO eventqvar (eventqid, var, val) VALUES (?1, 'descr', ?2)",
                            params![event_id, event.info.as_str()],
                        )
                        .await?;
                        tx.execute(
                            "UPDATE service SET up = ?1 WHERE serviceid = ?2",
                            params![status.db_flag(), event.service_id],
                        )
                        .await?;
                        tx.commit().await?;
                        Ok(event_id)
                    })
                    .await?;
                debug!("Committed event {}: {}", event_id, event);
                Ok(())
            }
        }
    }
}
