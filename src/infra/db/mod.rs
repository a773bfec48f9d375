//! Connection manager: a bounded pool of database connections handed out as
//! leases.
//!
//! A semaphore bounds the number of live leases. Idle connections are reused
//! LIFO; broken connections are dropped and replaced lazily on the next
//! acquire. A lease dropped without [`ConnectionManager::release`] is treated
//! as broken, which covers refreshes cancelled mid-query.

mod mssql;
mod util;

pub use mssql::MssqlConnector;
pub use util::{is_transient_server_code, map_tiberius_error};

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::application::repos::{DbError, PoolStatus, QueryExecutor};
use crate::cache::mutex_lock;
use crate::domain::queries::PreparedQuery;
use crate::domain::table::ResultSet;
use crate::domain::types::SqlValue;

const SOURCE: &str = "infra::db::pool";
const METRIC_POOL_EXHAUSTED: &str = "dashcache_pool_exhausted_total";
const METRIC_POOL_OPENED: &str = "dashcache_pool_connections_opened_total";
const METRIC_POOL_DISCARDED: &str = "dashcache_pool_connections_discarded_total";
const HEALTH_CHECK_SQL: &str = "SELECT 1";

/// An open database session.
#[async_trait]
pub trait DbConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultSet, DbError>;
}

/// Opens new database sessions for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_connections: NonZeroU32,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

impl From<&crate::config::DatabaseSettings> for PoolOptions {
    fn from(settings: &crate::config::DatabaseSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            connect_timeout: Duration::from_secs(u64::from(settings.connect_timeout_seconds.get())),
            statement_timeout: Duration::from_secs(u64::from(
                settings.statement_timeout_seconds.get(),
            )),
        }
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn DbConnection>>>,
    in_use: AtomicU32,
}

impl PoolInner {
    fn discard(&self, reason: &'static str) {
        counter!(METRIC_POOL_DISCARDED, "reason" => reason).increment(1);
        debug!(
            target = "dashcache::infra::db::pool",
            reason, "Discarded pooled connection"
        );
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<PoolInner>,
}

/// A connection borrowed from the pool for one query execution.
pub struct Lease {
    connection: Option<Box<dyn DbConnection>>,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            self.pool.discard("abandoned");
        }
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        let max = options.max_connections.get() as usize;
        Self {
            inner: Arc::new(PoolInner {
                connector,
                options,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(Vec::with_capacity(max)),
                in_use: AtomicU32::new(0),
            }),
        }
    }

    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    /// Borrow a connection, waiting at most the acquire timeout for a free slot.
    pub async fn acquire(&self) -> Result<Lease, DbError> {
        let started_at = Instant::now();
        let permit = match tokio::time::timeout(
            self.inner.options.acquire_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::connection("connection pool is closed")),
            Err(_) => {
                let waited_ms = started_at.elapsed().as_millis() as u64;
                counter!(METRIC_POOL_EXHAUSTED).increment(1);
                warn!(
                    target = "dashcache::infra::db::pool",
                    waited_ms,
                    max_connections = self.inner.options.max_connections.get(),
                    "Connection pool exhausted"
                );
                return Err(DbError::PoolExhausted { waited_ms });
            }
        };

        let reused = mutex_lock(&self.inner.idle, SOURCE, "acquire").pop();
        let connection = match reused {
            Some(connection) => connection,
            None => self.open().await?,
        };

        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(Lease {
            connection: Some(connection),
            broken: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn open(&self) -> Result<Box<dyn DbConnection>, DbError> {
        let timeout = self.inner.options.connect_timeout;
        let connection = tokio::time::timeout(timeout, self.inner.connector.connect())
            .await
            .map_err(|_| {
                DbError::connection(format!(
                    "connect timed out after {} s",
                    timeout.as_secs()
                ))
            })??;
        counter!(METRIC_POOL_OPENED).increment(1);
        debug!(
            target = "dashcache::infra::db::pool",
            "Opened database connection"
        );
        Ok(connection)
    }

    /// Run `sql` on the leased connection within the statement timeout.
    ///
    /// Transient failures and timeouts mark the lease broken so that release
    /// discards it.
    pub async fn execute(
        &self,
        lease: &mut Lease,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ResultSet, DbError> {
        let timeout = self.inner.options.statement_timeout;
        let connection = lease
            .connection
            .as_mut()
            .ok_or_else(|| DbError::connection("lease has no connection"))?;

        match tokio::time::timeout(timeout, connection.execute(sql, params)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                if err.is_transient() {
                    lease.broken = true;
                }
                Err(err)
            }
            Err(_) => {
                lease.broken = true;
                Err(DbError::transient(
                    None,
                    format!("statement exceeded {} s timeout", timeout.as_secs()),
                ))
            }
        }
    }

    /// Return a lease to the pool, or discard its connection if broken.
    pub fn release(&self, mut lease: Lease) {
        let Some(connection) = lease.connection.take() else {
            return;
        };
        if lease.broken {
            self.inner.discard("broken");
        } else {
            mutex_lock(&self.inner.idle, SOURCE, "release").push(connection);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let idle = mutex_lock(&self.inner.idle, SOURCE, "status").len();
        PoolStatus {
            max_connections: self.inner.options.max_connections.get(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            idle: u32::try_from(idle).unwrap_or(u32::MAX),
        }
    }

    /// Stop handing out leases and drop idle connections.
    pub fn close(&self) {
        self.inner.permits.close();
        mutex_lock(&self.inner.idle, SOURCE, "close").clear();
    }
}

#[async_trait]
impl QueryExecutor for ConnectionManager {
    async fn run(&self, query: &PreparedQuery) -> Result<ResultSet, DbError> {
        let mut lease = self.acquire().await?;
        let result = self.execute(&mut lease, &query.sql, &query.values).await;
        self.release(lease);
        result
    }

    async fn health_check(&self) -> Result<(), DbError> {
        let mut lease = self.acquire().await?;
        let result = self.execute(&mut lease, HEALTH_CHECK_SQL, &[]).await;
        self.release(lease);
        result.map(|_| ())
    }

    fn pool_status(&self) -> PoolStatus {
        self.status()
    }
}
