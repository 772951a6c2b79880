//! Connection pool for rivven-loader
//!
//! Adapters check out one connection per operation, so concurrent batch
//! uploads to the same destination never share a transaction. The pool
//! bounds concurrency with a semaphore, recycles idle or expired
//! connections and validates connections on borrow.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_loader::pool::{PoolConfig, SimpleConnectionPool};
//! use rivven_loader::backend::postgres::PgConnectionFactory;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(10),
//!     Arc::new(PgConnectionFactory::new(DestinationType::Postgres)),
//! ).await?;
//!
//! let conn = pool.get().await?;
//! conn.execute("SELECT 1", &[]).await?;
//! // Connection is returned to pool when dropped
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Checkout and return of destination connections
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Borrow a connection, waiting up to the acquire timeout
    async fn get(&self) -> Result<PooledConnection>;

    /// Hand a borrowed connection back; called from [`PooledConnection`]'s drop
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant);

    /// Close a borrowed connection whose session state is unknown, freeing its slot
    async fn discard_connection(&self, conn: Box<dyn Connection>);

    /// Open connections, borrowed or idle
    fn size(&self) -> usize;

    /// Counter snapshot
    fn stats(&self) -> PoolStats;

    /// Close idle connections and refuse further checkouts
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool; returned on drop, or closed when
/// marked for discard
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    created_at: Instant,
    pool: Arc<dyn ConnectionPool>,
    discard: bool,
}

impl PooledConnection {
    /// Wrap a connection checked out of `pool`
    pub fn new(conn: Box<dyn Connection>, created_at: Instant, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn,
            created_at,
            pool,
            discard: false,
        }
    }

    /// Close the connection on drop instead of returning it to the pool.
    ///
    /// Used while a transaction is in flight: a session left inside an open
    /// transaction must never be handed to the next caller.
    pub fn set_discard(&mut self, discard: bool) {
        self.discard = discard;
    }

    /// Whether the connection will be closed on drop
    pub fn is_discarded(&self) -> bool {
        self.discard
    }

    /// Borrowed driver connection
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = std::mem::replace(&mut self.conn, Box::new(Detached));
        let pool = self.pool.clone();
        let created_at = self.created_at;
        if self.discard {
            tokio::spawn(async move {
                pool.discard_connection(conn).await;
            });
        } else {
            tokio::spawn(async move {
                pool.return_connection(conn, created_at).await;
            });
        }
    }
}

/// Placeholder left behind in a dropped [`PooledConnection`]
struct Detached;

#[async_trait]
impl Connection for Detached {
    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(Error::connection("connection already returned to pool"))
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Err(Error::connection("connection already returned to pool"))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Err(Error::connection("connection already returned to pool"))
    }

    async fn is_valid(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sizing and recycling of a destination pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Where connections go
    pub connection: ConnectionConfig,
    /// Connections opened when the pool starts
    pub min_size: usize,
    /// Upper bound on open connections
    pub max_size: usize,
    /// How long a checkout waits for a free slot
    pub acquire_timeout: Duration,
    /// Age after which a connection is closed instead of reused
    pub max_lifetime: Duration,
    /// Idle time after which a connection is closed instead of reused
    pub idle_timeout: Duration,
    /// Run the driver's validity check before handing out an idle connection
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Defaults for a destination URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Defaults for a prepared connection config
    pub fn from_connection(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Connections opened at startup
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Upper bound on open connections
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Checkout wait
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Recycle age
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Recycle idle time
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Toggle the validity check on checkout
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Monotonic pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections opened by the factory
    pub connections_created: u64,
    /// Connections closed for age, idleness, failed checks or shutdown
    pub connections_closed: u64,
    /// Successful checkouts
    pub acquisitions: u64,
    /// Checkouts that timed out waiting for a slot
    pub exhausted_count: u64,
    /// Idle connections discarded by the validity check
    pub health_check_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Semaphore-bounded connection pool.
///
/// Idle connections are reused LIFO. Expired connections are closed on
/// checkout, and a permit is held for every checked-out connection until it
/// comes back.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Semaphore,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
    self_ref: OnceCell<Weak<Self>>,
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl SimpleConnectionPool {
    /// Create a new connection pool, opening `min_size` connections eagerly.
    ///
    /// Warm-up failures are logged, not returned; the first checkout reports
    /// the connection error instead.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Arc::new(Self {
            semaphore: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            shutdown: AtomicBool::new(false),
            self_ref: OnceCell::new(),
        });

        let _ = pool.self_ref.set(Arc::downgrade(&pool));

        for _ in 0..pool.config.min_size.min(pool.config.max_size) {
            match pool.create_connection().await {
                Ok(conn) => {
                    let now = Instant::now();
                    pool.idle.lock().await.push(PoolEntry {
                        conn,
                        created_at: now,
                        last_used: now,
                    });
                }
                Err(e) => {
                    warn!(destination = %pool.factory.destination_type(), error = %e, "pool warm-up connection failed");
                    break;
                }
            }
        }

        Ok(pool)
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats
            .connections_created
            .fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn record_closed(&self) {
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is shut down".to_string(),
            });
        }

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                self.stats.exhausted_count.fetch_add(1, Ordering::Relaxed);
                Error::PoolExhausted {
                    message: format!(
                        "timeout waiting for connection ({}ms)",
                        self.config.acquire_timeout.as_millis()
                    ),
                }
            })?
            .map_err(|_| Error::PoolExhausted {
                message: "pool semaphore closed".to_string(),
            })?;

        let reused = {
            let mut idle = self.idle.lock().await;
            loop {
                let Some(entry) = idle.pop() else {
                    break None;
                };
                if self.should_recycle(&entry) {
                    debug!("recycling expired pooled connection");
                    let _ = entry.conn.close().await;
                    self.record_closed();
                    continue;
                }
                if self.config.test_on_borrow && !entry.conn.is_valid().await {
                    self.record_closed();
                    self.stats
                        .health_check_failures
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                break Some((entry.conn, entry.created_at));
            }
        };

        let (conn, created_at) = match reused {
            Some(found) => found,
            None => (self.create_connection().await?, Instant::now()),
        };

        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);

        let pool: Arc<dyn ConnectionPool> = match self.self_ref.get().and_then(Weak::upgrade) {
            Some(pool) => pool as Arc<dyn ConnectionPool>,
            None => {
                return Err(Error::PoolExhausted {
                    message: "pool has been dropped".to_string(),
                })
            }
        };

        // Released again in return_connection
        permit.forget();
        Ok(PooledConnection::new(conn, created_at, pool))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        self.semaphore.add_permits(1);

        if self.shutdown.load(Ordering::Acquire) {
            let _ = conn.close().await;
            self.record_closed();
            return;
        }

        self.idle.lock().await.push(PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        });
    }

    async fn discard_connection(&self, conn: Box<dyn Connection>) {
        debug!(destination = %self.factory.destination_type(), "closing discarded connection");
        if let Err(e) = conn.close().await {
            debug!(error = %e, "discarded connection did not close cleanly");
        }
        self.record_closed();
        self.semaphore.add_permits(1);
    }

    fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            let _ = entry.conn.close().await;
            self.record_closed();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DestinationType;

    struct NoopConnection;

    #[async_trait]
    impl Connection for NoopConnection {
        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }
        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(Error::unsupported("no transactions"))
        }
        async fn is_valid(&self) -> bool {
            true
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopFactory;

    #[async_trait]
    impl ConnectionFactory for NoopFactory {
        async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
            Ok(Box::new(NoopConnection))
        }
        fn destination_type(&self) -> DestinationType {
            DestinationType::Postgres
        }
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("postgres://localhost/test")
            .with_min_size(5)
            .with_max_size(20)
            .with_acquire_timeout(Duration::from_secs(10))
            .with_test_on_borrow(false);

        assert_eq!(config.min_size, 5);
        assert_eq!(config.max_size, 20);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert!(!config.test_on_borrow);
    }

    #[tokio::test]
    async fn test_pool_reuses_returned_connection() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::new("noop://").with_min_size(1).with_max_size(2),
            Arc::new(NoopFactory),
        )
        .await
        .unwrap();
        assert_eq!(pool.size(), 1);

        {
            let conn = pool.get().await.unwrap();
            assert_eq!(conn.execute("SELECT 1", &[]).await.unwrap(), 0);
        }
        // Let the drop task hand the connection back
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.stats().acquisitions, 2);
        assert_eq!(pool.stats().connections_created, 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::new("noop://")
                .with_min_size(0)
                .with_max_size(1)
                .with_acquire_timeout(Duration::from_millis(20)),
            Arc::new(NoopFactory),
        )
        .await
        .unwrap();

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.err().unwrap();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(err.is_retriable());
        assert_eq!(pool.stats().exhausted_count, 1);
    }

    #[tokio::test]
    async fn test_discarded_connection_is_closed_not_reused() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::new("noop://").with_min_size(1).with_max_size(1),
            Arc::new(NoopFactory),
        )
        .await
        .unwrap();

        {
            let mut conn = pool.get().await.unwrap();
            conn.set_discard(true);
            assert!(conn.is_discarded());
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().connections_closed, 1);

        // The slot is free again and a fresh connection is opened
        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.stats().connections_created, 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_checkout() {
        let pool = SimpleConnectionPool::new(PoolConfig::new("noop://"), Arc::new(NoopFactory))
            .await
            .unwrap();
        pool.close().await.unwrap();
        assert!(pool.get().await.is_err());
        assert_eq!(pool.size(), 0);
    }
}
