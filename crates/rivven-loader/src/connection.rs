//! Connection traits for rivven-loader
//!
//! Core abstractions for destination connectivity:
//! - Connection: statement execution outside a transaction
//! - Transaction: statements that commit or roll back together
//! - ConnectionFactory: opens connections for the pool

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Row, Value};

/// A connection to a destination
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement, returns affected row count when known
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Cheap liveness probe used on pool checkout
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A destination transaction
///
/// `commit` and `rollback` consume the transaction, so it is closed at most
/// once.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement within the transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Where and how a factory opens connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Destination URL; the password is redacted in `Debug`
    pub url: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Reported to servers that track client names (pg_stat_activity)
    pub application_name: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &redact_url(&self.url))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Replace the password of a URL with `***`; unparseable URLs are hidden.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            application_name: Some("rivven-loader".into()),
        }
    }
}

impl ConnectionConfig {
    /// Defaults for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

/// Opens connections to one destination type
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Destination this factory connects to
    fn destination_type(&self) -> DestinationType;
}

/// Destination type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationType {
    /// PostgreSQL
    Postgres,
    /// Amazon Redshift
    Redshift,
    /// MySQL
    MySql,
    /// ClickHouse
    ClickHouse,
    /// Snowflake
    Snowflake,
}

impl std::fmt::Display for DestinationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "PostgreSQL"),
            Self::Redshift => write!(f, "Redshift"),
            Self::MySql => write!(f, "MySQL"),
            Self::ClickHouse => write!(f, "ClickHouse"),
            Self::Snowflake => write!(f, "Snowflake"),
        }
    }
}
