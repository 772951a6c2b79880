//! PostgreSQL / Redshift backend
//!
//! Event values arrive loosely typed (a timestamp may be a string, a number
//! may target a text column), so parameters go through [`PgParam`], which
//! accepts every server type and converts the value to whatever the prepared
//! statement asks for.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, Kind, ToSql, Type};
use tracing::{debug, error};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DestinationType, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// A bound parameter that adapts to the column type chosen by the server
#[derive(Debug)]
pub struct PgParam<'a>(pub &'a Value);

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot convert {value:?} to {ty}").into()
}

fn parse_timestamp_tz(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::DateTimeTz(dt) => Some(*dt),
        Value::DateTime(dt) => Some(dt.and_utc()),
        Value::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive_timestamp(s).map(|dt| dt.and_utc())),
        _ => None,
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Json(j) => j.clone(),
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int16(n) => serde_json::Value::from(*n),
        Value::Int32(n) => serde_json::Value::from(*n),
        Value::Int64(n) => serde_json::Value::from(*n),
        Value::Float64(f) => serde_json::Value::from(*f),
        other => serde_json::Value::String(other.to_string()),
    }
}

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let value = self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }
        if let Kind::Domain(base) = ty.kind() {
            return self.to_sql(base, out);
        }

        match *ty {
            Type::BOOL => value.as_bool().ok_or_else(|| mismatch(value, ty))?.to_sql(ty, out),
            Type::INT2 => value
                .as_i64()
                .and_then(|n| i16::try_from(n).ok())
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::INT4 => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::INT8 => value.as_i64().ok_or_else(|| mismatch(value, ty))?.to_sql(ty, out),
            Type::FLOAT4 => (value.as_f64().ok_or_else(|| mismatch(value, ty))? as f32).to_sql(ty, out),
            Type::FLOAT8 => value.as_f64().ok_or_else(|| mismatch(value, ty))?.to_sql(ty, out),
            Type::NUMERIC => {
                let decimal = match value {
                    Value::Decimal(d) => Some(*d),
                    Value::Int16(n) => Some(Decimal::from(*n)),
                    Value::Int32(n) => Some(Decimal::from(*n)),
                    Value::Int64(n) => Some(Decimal::from(*n)),
                    Value::Float64(f) => Decimal::try_from(*f).ok(),
                    Value::String(s) => Decimal::from_str(s.trim()).ok(),
                    _ => None,
                };
                decimal.ok_or_else(|| mismatch(value, ty))?.to_sql(ty, out)
            }
            Type::TIMESTAMPTZ => parse_timestamp_tz(value)
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::TIMESTAMP => parse_timestamp_tz(value)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::DATE => match value {
                Value::Date(d) => d.to_sql(ty, out),
                Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|_| mismatch(value, ty))?
                    .to_sql(ty, out),
                other => parse_timestamp_tz(other)
                    .map(|dt| dt.date_naive())
                    .ok_or_else(|| mismatch(value, ty))?
                    .to_sql(ty, out),
            },
            Type::TIME => match value {
                Value::Time(t) => t.to_sql(ty, out),
                Value::String(s) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .map_err(|_| mismatch(value, ty))?
                    .to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Type::UUID => match value {
                Value::Uuid(u) => u.to_sql(ty, out),
                Value::String(s) => uuid::Uuid::parse_str(s)
                    .map_err(|_| mismatch(value, ty))?
                    .to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Type::JSON | Type::JSONB => to_json(value).to_sql(ty, out),
            Type::BYTEA => match value {
                Value::Bytes(b) => b.to_sql(ty, out),
                other => other.to_string().into_bytes().to_sql(ty, out),
            },
            // Text and anything else travels as its string form
            _ => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Json(j) => j.to_string(),
                    other => other.to_string(),
                };
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn pg_error(e: tokio_postgres::Error) -> Error {
    let message = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    Error::Query {
        message,
        sql: None,
        source: Some(Box::new(e)),
    }
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
        row: &'a tokio_postgres::Row,
        idx: usize,
        wrap: impl FnOnce(T) -> Value,
    ) -> Value {
        row.try_get::<_, Option<T>>(idx)
            .ok()
            .flatten()
            .map(wrap)
            .unwrap_or(Value::Null)
    }

    match *pg_type {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get(row, idx, Value::Int16),
        Type::INT4 => get(row, idx, Value::Int32),
        Type::INT8 => get(row, idx, Value::Int64),
        Type::FLOAT4 => get(row, idx, |f: f32| Value::Float64(f64::from(f))),
        Type::FLOAT8 => get(row, idx, Value::Float64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeTz),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        _ => get(row, idx, Value::String),
    }
}

fn bind(params: &[Value]) -> Vec<PgParam<'_>> {
    params.iter().map(PgParam).collect()
}

fn refs<'a>(params: &'a [PgParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// PostgreSQL protocol connection
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

async fn run_query(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let bound = bind(params);
    let rows = client.query(sql, &refs(&bound)).await.map_err(pg_error)?;
    Ok(rows.iter().map(pg_row_to_row).collect())
}

async fn run_execute(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<u64> {
    if params.is_empty() {
        // DDL and other parameterless statements skip the prepare round trip
        client.batch_execute(sql).await.map_err(pg_error)?;
        return Ok(0);
    }
    let bound = bind(params);
    client.execute(sql, &refs(&bound)).await.map_err(pg_error)
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.check_open()?;
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.check_open()?;
        run_execute(&self.client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.check_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL protocol transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
}

impl PgTransaction {
    async fn finish(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

/// Connection factory for PostgreSQL and Redshift
pub struct PgConnectionFactory {
    destination: DestinationType,
    tls: bool,
}

impl PgConnectionFactory {
    /// Factory for the given PostgreSQL-protocol destination
    pub fn new(destination: DestinationType) -> Self {
        Self {
            destination,
            tls: false,
        }
    }

    /// Connect over TLS
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config = tokio_postgres::Config::from_str(&config.url)
            .map_err(|e| Error::config(format!("invalid connection url: {e}")))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let destination = self.destination;
        let client = if self.tls {
            connect_tls(&pg_config).await?
        } else {
            let (client, connection) = pg_config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| Error::connection_with_source(format!("failed to connect to {destination}"), e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(%destination, error = %e, "connection error");
                }
            });
            client
        };

        debug!(%destination, url = %crate::connection::redact_url(&config.url), "connected");
        Ok(Box::new(PgConnection::new(client)))
    }

    fn destination_type(&self) -> DestinationType {
        self.destination
    }
}

#[cfg(feature = "tls")]
async fn connect_tls(pg_config: &tokio_postgres::Config) -> Result<tokio_postgres::Client> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    let (client, connection) = pg_config
        .connect(tls)
        .await
        .map_err(|e| Error::connection_with_source("failed to connect with TLS", e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "TLS connection error");
        }
    });
    Ok(client)
}

#[cfg(not(feature = "tls"))]
async fn connect_tls(_pg_config: &tokio_postgres::Config) -> Result<tokio_postgres::Client> {
    Err(Error::config(
        "ssl_mode other than 'disable' requires the 'tls' feature",
    ))
}
