//! ClickHouse backend over the HTTP interface
//!
//! Parameters are rendered into the statement as escaped literals and reads
//! come back as `JSONEachRow`. ClickHouse has no multi-statement
//! transactions: a [`ClickHouseTransaction`] runs every statement as soon as
//! it is issued, and commit and rollback are no-ops. Writes are therefore not
//! atomic on this destination.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::SensitiveString;
use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DestinationType, Transaction};
use crate::error::{Error, Result};
use crate::security::{inline_params, LiteralStyle};
use crate::types::{Row, Value};

const LITERALS: LiteralStyle = LiteralStyle {
    bool_as_int: true,
    backslash_escapes: true,
};

/// HTTP session settings shared by connections of one factory
#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    database: String,
    user: String,
    password: Option<SensitiveString>,
}

/// ClickHouse HTTP connection
pub struct ClickHouseConnection {
    client: reqwest::Client,
    endpoint: Arc<Endpoint>,
}

impl ClickHouseConnection {
    async fn post(&self, sql: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.endpoint.url)
            .query(&[("database", self.endpoint.database.as_str())])
            .header("X-ClickHouse-User", &self.endpoint.user)
            .body(sql.to_string());
        if let Some(password) = &self.endpoint.password {
            request = request.header("X-ClickHouse-Key", password.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::connection_with_source("ClickHouse request failed", e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::connection_with_source("failed to read ClickHouse response", e))?;

        if !status.is_success() {
            return Err(Error::Query {
                message: body.trim().to_string(),
                sql: None,
                source: None,
            });
        }
        Ok(body)
    }

    async fn run_execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = inline_params(sql, params, LITERALS)?;
        self.post(&sql).await?;
        Ok(0)
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = inline_params(sql, params, LITERALS)?;
        let body = self.post(&format!("{sql} FORMAT JSONEachRow")).await?;
        parse_json_each_row(&body)
    }
}

fn json_to_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int64(i),
            None => n.as_f64().map(Value::Float64).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::String(s),
        other => Value::Json(other),
    }
}

fn parse_json_each_row(body: &str) -> Result<Vec<Row>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
                .map_err(|e| Error::type_conversion(format!("invalid JSONEachRow line: {e}")))?;
            let (columns, values): (Vec<String>, Vec<Value>) = object
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .unzip();
            Ok(Row::new(columns, values))
        })
        .collect()
}

#[async_trait]
impl Connection for ClickHouseConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run_query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run_execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(ClickHouseTransaction {
            conn: ClickHouseConnection {
                client: self.client.clone(),
                endpoint: Arc::clone(&self.endpoint),
            },
        }))
    }

    async fn is_valid(&self) -> bool {
        self.post("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Statements run immediately; there is nothing to commit or undo
pub struct ClickHouseTransaction {
    conn: ClickHouseConnection,
}

#[async_trait]
impl Transaction for ClickHouseTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.conn.run_query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.conn.run_execute(sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("ClickHouse has no transactions; rollback leaves executed statements in place");
        Ok(())
    }
}

/// Connection factory for ClickHouse
pub struct ClickHouseConnectionFactory {
    database: String,
    user: String,
    password: Option<SensitiveString>,
}

impl ClickHouseConnectionFactory {
    /// Factory authenticating as `user` against `database`
    pub fn new(database: impl Into<String>, user: impl Into<String>, password: Option<SensitiveString>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
            password,
        }
    }
}

#[async_trait]
impl ConnectionFactory for ClickHouseConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::connection_with_source("failed to build HTTP client", e))?;

        let conn = ClickHouseConnection {
            client,
            endpoint: Arc::new(Endpoint {
                url: config.url.clone(),
                database: self.database.clone(),
                user: self.user.clone(),
                password: self.password.clone(),
            }),
        };
        conn.post("SELECT 1").await?;

        debug!(url = %config.url, database = %self.database, "connected");
        Ok(Box::new(conn))
    }

    fn destination_type(&self) -> DestinationType {
        DestinationType::ClickHouse
    }
}
