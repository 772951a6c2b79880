//! Snowflake backend over the SQL API v2 with key-pair authentication
//!
//! # Authentication
//!
//! Requests carry a JWT signed with the user's RSA key (RS256). Register the
//! public key first:
//!
//! ```sql
//! ALTER USER loader SET RSA_PUBLIC_KEY='MIIBIjANBgkqh...';
//! ```
//!
//! # Transactions
//!
//! The SQL API is stateless, so a transaction buffers its statements and
//! commit sends them as one multi-statement request wrapped in
//! `BEGIN; … COMMIT;`. Reads inside a transaction see committed state only,
//! and statement failures surface at commit.

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DestinationType, Transaction};
use crate::error::{Error, Result};
use crate::security::{inline_params, LiteralStyle};
use crate::types::{Row, Value};

const LITERALS: LiteralStyle = LiteralStyle {
    bool_as_int: false,
    backslash_escapes: true,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// JWT claims for Snowflake authentication
#[derive(Debug, Serialize, Deserialize)]
struct SnowflakeJwtClaims {
    /// Issuer: <account>.<user>.SHA256:<public_key_fingerprint>
    iss: String,
    /// Subject: <account>.<user>
    sub: String,
    iat: u64,
    exp: u64,
}

/// Key-pair authentication state
struct SnowflakeAuth {
    token: String,
    expires_at: SystemTime,
    encoding_key: EncodingKey,
    issuer: String,
    subject: String,
    token_lifetime_secs: u64,
}

impl SnowflakeAuth {
    fn new(account: &str, user: &str, private_key_pem: &str, token_lifetime_secs: u64) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| Error::config(format!("failed to parse private key: {e}")))?;

        // Fingerprint is the SHA-256 of the DER-encoded public key
        let public_key = private_key.to_public_key();
        let public_key_der = rsa::pkcs8::EncodePublicKey::to_public_key_der(&public_key)
            .map_err(|e| Error::config(format!("failed to encode public key: {e}")))?;

        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(public_key_der.as_bytes());
        let fingerprint = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hasher.finalize());

        let account_upper = account_identifier(account);
        let user_upper = user.to_uppercase();

        let private_key_der = rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(&private_key)
            .map_err(|e| Error::config(format!("failed to encode private key: {e}")))?;

        let mut auth = Self {
            token: String::new(),
            expires_at: UNIX_EPOCH,
            encoding_key: EncodingKey::from_rsa_der(private_key_der.as_bytes()),
            issuer: format!("{account_upper}.{user_upper}.SHA256:{fingerprint}"),
            subject: format!("{account_upper}.{user_upper}"),
            token_lifetime_secs,
        };
        auth.refresh_token()?;
        Ok(auth)
    }

    /// Refresh five minutes before expiry
    fn needs_refresh(&self) -> bool {
        match SystemTime::now().checked_add(Duration::from_secs(300)) {
            Some(check_time) => check_time >= self.expires_at,
            None => true,
        }
    }

    fn refresh_token(&mut self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::internal(format!("system time error: {e}")))?;

        let iat = now.as_secs();
        let exp = iat + self.token_lifetime_secs;
        let claims = SnowflakeJwtClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat,
            exp,
        };

        self.token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| Error::internal(format!("failed to generate JWT: {e}")))?;
        self.expires_at = UNIX_EPOCH + Duration::from_secs(exp);
        debug!(expires_at = ?self.expires_at, "generated new Snowflake JWT");
        Ok(())
    }

    fn get_token(&mut self) -> Result<String> {
        if self.needs_refresh() {
            self.refresh_token()?;
        }
        Ok(self.token.clone())
    }
}

/// Legacy locator accounts drop the region suffix in JWT claims
fn account_identifier(account: &str) -> String {
    let upper = account.to_uppercase();
    if upper.contains('-') {
        return upper;
    }
    upper.split('.').next().unwrap_or_default().to_string()
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    database: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<StatementParameters>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct StatementParameters {
    multi_statement_count: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
}

impl StatementResponse {
    fn into_rows(self) -> Vec<Row> {
        let columns: Vec<String> = self
            .result_set_meta_data
            .map(|m| m.row_type.into_iter().map(|r| r.name).collect())
            .unwrap_or_default();
        self.data
            .into_iter()
            .map(|cells| {
                let values = cells
                    .into_iter()
                    .map(|cell| cell.map(Value::String).unwrap_or(Value::Null))
                    .collect();
                Row::new(columns.clone(), values)
            })
            .collect()
    }
}

/// Session settings shared by every connection of a factory
struct Session {
    api_url: String,
    database: String,
    warehouse: Option<String>,
    role: Option<String>,
    auth: Mutex<SnowflakeAuth>,
}

/// Snowflake SQL API connection
pub struct SnowflakeConnection {
    client: reqwest::Client,
    session: Arc<Session>,
}

impl SnowflakeConnection {
    async fn submit(&self, statement: &str, statement_count: Option<usize>) -> Result<StatementResponse> {
        let token = self.session.auth.lock().await.get_token()?;
        let body = StatementRequest {
            statement,
            database: &self.session.database,
            warehouse: self.session.warehouse.as_deref(),
            role: self.session.role.as_deref(),
            parameters: statement_count.map(|n| StatementParameters {
                multi_statement_count: n.to_string(),
            }),
        };

        let mut request = self
            .client
            .post(format!("{}/api/v2/statements", self.session.api_url))
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/json")
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .json(&body);
        if let Some(role) = &self.session.role {
            request = request.header("X-Snowflake-Role", role);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| Error::connection_with_source("Snowflake request failed", e))?;

        // 202: still running, poll the statement handle
        while response.status() == reqwest::StatusCode::ACCEPTED {
            let pending: StatementResponse = response.json().await.unwrap_or_default();
            let handle = pending
                .statement_handle
                .ok_or_else(|| Error::query("Snowflake returned 202 without a statement handle"))?;
            tokio::time::sleep(POLL_INTERVAL).await;

            let token = self.session.auth.lock().await.get_token()?;
            response = self
                .client
                .get(format!("{}/api/v2/statements/{handle}", self.session.api_url))
                .header("Authorization", format!("Bearer {token}"))
                .header("Accept", "application/json")
                .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
                .send()
                .await
                .map_err(|e| Error::connection_with_source("Snowflake request failed", e))?;
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::connection_with_source("failed to read Snowflake response", e))?;
        let parsed: StatementResponse = serde_json::from_str(&text).unwrap_or_default();

        if !status.is_success() {
            let message = parsed.message.unwrap_or(text);
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return Err(Error::connection(format!("Snowflake rejected credentials: {message}")));
            }
            return Err(Error::Query {
                message,
                sql: None,
                source: None,
            });
        }
        Ok(parsed)
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = inline_params(sql, params, LITERALS)?;
        Ok(self.submit(&sql, None).await?.into_rows())
    }

    async fn run_execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = inline_params(sql, params, LITERALS)?;
        self.submit(&sql, None).await?;
        Ok(0)
    }
}

#[async_trait]
impl Connection for SnowflakeConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run_query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run_execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(SnowflakeTransaction {
            conn: SnowflakeConnection {
                client: self.client.clone(),
                session: Arc::clone(&self.session),
            },
            statements: Mutex::new(Vec::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        self.submit("SELECT 1", None).await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Buffers statements until commit
pub struct SnowflakeTransaction {
    conn: SnowflakeConnection,
    statements: Mutex<Vec<String>>,
}

/// Wrap buffered statements into one transactional request
fn transaction_script(statements: &[String]) -> String {
    let mut script = String::from("BEGIN;\n");
    for statement in statements {
        script.push_str(statement);
        script.push_str(";\n");
    }
    script.push_str("COMMIT;");
    script
}

#[async_trait]
impl Transaction for SnowflakeTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.conn.run_query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = inline_params(sql, params, LITERALS)?;
        self.statements.lock().await.push(sql);
        Ok(0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let statements = std::mem::take(&mut *self.statements.lock().await);
        if statements.is_empty() {
            return Ok(());
        }
        let script = transaction_script(&statements);
        debug!(statements = statements.len(), "committing Snowflake transaction");
        self.conn
            .submit(&script, Some(statements.len() + 2))
            .await
            .map(|_| ())
            .map_err(|e| e.statement(script.clone(), &[]))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.statements.lock().await.clear();
        Ok(())
    }
}

/// Connection factory for Snowflake
pub struct SnowflakeConnectionFactory {
    session: Arc<Session>,
}

impl SnowflakeConnectionFactory {
    /// Build the factory, parsing the PKCS#8 private key up front
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: &str,
        user: &str,
        private_key_pem: &str,
        database: impl Into<String>,
        warehouse: Option<String>,
        role: Option<String>,
        token_lifetime_secs: u64,
    ) -> Result<Self> {
        let auth = SnowflakeAuth::new(account, user, private_key_pem, token_lifetime_secs)?;
        Ok(Self {
            session: Arc::new(Session {
                api_url: format!("https://{}.snowflakecomputing.com", account.to_lowercase()),
                database: database.into(),
                warehouse,
                role,
                auth: Mutex::new(auth),
            }),
        })
    }
}

#[async_trait]
impl ConnectionFactory for SnowflakeConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::connection_with_source("failed to build HTTP client", e))?;

        debug!(api_url = %self.session.api_url, "connected");
        Ok(Box::new(SnowflakeConnection {
            client,
            session: Arc::clone(&self.session),
        }))
    }

    fn destination_type(&self) -> DestinationType {
        DestinationType::Snowflake
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_identifier() {
        assert_eq!(account_identifier("myorg-account123"), "MYORG-ACCOUNT123");
        assert_eq!(account_identifier("xy12345.us-east-1"), "XY12345");
    }

    #[test]
    fn test_transaction_script() {
        let script = transaction_script(&["DELETE FROM t".to_string(), "INSERT INTO t VALUES (1)".to_string()]);
        assert_eq!(script, "BEGIN;\nDELETE FROM t;\nINSERT INTO t VALUES (1);\nCOMMIT;");
    }

    #[test]
    fn test_response_rows() {
        let response: StatementResponse = serde_json::from_value(serde_json::json!({
            "statementHandle": "01b2",
            "resultSetMetaData": {"rowType": [{"name": "COLUMN_NAME"}, {"name": "DATA_TYPE"}]},
            "data": [["ID", "TEXT"], ["AGE", null]]
        }))
        .unwrap();
        let rows = response.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_string("column_name").as_deref(), Some("ID"));
        assert_eq!(rows[1].get_string("data_type"), None);
    }

    #[test]
    fn test_invalid_private_key() {
        let err = SnowflakeConnectionFactory::new("acct", "loader", "not a key", "DB", None, None, 3540)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
