//! Error types for rivven-loader
//!
//! Errors are classified so callers can decide on outer retries:
//! - Retriable errors (connection, timeout, pool exhaustion)
//! - Non-retriable errors (statement failures, unsupported operations)
//!
//! A missing table is always reported as [`Error::TableNotExist`], no matter
//! how the destination phrases it.

use std::fmt;
use thiserror::Error;

use crate::types::Value;

/// Result type for rivven-loader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Statement execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Timeout errors (retriable)
    Timeout,
    /// Configuration error
    Configuration,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Schema-related errors, including missing tables
    Schema,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::PoolExhausted)
    }
}

/// Main error type for rivven-loader
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Driver-level query failure (before statement context is attached)
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A DDL/DML statement failed; carries the statement and its bound values
    #[error("statement failed: {message}\nsql: {sql}\nvalues: {}", format_values(.values))]
    Statement {
        message: String,
        sql: String,
        values: Vec<Value>,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Schema error
    #[error("schema error: {message}")]
    Schema { message: String },

    /// The target table does not exist
    #[error("table doesn't exist: {table}")]
    TableNotExist { table: String },

    /// Unsupported operation for this destination
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn format_values(values: &[Value]) -> String {
    let rendered: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
    format!("[{}]", rendered.join(", "))
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Statement { source, .. } => source
                .as_deref()
                .map(Error::category)
                .unwrap_or(ErrorCategory::Query),
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Schema { .. } | Self::TableNotExist { .. } => ErrorCategory::Schema,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this is the canonical "table does not exist" error
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::TableNotExist { .. })
    }

    /// Driver message of the innermost failure, without statement context
    pub fn driver_message(&self) -> String {
        match self {
            Self::Statement {
                source: Some(inner),
                ..
            } => inner.driver_message(),
            Self::Statement { message, .. }
            | Self::Query { message, .. }
            | Self::Connection { message, .. }
            | Self::Transaction { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Wrap a failure with the statement text and values that caused it.
    ///
    /// Already-wrapped errors and the canonical not-exist error pass through.
    pub fn statement(self, sql: impl Into<String>, values: &[Value]) -> Self {
        match self {
            Self::Statement { .. } | Self::TableNotExist { .. } => self,
            inner => Self::Statement {
                message: inner.driver_message(),
                sql: sql.into(),
                values: values.to_vec(),
                source: Some(Box::new(inner)),
            },
        }
    }

    /// Map a driver failure to [`Error::TableNotExist`] when its text says so
    pub fn or_not_exist(self, table: impl Into<String>) -> Self {
        if is_not_exist_message(&self.driver_message()) {
            Self::TableNotExist {
                table: table.into(),
            }
        } else {
            self
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Whether a driver message reports a missing relation.
///
/// Destinations phrase it as "relation ... does not exist" (Postgres,
/// Redshift, Snowflake) or "Table ... doesn't exist" (MySQL, ClickHouse).
pub fn is_not_exist_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not exist") || lower.contains("doesn't exist")
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Schema => write!(f, "schema"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::PoolExhausted.is_retriable());

        assert!(!ErrorCategory::TypeConversion.is_retriable());
        assert!(!ErrorCategory::Query.is_retriable());
        assert!(!ErrorCategory::Schema.is_retriable());
    }

    #[test]
    fn test_not_exist_detection() {
        assert!(is_not_exist_message(
            "relation \"public.events\" does not exist"
        ));
        assert!(is_not_exist_message(
            "Table 'db.events' doesn't exist"
        ));
        assert!(is_not_exist_message("Code: 60. DB::Exception: Table x DOES NOT EXIST"));
        assert!(!is_not_exist_message("syntax error at or near \"FORM\""));
    }

    #[test]
    fn test_or_not_exist_maps_driver_text() {
        let err = Error::query("relation \"events\" does not exist").or_not_exist("events");
        assert!(err.is_not_exist());
        assert_eq!(err.to_string(), "table doesn't exist: events");

        let err = Error::query("permission denied").or_not_exist("events");
        assert!(!err.is_not_exist());
    }

    #[test]
    fn test_statement_wraps_sql_and_values() {
        let err = Error::query("duplicate key").statement(
            "INSERT INTO \"t\" (\"id\") VALUES ($1)",
            &[Value::Int64(7)],
        );

        let text = err.to_string();
        assert!(text.contains("duplicate key"));
        assert!(text.contains("INSERT INTO \"t\""));
        assert!(text.contains("Int64(7)"));
        assert_eq!(err.category(), ErrorCategory::Query);

        // Wrapping twice keeps the innermost statement
        let twice = err.statement("COMMIT", &[]);
        assert!(twice.to_string().contains("INSERT INTO"));
    }

    #[test]
    fn test_statement_keeps_retriable_category() {
        let err = Error::connection("broken pipe").statement("SELECT 1", &[]);
        assert!(err.is_retriable());
        assert_eq!(err.driver_message(), "broken pipe");
    }
}
