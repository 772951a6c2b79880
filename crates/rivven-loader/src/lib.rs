//! # rivven-loader
//!
//! Relational destination engine for the Rivven event streaming platform.
//!
//! Writes event rows into relational warehouses and databases, keeping the
//! destination table schema in step with the events.
//!
//! ## Features
//!
//! - **Schema diffing**: compute the columns and primary-key changes a live
//!   table needs, and apply them transactionally
//! - **Deduplicated upserts**: rows sharing a primary key are split into
//!   ordered buckets so a multi-row merge never sees the same key twice
//! - **Staging-table merges**: bulk writes land in a session staging table
//!   and are merged into the target in one transaction
//! - **Value-limit batching**: multi-row inserts stay under each
//!   destination's bound-parameter cap without splitting a row
//! - **Nullable-PK recovery**: Redshift key columns are rebuilt as NOT NULL
//!   when adding the primary key fails
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_loader::prelude::*;
//!
//! let config = DestinationConfig::from_yaml(r#"
//! type: postgres
//! host: localhost
//! database: events
//! user: loader
//! "#)?;
//! let destination = create_destination(&config).await?;
//!
//! let desired = Table::new(destination.schema(), "users")
//!     .with_column("id", destination.column_for("id", DataType::Int64))
//!     .with_column("name", destination.column_for("name", DataType::String))
//!     .with_pk_fields(["id"]);
//! destination.sync_schema(&desired).await?;
//! destination.bulk_insert(&desired, rows).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL and Redshift via tokio-postgres (default)
//! - `tls` - TLS for PostgreSQL connections via rustls
//! - `mysql` - MySQL via mysql_async
//! - `clickhouse` - ClickHouse over HTTP
//! - `snowflake` - Snowflake SQL API with key-pair authentication
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod backend;
pub mod batch;
pub mod conditions;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod dialect;
pub mod error;
pub mod factory;
pub mod pool;
pub mod security;
pub mod table;
pub mod transaction;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{is_not_exist_message, Error, ErrorCategory, Result};

    // Value and type system
    pub use crate::types::{DataType, EventRow, Row, Value};

    // Table model
    pub use crate::table::{build_constraint_name, Column, PrimaryKeyOwnership, Table};

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DestinationType, Transaction,
    };

    // Pool types
    pub use crate::pool::{
        ConnectionPool, PoolConfig, PoolStats, PooledConnection, SimpleConnectionPool,
    };

    // Dialect types
    pub use crate::dialect::{
        dialect_for, ClickHouseDialect, MergeStrategy, MySqlDialect, PostgresDialect,
        RedshiftDialect, SnowflakeDialect, SqlDialect, TypeMapping,
    };

    // Adapter
    pub use crate::adapter::{Destination, EventContext, SqlAdapter};
    pub use crate::conditions::{DeleteCondition, DeleteConditions, JoinOperator};
    pub use crate::transaction::Tx;

    // Configuration
    pub use crate::config::{
        ClickHouseConfig, CommonSettings, DestinationConfig, MySqlConfig, PoolSettings,
        PostgresConfig, SensitiveString, SnowflakeConfig, SslMode,
    };
    pub use crate::factory::{connection_factory, create_destination, create_destination_with_factory};
}

pub use error::{Error, Result};
pub use types::Value;
