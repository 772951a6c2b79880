//! Driver backends, one per cargo feature

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "clickhouse")]
pub mod clickhouse;

#[cfg(feature = "snowflake")]
pub mod snowflake;
