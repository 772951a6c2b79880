//! Building a ready adapter from configuration

use std::sync::Arc;
use tracing::info;

use crate::adapter::SqlAdapter;
use crate::config::DestinationConfig;
use crate::connection::ConnectionFactory;
use crate::dialect::dialect_for;
use crate::error::{Error, Result};
use crate::pool::SimpleConnectionPool;

/// Connection factory matching the configured destination.
///
/// Fails with a configuration error when the backend's cargo feature is off.
pub fn connection_factory(config: &DestinationConfig) -> Result<Arc<dyn ConnectionFactory>> {
    match config {
        #[cfg(feature = "postgres")]
        DestinationConfig::Postgres(c) | DestinationConfig::Redshift(c) => {
            use crate::backend::postgres::PgConnectionFactory;
            use crate::config::SslMode;
            Ok(Arc::new(
                PgConnectionFactory::new(config.destination_type()).with_tls(c.ssl_mode != SslMode::Disable),
            ))
        }
        #[cfg(feature = "mysql")]
        DestinationConfig::Mysql(_) => Ok(Arc::new(crate::backend::mysql::MySqlConnectionFactory)),
        #[cfg(feature = "clickhouse")]
        DestinationConfig::Clickhouse(c) => Ok(Arc::new(
            crate::backend::clickhouse::ClickHouseConnectionFactory::new(
                c.database.clone(),
                c.user.clone(),
                c.password.clone(),
            ),
        )),
        #[cfg(feature = "snowflake")]
        DestinationConfig::Snowflake(c) => Ok(Arc::new(
            crate::backend::snowflake::SnowflakeConnectionFactory::new(
                &c.account,
                &c.user,
                c.private_key.expose_secret(),
                c.database.clone(),
                c.warehouse.clone(),
                c.role.clone(),
                c.token_lifetime_secs,
            )?,
        )),
        #[allow(unreachable_patterns)]
        other => Err(Error::config(format!(
            "{} support is not compiled in; enable the '{}' feature",
            other.destination_type(),
            feature_name(other)
        ))),
    }
}

#[allow(dead_code)]
fn feature_name(config: &DestinationConfig) -> &'static str {
    match config {
        DestinationConfig::Postgres(_) | DestinationConfig::Redshift(_) => "postgres",
        DestinationConfig::Mysql(_) => "mysql",
        DestinationConfig::Clickhouse(_) => "clickhouse",
        DestinationConfig::Snowflake(_) => "snowflake",
    }
}

/// Create an adapter for the configured destination using its driver backend
pub async fn create_destination(config: &DestinationConfig) -> Result<SqlAdapter> {
    let factory = connection_factory(config)?;
    create_destination_with_factory(config, factory).await
}

/// Create an adapter with a caller-supplied connection factory.
///
/// Builds the pool and the dialect, then makes sure the configured schema
/// exists.
pub async fn create_destination_with_factory(
    config: &DestinationConfig,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<SqlAdapter> {
    config.validate()?;
    let common = config.common();
    let pool_config = common.pool.to_pool_config(config.connection_config()?);
    let pool = SimpleConnectionPool::new(pool_config, factory).await?;

    let adapter = SqlAdapter::new(dialect_for(config.destination_type()), pool, config.schema())
        .with_column_types(common.column_types.clone());
    adapter.ensure_schema().await?;

    info!(
        destination = %adapter.destination_type(),
        schema = %adapter.schema(),
        "destination ready"
    );
    Ok(adapter)
}
