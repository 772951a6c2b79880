//! Building destinations from configuration

mod common;

use common::{row, MemoryDatabase, MemoryFactory};
use rivven_loader::prelude::*;

#[tokio::test]
async fn test_postgres_destination_creates_schema() {
    let config = DestinationConfig::from_yaml(
        r#"
type: postgres
host: localhost
database: events
user: loader
schema: staging
column_types:
  payload: jsonb
"#,
    )
    .unwrap();

    let db = MemoryDatabase::new();
    let factory = MemoryFactory::new(&db, config.destination_type());
    let destination = create_destination_with_factory(&config, factory)
        .await
        .unwrap();

    assert_eq!(destination.schema(), "staging");
    assert_eq!(destination.destination_type(), DestinationType::Postgres);
    assert_eq!(
        db.committed_sql(),
        vec!["CREATE SCHEMA IF NOT EXISTS \"staging\"".to_string()]
    );

    let column = destination.column_for("payload", DataType::String);
    assert_eq!(column.sql_type, "text");
    assert_eq!(column.cast_type.as_deref(), Some("jsonb"));
}

#[tokio::test]
async fn test_clickhouse_destination_uses_database() {
    let config = DestinationConfig::from_yaml(
        r#"
type: clickhouse
url: http://localhost:8123
database: analytics
"#,
    )
    .unwrap();

    let db = MemoryDatabase::new();
    let factory = MemoryFactory::new(&db, config.destination_type());
    let destination = create_destination_with_factory(&config, factory)
        .await
        .unwrap();

    assert_eq!(destination.schema(), "analytics");
    assert_eq!(
        db.committed_sql(),
        vec!["CREATE DATABASE IF NOT EXISTS `analytics`".to_string()]
    );
}

#[tokio::test]
async fn test_schema_creation_failure_is_reported() {
    let config = DestinationConfig::from_yaml(
        r#"
type: redshift
host: cluster.example.com
port: 5439
database: dev
user: loader
"#,
    )
    .unwrap();

    let db = MemoryDatabase::new();
    db.fail_when(|sql| sql.starts_with("CREATE SCHEMA"), "permission denied for database dev");
    let factory = MemoryFactory::new(&db, config.destination_type());

    let err = create_destination_with_factory(&config, factory)
        .await
        .unwrap_err();
    match err {
        Error::Statement { sql, message, .. } => {
            assert_eq!(sql, "CREATE SCHEMA IF NOT EXISTS \"public\"");
            assert_eq!(message, "permission denied for database dev");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_configured_destination_writes_rows() {
    let config = DestinationConfig::from_yaml(
        r#"
type: postgres
host: localhost
database: events
user: loader
"#,
    )
    .unwrap();

    let db = MemoryDatabase::new();
    let factory = MemoryFactory::new(&db, config.destination_type());
    let destination = create_destination_with_factory(&config, factory)
        .await
        .unwrap();
    db.clear_log();

    let table = Table::new(destination.schema(), "events")
        .with_column("n", destination.column_for("n", DataType::Int64));
    destination
        .bulk_insert(&table, vec![row([("n", Value::Int64(1))]), row([("n", Value::Int64(2))])])
        .await
        .unwrap();

    assert_eq!(
        db.committed_sql(),
        vec!["INSERT INTO \"public\".\"events\" (\"n\") VALUES ($1), ($2)".to_string()]
    );
    destination.close().await.unwrap();
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = DestinationConfig::from_yaml(
        r#"
type: postgres
host: localhost
database: events
user: loader
pool:
  max_size: 0
"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    let err = DestinationConfig::from_yaml("type: oracle\nhost: x\n").unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}
