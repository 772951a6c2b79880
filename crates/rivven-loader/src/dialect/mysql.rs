//! MySQL dialect

use sea_query::{Alias, Expr, IntoIden, MysqlQueryBuilder, OnConflict, Query};

use super::{sea_table_ref, update_columns, MergeStrategy, SqlDialect, TypeMapping, WIDE_VALUE_LIMIT};
use crate::connection::DestinationType;
use crate::error::Result;
use crate::security::quote_identifier;
use crate::table::{Column, Table};
use crate::types::{DataType, Value};

/// Name MySQL reports for every primary-key constraint
pub const MYSQL_PRIMARY_KEY_NAME: &str = "PRIMARY";

/// MySQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn destination(&self) -> DestinationType {
        DestinationType::MySql
    }

    fn max_values(&self) -> usize {
        WIDE_VALUE_LIMIT
    }

    fn merge_strategy(&self) -> MergeStrategy {
        MergeStrategy::DuplicateKey
    }

    fn type_mapping(&self) -> TypeMapping {
        TypeMapping::new([
            (DataType::Bool, "BOOLEAN"),
            (DataType::Int64, "BIGINT"),
            (DataType::Float64, "DOUBLE"),
            (DataType::String, "TEXT"),
            (DataType::Timestamp, "DATETIME(6)"),
            (DataType::Json, "JSON"),
            (DataType::Unknown, "TEXT"),
        ])
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name, '`')
    }

    // TEXT and JSON columns can neither be indexed without a prefix nor carry
    // a default, so key columns fall back to VARCHAR(255)
    fn column_type(&self, column: &Column, is_pk: bool) -> String {
        let sql_type = column
            .cast_type
            .clone()
            .unwrap_or_else(|| column.sql_type.clone());
        let lower = sql_type.to_lowercase();
        if is_pk && (lower.ends_with("text") || lower == "json") {
            "VARCHAR(255)".to_string()
        } else {
            sql_type
        }
    }

    fn create_staging_table_sql(&self, table: &Table) -> Result<String> {
        Ok(format!(
            "CREATE TEMPORARY TABLE {} ({})",
            self.table_ref(&table.schema, &table.name),
            self.column_ddl_lines(table)?.join(", ")
        ))
    }

    fn create_primary_key_sql(&self, table: &Table) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD PRIMARY KEY ({})",
            self.table_ref(&table.schema, &table.name),
            self.column_list(&table.pk_field_names())
        ))
    }

    fn drop_primary_key_sql(&self, table: &Table) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP PRIMARY KEY",
            self.table_ref(&table.schema, &table.name)
        ))
    }

    fn drop_staging_table_sql(&self, table: &Table) -> String {
        format!(
            "DROP TEMPORARY TABLE IF EXISTS {}",
            self.table_ref(&table.schema, &table.name)
        )
    }

    fn upsert_sql(&self, table: &Table, columns: &[&str]) -> Result<String> {
        let tbl = sea_table_ref(&table.schema, &table.name);

        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let update_cols: Vec<_> = update_columns(table, columns)
            .into_iter()
            .map(|c| Alias::new(c).into_iden())
            .collect();

        let values: Vec<_> = columns.iter().map(|_| Expr::cust("?")).collect();

        let mut on_conflict = OnConflict::new();
        on_conflict.update_columns(update_cols);

        let mut stmt = Query::insert();
        stmt.into_table(tbl)
            .columns(col_idens)
            .values_panic(values)
            .on_conflict(on_conflict.to_owned());

        Ok(stmt.to_string(MysqlQueryBuilder))
    }

    fn create_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.quote_identifier(schema)
        ))
    }

    fn columns_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            "SELECT column_name AS column_name, column_type AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position"
                .to_string(),
            vec![Value::from(schema), Value::from(name)],
        )
    }

    fn primary_key_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            "SELECT constraint_name AS constraint_name, column_name AS column_name \
             FROM information_schema.key_column_usage \
             WHERE table_schema = ? AND table_name = ? AND constraint_name = 'PRIMARY'"
                .to_string(),
            vec![Value::from(schema), Value::from(name)],
        )
    }

    // Every MySQL key is named PRIMARY; treat it as unnamed so it stays managed
    fn normalize_primary_key_name(&self, name: &str) -> String {
        if name == MYSQL_PRIMARY_KEY_NAME {
            String::new()
        } else {
            name.to_string()
        }
    }

    fn reformat_value(&self, value: &Value) -> Value {
        match value {
            Value::Bool(b) => Value::Int16(i16::from(*b)),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Table {
        Table::new("shop", "orders")
            .with_column("id", Column::new("TEXT"))
            .with_column("total", Column::new("DOUBLE"))
            .with_pk_fields(["id"])
    }

    #[test]
    fn test_text_key_becomes_varchar() {
        let sql = MySqlDialect.create_table_sql(&orders()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE `shop`.`orders` (`id` VARCHAR(255) NOT NULL DEFAULT '', `total` DOUBLE)"
        );
    }

    #[test]
    fn test_staging_table_is_temporary() {
        let staging = orders().without_pk("orders_tmp_1");
        let sql = MySqlDialect.create_staging_table_sql(&staging).unwrap();
        assert!(sql.starts_with("CREATE TEMPORARY TABLE `shop`.`orders_tmp_1`"));
        assert!(MySqlDialect
            .drop_staging_table_sql(&staging)
            .starts_with("DROP TEMPORARY TABLE IF EXISTS"));
    }

    #[test]
    fn test_primary_key_statements() {
        assert_eq!(
            MySqlDialect.create_primary_key_sql(&orders()).unwrap(),
            "ALTER TABLE `shop`.`orders` ADD PRIMARY KEY (`id`)"
        );
        assert_eq!(
            MySqlDialect.drop_primary_key_sql(&orders()).unwrap(),
            "ALTER TABLE `shop`.`orders` DROP PRIMARY KEY"
        );
    }

    #[test]
    fn test_upsert_on_duplicate_key() {
        let sql = MySqlDialect.upsert_sql(&orders(), &["id", "total"]).unwrap();
        assert!(sql.starts_with("INSERT INTO `shop`.`orders`"));
        assert!(sql.contains("VALUES (?, ?)"));
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
    }

    #[test]
    fn test_upsert_without_schema() {
        let table = Table::new("", "orders")
            .with_column("id", Column::new("BIGINT"))
            .with_pk_fields(["id"]);
        let sql = MySqlDialect.upsert_sql(&table, &["id"]).unwrap();
        assert!(sql.starts_with("INSERT INTO `orders` (`id`) VALUES (?)"));
    }

    #[test]
    fn test_merge_on_duplicate_key() {
        let target = orders();
        let staging = target.without_pk("orders_tmp_1");
        let stmts = MySqlDialect.merge_sql(&target, &staging, &["id", "total"]).unwrap();
        assert_eq!(
            stmts,
            vec!["INSERT INTO `shop`.`orders` (`id`, `total`) SELECT `id`, `total` FROM `shop`.`orders_tmp_1` \
                  ON DUPLICATE KEY UPDATE `total` = VALUES(`total`)"
                .to_string()]
        );
    }

    #[test]
    fn test_booleans_become_integers() {
        assert_eq!(MySqlDialect.reformat_value(&Value::Bool(true)), Value::Int16(1));
        assert_eq!(MySqlDialect.reformat_value(&Value::from("x")), Value::from("x"));
    }

    #[test]
    fn test_primary_name_is_unnamed() {
        assert_eq!(MySqlDialect.normalize_primary_key_name("PRIMARY"), "");
    }

    #[test]
    fn test_create_database() {
        assert_eq!(
            MySqlDialect.create_schema_sql("shop").as_deref(),
            Some("CREATE DATABASE IF NOT EXISTS `shop`")
        );
    }
}
