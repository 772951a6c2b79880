//! ClickHouse dialect
//!
//! ClickHouse has no primary-key constraints in the relational sense. Tables
//! with key fields use `ReplacingMergeTree` ordered by those fields, which
//! collapses rows with equal keys during merges, so writes are plain appends.
//! The ordering key is fixed at creation, so patches skip key changes.

use super::{MergeStrategy, SqlDialect, TypeMapping, NARROW_VALUE_LIMIT};
use crate::conditions::DeleteConditions;
use crate::connection::DestinationType;
use crate::error::{Error, Result};
use crate::security::{quote_identifier, validate_sql_type_name};
use crate::table::{Column, Table};
use crate::types::{DataType, Value};

/// ClickHouse dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct ClickHouseDialect;

const WRAPPED_TYPES: [&str; 5] = ["nullable(", "lowcardinality(", "array(", "map(", "tuple("];

impl SqlDialect for ClickHouseDialect {
    fn destination(&self) -> DestinationType {
        DestinationType::ClickHouse
    }

    fn max_values(&self) -> usize {
        NARROW_VALUE_LIMIT
    }

    fn merge_strategy(&self) -> MergeStrategy {
        MergeStrategy::Append
    }

    fn type_mapping(&self) -> TypeMapping {
        TypeMapping::new([
            (DataType::Bool, "UInt8"),
            (DataType::Int64, "Int64"),
            (DataType::Float64, "Float64"),
            (DataType::String, "String"),
            (DataType::Timestamp, "DateTime64(6)"),
            (DataType::Json, "String"),
            (DataType::Unknown, "String"),
        ])
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name, '`')
    }

    // Key columns are part of the sorting key and cannot be Nullable
    fn column_type(&self, column: &Column, is_pk: bool) -> String {
        let sql_type = column
            .cast_type
            .clone()
            .unwrap_or_else(|| column.sql_type.clone());
        let lower = sql_type.to_lowercase();
        if is_pk || WRAPPED_TYPES.iter().any(|w| lower.starts_with(w)) {
            sql_type
        } else {
            format!("Nullable({sql_type})")
        }
    }

    fn column_ddl(&self, name: &str, column: &Column, is_pk: bool) -> Result<String> {
        let sql_type = self.column_type(column, is_pk);
        validate_sql_type_name(&sql_type)?;
        let mut ddl = format!("{} {}", self.quote_identifier(name), sql_type);
        if is_pk {
            ddl.push_str(" DEFAULT ");
            ddl.push_str(self.default_value(&sql_type));
        }
        Ok(ddl)
    }

    fn create_table_sql(&self, table: &Table) -> Result<String> {
        let engine = if table.pk_fields.is_empty() {
            "ENGINE = MergeTree ORDER BY tuple()".to_string()
        } else {
            format!(
                "ENGINE = ReplacingMergeTree ORDER BY ({})",
                self.column_list(&table.pk_field_names())
            )
        };
        Ok(format!(
            "CREATE TABLE {} ({}) {engine}",
            self.table_ref(&table.schema, &table.name),
            self.column_ddl_lines(table)?.join(", ")
        ))
    }

    fn supports_primary_key_changes(&self) -> bool {
        false
    }

    fn create_primary_key_sql(&self, table: &Table) -> Result<String> {
        Err(Error::unsupported(format!(
            "ClickHouse cannot add a primary key to existing table {}.{}",
            table.schema, table.name
        )))
    }

    fn drop_primary_key_sql(&self, table: &Table) -> Result<String> {
        Err(Error::unsupported(format!(
            "ClickHouse cannot drop the primary key of table {}.{}",
            table.schema, table.name
        )))
    }

    // Deletes are mutations in ClickHouse
    fn delete_sql(&self, table: &Table, conditions: &DeleteConditions) -> Result<(String, Vec<Value>)> {
        let (predicate, values) = conditions.to_where_clause(
            |c| self.quote_identifier(c),
            |i| self.placeholder(i, None),
        )?;
        Ok((
            format!(
                "ALTER TABLE {} DELETE WHERE {}",
                self.table_ref(&table.schema, &table.name),
                predicate
            ),
            values,
        ))
    }

    fn create_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.quote_identifier(schema)
        ))
    }

    fn columns_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            "SELECT name AS column_name, type AS data_type FROM system.columns \
             WHERE database = ? AND table = ? ORDER BY position"
                .to_string(),
            vec![Value::from(schema), Value::from(name)],
        )
    }

    fn primary_key_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            "SELECT '' AS constraint_name, name AS column_name FROM system.columns \
             WHERE database = ? AND table = ? AND is_in_primary_key = 1"
                .to_string(),
            vec![Value::from(schema), Value::from(name)],
        )
    }

    fn reformat_value(&self, value: &Value) -> Value {
        match value {
            Value::Bool(b) => Value::Int16(i16::from(*b)),
            other => other.clone(),
        }
    }
}
