//! SQL dialect abstraction for rivven-loader
//!
//! One [`SqlDialect`] strategy object per destination generates every piece
//! of SQL the engine runs: DDL for tables, columns and primary keys,
//! value-limited multi-row inserts, staging-table merges and schema
//! introspection queries. The trait carries ANSI-flavored defaults; each
//! destination overrides only where it differs.
//!
//! - Identifier quoting and placeholder syntax
//! - Column DDL with forced `NOT NULL DEFAULT` on primary-key columns
//! - Merge strategies (ON CONFLICT, ON DUPLICATE KEY, DELETE + INSERT, append)
//! - Optional nullable-primary-key recovery (Redshift)

use sea_query::{Alias, IntoTableRef, TableRef};
use std::collections::{BTreeSet, HashMap};

use crate::conditions::DeleteConditions;
use crate::connection::DestinationType;
use crate::error::{Error, Result};
use crate::security::{quote_identifier, validate_sql_type_name};
use crate::table::{Column, Table};
use crate::types::{DataType, Value};

mod clickhouse;
mod mysql;
mod postgres;
mod redshift;
mod snowflake;

pub use clickhouse::ClickHouseDialect;
pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use redshift::RedshiftDialect;
pub use snowflake::SnowflakeDialect;

// sea-query table reference from a possibly empty schema + table name
fn sea_table_ref(schema: &str, table: &str) -> TableRef {
    if schema.is_empty() {
        Alias::new(table).into_table_ref()
    } else {
        (Alias::new(schema), Alias::new(table)).into_table_ref()
    }
}

/// Bound-parameter limit shared by Postgres, Redshift and MySQL
pub const WIDE_VALUE_LIMIT: usize = 65535;
/// Bound-parameter limit for ClickHouse and Snowflake
pub const NARROW_VALUE_LIMIT: usize = 32767;

/// How a staging table is reconciled into its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// `INSERT … SELECT … ON CONFLICT ON CONSTRAINT pk DO UPDATE`
    OnConflict,
    /// `INSERT … SELECT … ON DUPLICATE KEY UPDATE`
    DuplicateKey,
    /// `DELETE … USING staging` followed by `INSERT … SELECT`
    DeleteInsert,
    /// No staging: rows are appended and the table engine collapses versions
    Append,
}

/// Logical type to SQL type lookup, fixed per dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    types: HashMap<DataType, String>,
}

impl TypeMapping {
    /// Build a mapping; `Unknown` falls back to `String` when not given
    pub fn new<'a>(entries: impl IntoIterator<Item = (DataType, &'a str)>) -> Self {
        let mut types: HashMap<DataType, String> = entries
            .into_iter()
            .map(|(dt, sql)| (dt, sql.to_string()))
            .collect();
        if let Some(string) = types.get(&DataType::String).cloned() {
            types.entry(DataType::Unknown).or_insert(string);
        }
        Self { types }
    }

    /// SQL type for a logical type
    pub fn sql_type(&self, data_type: DataType) -> &str {
        self.types
            .get(&data_type)
            .or_else(|| self.types.get(&DataType::Unknown))
            .map(String::as_str)
            .unwrap_or("text")
    }

    /// Column for a logical type
    pub fn column(&self, data_type: DataType) -> Column {
        Column::new(self.sql_type(data_type))
    }
}

/// Whether a SQL type stores text (and therefore defaults to `''`)
pub fn is_text_type(sql_type: &str) -> bool {
    let lower = sql_type.to_lowercase();
    lower.contains("char") || lower.contains("text") || lower.contains("string")
}

/// SQL dialect for destination-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Destination served by this dialect
    fn destination(&self) -> DestinationType;

    /// Maximum bound values per statement
    fn max_values(&self) -> usize;

    /// How staging tables are merged
    fn merge_strategy(&self) -> MergeStrategy;

    /// Logical type mapping
    fn type_mapping(&self) -> TypeMapping;

    /// Quote an identifier
    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name, '"')
    }

    /// Fully qualified table reference
    fn table_ref(&self, schema: &str, name: &str) -> String {
        if schema.is_empty() {
            self.quote_identifier(name)
        } else {
            format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(name)
            )
        }
    }

    /// Placeholder for the 1-based parameter `index`
    fn placeholder(&self, _index: usize, _cast: Option<&str>) -> String {
        "?".to_string()
    }

    /// Default literal for a NOT NULL primary-key column
    fn default_value(&self, sql_type: &str) -> &'static str {
        if is_text_type(sql_type) {
            "''"
        } else {
            "0"
        }
    }

    /// Effective column type: the configured override wins over the inferred
    /// type.
    fn column_type(&self, column: &Column, _is_pk: bool) -> String {
        column
            .cast_type
            .clone()
            .unwrap_or_else(|| column.sql_type.clone())
    }

    /// One column definition line
    fn column_ddl(&self, name: &str, column: &Column, is_pk: bool) -> Result<String> {
        let sql_type = self.column_type(column, is_pk);
        validate_sql_type_name(&sql_type)?;
        let mut ddl = format!("{} {}", self.quote_identifier(name), sql_type);
        if is_pk {
            ddl.push_str(" NOT NULL DEFAULT ");
            ddl.push_str(self.default_value(&sql_type));
        }
        Ok(ddl)
    }

    /// Sorted column definition lines for a table
    fn column_ddl_lines(&self, table: &Table) -> Result<Vec<String>> {
        let mut lines = table
            .columns
            .iter()
            .map(|(name, column)| self.column_ddl(name, column, table.pk_fields.contains(name)))
            .collect::<Result<Vec<_>>>()?;
        lines.sort();
        Ok(lines)
    }

    /// `CREATE TABLE` without the primary-key constraint
    fn create_table_sql(&self, table: &Table) -> Result<String> {
        Ok(format!(
            "CREATE TABLE {} ({})",
            self.table_ref(&table.schema, &table.name),
            self.column_ddl_lines(table)?.join(", ")
        ))
    }

    /// `CREATE TABLE` for a staging table (no primary key)
    fn create_staging_table_sql(&self, table: &Table) -> Result<String> {
        self.create_table_sql(table)
    }

    /// `ALTER TABLE … ADD COLUMN`
    fn add_column_sql(
        &self,
        table: &Table,
        name: &str,
        column: &Column,
        is_pk: bool,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.table_ref(&table.schema, &table.name),
            self.column_ddl(name, column, is_pk)?
        ))
    }

    /// Add the primary-key constraint named by the patch
    fn create_primary_key_sql(&self, table: &Table) -> Result<String> {
        let name = constraint_name(table);
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            self.table_ref(&table.schema, &table.name),
            self.quote_identifier(&name),
            self.column_list(&table.pk_field_names())
        ))
    }

    /// Drop the primary-key constraint named by the patch
    fn drop_primary_key_sql(&self, table: &Table) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.table_ref(&table.schema, &table.name),
            self.quote_identifier(&constraint_name(table))
        ))
    }

    /// Whether primary keys can be created or dropped after the fact
    fn supports_primary_key_changes(&self) -> bool {
        true
    }

    /// Comma separated quoted column list
    fn column_list(&self, columns: &[&str]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Multi-row `INSERT` with `rows × columns` placeholders
    fn insert_sql(&self, table: &Table, columns: &[&str], rows: usize) -> String {
        let tuples: Vec<String> = (0..rows)
            .map(|row| {
                let placeholders: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, col)| {
                        let cast = table.columns.get(*col).and_then(|c| c.cast_type.as_deref());
                        self.placeholder(row * columns.len() + i + 1, cast)
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table_ref(&table.schema, &table.name),
            self.column_list(columns),
            tuples.join(", ")
        )
    }

    /// Single-row upsert for dialects with native upsert syntax
    fn upsert_sql(&self, table: &Table, _columns: &[&str]) -> Result<String> {
        Err(Error::unsupported(format!(
            "{} does not support single-statement upserts into {}",
            self.destination(),
            table.name
        )))
    }

    /// `DELETE` of the row matching the primary-key placeholders
    fn delete_by_pk_sql(&self, table: &Table) -> String {
        let predicates: Vec<String> = table
            .pk_field_names()
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let cast = table.columns.get(*col).and_then(|c| c.cast_type.as_deref());
                format!(
                    "{} = {}",
                    self.quote_identifier(col),
                    self.placeholder(i + 1, cast)
                )
            })
            .collect();
        format!(
            "DELETE FROM {} WHERE {}",
            self.table_ref(&table.schema, &table.name),
            predicates.join(" AND ")
        )
    }

    /// Statements merging `staging` into `target`
    fn merge_sql(&self, target: &Table, staging: &Table, columns: &[&str]) -> Result<Vec<String>> {
        let target_ref = self.table_ref(&target.schema, &target.name);
        let staging_ref = self.table_ref(&staging.schema, &staging.name);
        let column_list = self.column_list(columns);
        let insert_select = format!(
            "INSERT INTO {target_ref} ({column_list}) SELECT {column_list} FROM {staging_ref}"
        );

        match self.merge_strategy() {
            MergeStrategy::OnConflict => {
                let updates: Vec<String> = update_columns(target, columns)
                    .iter()
                    .map(|c| {
                        let quoted = self.quote_identifier(c);
                        format!("{quoted} = excluded.{quoted}")
                    })
                    .collect();
                Ok(vec![format!(
                    "{insert_select} ON CONFLICT ON CONSTRAINT {} DO UPDATE SET {}",
                    self.quote_identifier(&constraint_name(target)),
                    updates.join(", ")
                )])
            }
            MergeStrategy::DuplicateKey => {
                let updates: Vec<String> = update_columns(target, columns)
                    .iter()
                    .map(|c| {
                        let quoted = self.quote_identifier(c);
                        format!("{quoted} = VALUES({quoted})")
                    })
                    .collect();
                Ok(vec![format!(
                    "{insert_select} ON DUPLICATE KEY UPDATE {}",
                    updates.join(", ")
                )])
            }
            MergeStrategy::DeleteInsert => {
                let join: Vec<String> = target
                    .pk_field_names()
                    .iter()
                    .map(|c| {
                        let quoted = self.quote_identifier(c);
                        format!("{target_ref}.{quoted} = {staging_ref}.{quoted}")
                    })
                    .collect();
                Ok(vec![
                    format!(
                        "DELETE FROM {target_ref} USING {staging_ref} WHERE {}",
                        join.join(" AND ")
                    ),
                    insert_select,
                ])
            }
            MergeStrategy::Append => Err(Error::unsupported(format!(
                "{} does not support staging-table merges",
                self.destination()
            ))),
        }
    }

    /// `DELETE` built from delete conditions
    fn delete_sql(&self, table: &Table, conditions: &DeleteConditions) -> Result<(String, Vec<Value>)> {
        let (predicate, values) = conditions.to_where_clause(
            |c| self.quote_identifier(c),
            |i| self.placeholder(i, None),
        )?;
        Ok((
            format!(
                "DELETE FROM {} WHERE {}",
                self.table_ref(&table.schema, &table.name),
                predicate
            ),
            values,
        ))
    }

    /// `TRUNCATE TABLE`
    fn truncate_sql(&self, schema: &str, name: &str) -> String {
        format!("TRUNCATE TABLE {}", self.table_ref(schema, name))
    }

    /// `DROP TABLE IF EXISTS` for a staging table
    fn drop_staging_table_sql(&self, table: &Table) -> String {
        format!(
            "DROP TABLE IF EXISTS {}",
            self.table_ref(&table.schema, &table.name)
        )
    }

    /// `CREATE SCHEMA IF NOT EXISTS`, or `None` when the namespace cannot be
    /// created through SQL
    fn create_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.quote_identifier(schema)
        ))
    }

    /// Query returning `column_name` and `data_type` rows
    fn columns_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            format!(
                "SELECT column_name::text AS column_name, data_type::text AS data_type \
                 FROM information_schema.columns \
                 WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
                self.placeholder(1, None),
                self.placeholder(2, None)
            ),
            vec![Value::from(schema), Value::from(name)],
        )
    }

    /// Query returning `constraint_name` and `column_name` rows of the
    /// primary key
    fn primary_key_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            format!(
                "SELECT tc.constraint_name::text AS constraint_name, kcu.column_name::text AS column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                 ON tc.constraint_name = kcu.constraint_name \
                 AND tc.table_schema = kcu.table_schema \
                 AND tc.table_name = kcu.table_name \
                 WHERE tc.constraint_type = 'PRIMARY KEY' \
                 AND tc.table_schema = {} AND tc.table_name = {}",
                self.placeholder(1, None),
                self.placeholder(2, None)
            ),
            vec![Value::from(schema), Value::from(name)],
        )
    }

    /// Primary-key constraint name as the engine should see it
    fn normalize_primary_key_name(&self, name: &str) -> String {
        name.to_string()
    }

    /// Value-level reformatting before binding
    fn reformat_value(&self, value: &Value) -> Value {
        value.clone()
    }

    /// Whether a failed primary-key creation was caused by a nullable column
    fn is_nullable_pk_error(&self, _err: &Error) -> bool {
        false
    }

    /// Statements that make the primary-key columns of `live` NOT NULL.
    ///
    /// Empty means the dialect has no recovery path.
    fn nullable_pk_recovery_sql(&self, _live: &Table, _pk_fields: &BTreeSet<String>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Constraint name carried by a table or patch, falling back to the
/// deterministic one
pub fn constraint_name(table: &Table) -> String {
    match table.primary_key_name() {
        "" => table.pk_name(),
        name => name.to_string(),
    }
}

/// Columns updated on conflict: non-key columns, or the key itself when the
/// table has nothing else
fn update_columns<'a>(table: &Table, columns: &[&'a str]) -> Vec<&'a str> {
    let non_pk: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !table.pk_fields.contains(*c))
        .collect();
    if non_pk.is_empty() {
        columns.to_vec()
    } else {
        non_pk
    }
}

/// Get a dialect by destination
pub fn dialect_for(destination: DestinationType) -> Box<dyn SqlDialect> {
    match destination {
        DestinationType::Postgres => Box::new(PostgresDialect),
        DestinationType::Redshift => Box::new(RedshiftDialect),
        DestinationType::MySql => Box::new(MySqlDialect),
        DestinationType::ClickHouse => Box::new(ClickHouseDialect),
        DestinationType::Snowflake => Box::new(SnowflakeDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Table {
        Table::new("analytics", "events")
            .with_column("id", Column::new("bigint"))
            .with_column("email", Column::new("text"))
            .with_column("payload", Column::new("text").with_cast("jsonb"))
            .with_pk_fields(["id"])
    }

    #[test]
    fn test_type_mapping_fallback() {
        let mapping = TypeMapping::new([(DataType::String, "text"), (DataType::Int64, "bigint")]);
        assert_eq!(mapping.sql_type(DataType::Int64), "bigint");
        assert_eq!(mapping.sql_type(DataType::Unknown), "text");
        assert_eq!(mapping.sql_type(DataType::Json), "text");
    }

    #[test]
    fn test_is_text_type() {
        assert!(is_text_type("character varying(65535)"));
        assert!(is_text_type("TEXT"));
        assert!(is_text_type("String"));
        assert!(!is_text_type("bigint"));
    }

    #[test]
    fn test_dialect_for() {
        for destination in [
            DestinationType::Postgres,
            DestinationType::Redshift,
            DestinationType::MySql,
            DestinationType::ClickHouse,
            DestinationType::Snowflake,
        ] {
            assert_eq!(dialect_for(destination).destination(), destination);
        }
    }

    #[test]
    fn test_update_columns_falls_back_to_key() {
        let table = Table::new("s", "t")
            .with_column("id", Column::new("bigint"))
            .with_pk_fields(["id"]);
        assert_eq!(update_columns(&table, &["id"]), vec!["id"]);
        assert_eq!(update_columns(&events(), &["email", "id"]), vec!["email"]);
    }

    #[test]
    fn test_constraint_name() {
        assert_eq!(constraint_name(&events()), "analytics_events_pk");
        let named = events().with_primary_key_name("custom_pk");
        assert_eq!(constraint_name(&named), "custom_pk");
    }
}
