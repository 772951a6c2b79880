//! Snowflake dialect

use super::{MergeStrategy, SqlDialect, TypeMapping, NARROW_VALUE_LIMIT};
use crate::connection::DestinationType;
use crate::error::Result;
use crate::table::Table;
use crate::types::{DataType, Value};

/// Snowflake dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct SnowflakeDialect;

impl SqlDialect for SnowflakeDialect {
    fn destination(&self) -> DestinationType {
        DestinationType::Snowflake
    }

    fn max_values(&self) -> usize {
        NARROW_VALUE_LIMIT
    }

    fn merge_strategy(&self) -> MergeStrategy {
        MergeStrategy::DeleteInsert
    }

    fn type_mapping(&self) -> TypeMapping {
        TypeMapping::new([
            (DataType::Bool, "BOOLEAN"),
            (DataType::Int64, "NUMBER"),
            (DataType::Float64, "DOUBLE PRECISION"),
            (DataType::String, "TEXT"),
            (DataType::Timestamp, "TIMESTAMP_TZ(6)"),
            (DataType::Json, "TEXT"),
            (DataType::Unknown, "TEXT"),
        ])
    }

    fn create_staging_table_sql(&self, table: &Table) -> Result<String> {
        Ok(format!(
            "CREATE TEMPORARY TABLE {} ({})",
            self.table_ref(&table.schema, &table.name),
            self.column_ddl_lines(table)?.join(", ")
        ))
    }

    fn drop_primary_key_sql(&self, table: &Table) -> Result<String> {
        let table_ref = self.table_ref(&table.schema, &table.name);
        Ok(match table.primary_key_name() {
            "" => format!("ALTER TABLE {table_ref} DROP PRIMARY KEY"),
            name => format!(
                "ALTER TABLE {table_ref} DROP CONSTRAINT {}",
                self.quote_identifier(name)
            ),
        })
    }

    fn primary_key_query(&self, schema: &str, name: &str) -> (String, Vec<Value>) {
        (
            format!("SHOW PRIMARY KEYS IN TABLE {}", self.table_ref(schema, name)),
            Vec::new(),
        )
    }
}
