//! Amazon Redshift dialect
//!
//! Redshift speaks the PostgreSQL wire protocol but has no `ON CONFLICT`;
//! staged rows are merged with `DELETE … USING` followed by `INSERT … SELECT`.
//! Redshift also refuses to build a primary key over nullable columns, so
//! it is the one dialect with a nullable-key recovery path.

use std::collections::BTreeSet;

use super::postgres::numbered_placeholder;
use super::{MergeStrategy, SqlDialect, TypeMapping, WIDE_VALUE_LIMIT};
use crate::connection::DestinationType;
use crate::error::{Error, Result};
use crate::table::Table;
use crate::types::DataType;

/// Suffix of the scratch column used while rebuilding a key column
const REBUILD_SUFFIX: &str = "__rivven_notnull";

/// Amazon Redshift dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct RedshiftDialect;

impl SqlDialect for RedshiftDialect {
    fn destination(&self) -> DestinationType {
        DestinationType::Redshift
    }

    fn max_values(&self) -> usize {
        WIDE_VALUE_LIMIT
    }

    fn merge_strategy(&self) -> MergeStrategy {
        MergeStrategy::DeleteInsert
    }

    fn type_mapping(&self) -> TypeMapping {
        TypeMapping::new([
            (DataType::Bool, "boolean"),
            (DataType::Int64, "bigint"),
            (DataType::Float64, "double precision"),
            (DataType::String, "character varying(65535)"),
            (DataType::Timestamp, "timestamp with time zone"),
            (DataType::Json, "character varying(65535)"),
            (DataType::Unknown, "character varying(65535)"),
        ])
    }

    fn placeholder(&self, index: usize, cast: Option<&str>) -> String {
        numbered_placeholder(index, cast)
    }

    fn is_nullable_pk_error(&self, err: &Error) -> bool {
        let message = err.driver_message().to_lowercase();
        message.contains("nullable")
            || message.contains("contains null values")
            || (message.contains("primary key") && message.contains("not null"))
    }

    fn nullable_pk_recovery_sql(&self, table: &Table, pk_fields: &BTreeSet<String>) -> Result<Vec<String>> {
        let table_ref = self.table_ref(&table.schema, &table.name);
        let mut statements = Vec::new();

        for field in pk_fields {
            let Some(column) = table.columns.get(field) else {
                continue;
            };
            let scratch = format!("{field}{REBUILD_SUFFIX}");
            let sql_type = self.column_type(column, true);
            let default = self.default_value(&sql_type);
            let quoted = self.quote_identifier(field);
            let quoted_scratch = self.quote_identifier(&scratch);

            statements.push(format!(
                "ALTER TABLE {table_ref} ADD COLUMN {}",
                self.column_ddl(&scratch, column, true)?
            ));
            statements.push(format!(
                "UPDATE {table_ref} SET {quoted_scratch} = COALESCE({quoted}, {default})"
            ));
            statements.push(format!("ALTER TABLE {table_ref} DROP COLUMN {quoted}"));
            statements.push(format!(
                "ALTER TABLE {table_ref} RENAME COLUMN {quoted_scratch} TO {quoted}"
            ));
        }

        Ok(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Column;

    #[test]
    fn test_merge_is_delete_then_insert() {
        let target = Table::new("public", "events")
            .with_column("id", Column::new("bigint"))
            .with_column("name", Column::new("character varying(65535)"))
            .with_pk_fields(["id"]);
        let staging = target.without_pk("events_tmp_ab12");

        let stmts = RedshiftDialect
            .merge_sql(&target, &staging, &["id", "name"])
            .unwrap();
        assert_eq!(
            stmts,
            vec![
                "DELETE FROM \"public\".\"events\" USING \"public\".\"events_tmp_ab12\" \
                 WHERE \"public\".\"events\".\"id\" = \"public\".\"events_tmp_ab12\".\"id\""
                    .to_string(),
                "INSERT INTO \"public\".\"events\" (\"id\", \"name\") SELECT \"id\", \"name\" \
                 FROM \"public\".\"events_tmp_ab12\""
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_upsert_is_unsupported() {
        let table = Table::new("public", "events").with_column("id", Column::new("bigint"));
        assert!(RedshiftDialect.upsert_sql(&table, &["id"]).is_err());
    }

    #[test]
    fn test_nullable_pk_error_detection() {
        assert!(RedshiftDialect.is_nullable_pk_error(&Error::query(
            "column \"id\" is nullable and cannot be part of a primary key"
        )));
        assert!(!RedshiftDialect.is_nullable_pk_error(&Error::query("permission denied")));
    }

    #[test]
    fn test_recovery_rebuilds_each_key_column() {
        let live = Table::new("public", "events")
            .with_column("id", Column::new("bigint"))
            .with_column("key", Column::new("character varying(256)"));
        let pk: BTreeSet<String> = ["id", "key", "missing"].iter().map(|s| s.to_string()).collect();

        let stmts = RedshiftDialect.nullable_pk_recovery_sql(&live, &pk).unwrap();
        assert_eq!(stmts.len(), 8);
        assert_eq!(
            stmts[0],
            "ALTER TABLE \"public\".\"events\" ADD COLUMN \"id__rivven_notnull\" bigint NOT NULL DEFAULT 0"
        );
        assert_eq!(
            stmts[1],
            "UPDATE \"public\".\"events\" SET \"id__rivven_notnull\" = COALESCE(\"id\", 0)"
        );
        assert_eq!(stmts[2], "ALTER TABLE \"public\".\"events\" DROP COLUMN \"id\"");
        assert_eq!(
            stmts[3],
            "ALTER TABLE \"public\".\"events\" RENAME COLUMN \"id__rivven_notnull\" TO \"id\""
        );
        assert!(stmts[5].contains("COALESCE(\"key\", '')"));
    }
}
