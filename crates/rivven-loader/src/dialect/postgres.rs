//! PostgreSQL dialect

use sea_query::{Alias, Expr, IntoIden, OnConflict, PostgresQueryBuilder, Query};

use super::{sea_table_ref, update_columns, MergeStrategy, SqlDialect, TypeMapping, WIDE_VALUE_LIMIT};
use crate::connection::DestinationType;
use crate::error::Result;
use crate::table::Table;
use crate::types::DataType;

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

/// `$n` placeholder with an optional `::cast`
pub(super) fn numbered_placeholder(index: usize, cast: Option<&str>) -> String {
    match cast {
        Some(cast) => format!("${index}::{cast}"),
        None => format!("${index}"),
    }
}

impl SqlDialect for PostgresDialect {
    fn destination(&self) -> DestinationType {
        DestinationType::Postgres
    }

    fn max_values(&self) -> usize {
        WIDE_VALUE_LIMIT
    }

    fn merge_strategy(&self) -> MergeStrategy {
        MergeStrategy::OnConflict
    }

    fn type_mapping(&self) -> TypeMapping {
        TypeMapping::new([
            (DataType::Bool, "boolean"),
            (DataType::Int64, "bigint"),
            (DataType::Float64, "double precision"),
            (DataType::String, "text"),
            (DataType::Timestamp, "timestamp with time zone"),
            (DataType::Json, "jsonb"),
            (DataType::Unknown, "text"),
        ])
    }

    fn placeholder(&self, index: usize, cast: Option<&str>) -> String {
        numbered_placeholder(index, cast)
    }

    fn upsert_sql(&self, table: &Table, columns: &[&str]) -> Result<String> {
        let tbl = sea_table_ref(&table.schema, &table.name);

        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let update_cols: Vec<_> = update_columns(table, columns)
            .into_iter()
            .map(|c| Alias::new(c).into_iden())
            .collect();
        let pk_idens: Vec<_> = table
            .pk_field_names()
            .into_iter()
            .map(|c| Alias::new(c).into_iden())
            .collect();

        let values: Vec<_> = columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let cast = table.columns.get(*col).and_then(|c| c.cast_type.as_deref());
                Expr::cust(numbered_placeholder(i + 1, cast))
            })
            .collect();

        let mut on_conflict = OnConflict::columns(pk_idens);
        on_conflict.update_columns(update_cols);

        let mut stmt = Query::insert();
        stmt.into_table(tbl)
            .columns(col_idens)
            .values_panic(values)
            .on_conflict(on_conflict.to_owned());

        Ok(stmt.to_string(PostgresQueryBuilder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::DeleteConditions;
    use crate::table::Column;
    use crate::types::Value;

    fn events() -> Table {
        Table::new("analytics", "events")
            .with_column("id", Column::new("bigint"))
            .with_column("email", Column::new("text"))
            .with_column("payload", Column::new("text").with_cast("jsonb"))
            .with_pk_fields(["id"])
    }

    #[test]
    fn test_create_table_sorted_with_pk_defaults() {
        let sql = PostgresDialect.create_table_sql(&events()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE \"analytics\".\"events\" (\"email\" text, \"id\" bigint NOT NULL DEFAULT 0, \"payload\" jsonb)"
        );
    }

    #[test]
    fn test_text_pk_defaults_to_empty_string() {
        let table = Table::new("s", "t")
            .with_column("key", Column::new("text"))
            .with_pk_fields(["key"]);
        let sql = PostgresDialect.create_table_sql(&table).unwrap();
        assert!(sql.contains("\"key\" text NOT NULL DEFAULT ''"));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let table = Table::new("s", "t").with_column("a", Column::new("text").with_cast("int; DROP"));
        assert!(PostgresDialect.create_table_sql(&table).is_err());
    }

    #[test]
    fn test_primary_key_statements() {
        let patch = Table::new("analytics", "events")
            .with_pk_fields(["id", "email"])
            .with_primary_key_name("analytics_events_pk");
        assert_eq!(
            PostgresDialect.create_primary_key_sql(&patch).unwrap(),
            "ALTER TABLE \"analytics\".\"events\" ADD CONSTRAINT \"analytics_events_pk\" PRIMARY KEY (\"email\", \"id\")"
        );
        assert_eq!(
            PostgresDialect.drop_primary_key_sql(&patch).unwrap(),
            "ALTER TABLE \"analytics\".\"events\" DROP CONSTRAINT \"analytics_events_pk\""
        );
    }

    #[test]
    fn test_multi_row_insert_numbering_and_casts() {
        let sql = PostgresDialect.insert_sql(&events(), &["email", "id", "payload"], 2);
        assert_eq!(
            sql,
            "INSERT INTO \"analytics\".\"events\" (\"email\", \"id\", \"payload\") VALUES ($1, $2, $3::jsonb), ($4, $5, $6::jsonb)"
        );
    }

    #[test]
    fn test_upsert_uses_sea_query() {
        let sql = PostgresDialect
            .upsert_sql(&events(), &["email", "id", "payload"])
            .unwrap();
        assert!(sql.starts_with("INSERT INTO \"analytics\".\"events\""));
        assert!(sql.contains("$3::jsonb"));
        assert!(sql.contains("ON CONFLICT (\"id\")"));
        assert!(sql.contains("\"email\" = \"excluded\".\"email\""));
    }

    #[test]
    fn test_merge_on_constraint() {
        let target = events();
        let staging = target.without_pk("events_tmp_1");
        let stmts = PostgresDialect
            .merge_sql(&target, &staging, &["email", "id"])
            .unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0],
            "INSERT INTO \"analytics\".\"events\" (\"email\", \"id\") SELECT \"email\", \"id\" FROM \"analytics\".\"events_tmp_1\" \
             ON CONFLICT ON CONSTRAINT \"analytics_events_pk\" DO UPDATE SET \"email\" = excluded.\"email\""
        );
    }

    #[test]
    fn test_delete_with_conditions() {
        let conditions = DeleteConditions::eq("id", Value::Int64(7));
        let (sql, values) = PostgresDialect.delete_sql(&events(), &conditions).unwrap();
        assert_eq!(sql, "DELETE FROM \"analytics\".\"events\" WHERE \"id\" = $1");
        assert_eq!(values, vec![Value::Int64(7)]);
    }

    #[test]
    fn test_introspection_queries_bind_schema_and_table() {
        let (sql, params) = PostgresDialect.columns_query("analytics", "events");
        assert!(sql.contains("table_schema = $1 AND table_name = $2"));
        assert_eq!(params, vec![Value::from("analytics"), Value::from("events")]);

        let (sql, _) = PostgresDialect.primary_key_query("analytics", "events");
        assert!(sql.contains("constraint_type = 'PRIMARY KEY'"));
    }

    #[test]
    fn test_truncate_and_drop() {
        assert_eq!(
            PostgresDialect.truncate_sql("analytics", "events"),
            "TRUNCATE TABLE \"analytics\".\"events\""
        );
        assert_eq!(
            PostgresDialect.drop_staging_table_sql(&events()),
            "DROP TABLE IF EXISTS \"analytics\".\"events\""
        );
    }
}
