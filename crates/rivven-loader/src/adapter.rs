//! Destination contract and the generic SQL adapter
//!
//! [`SqlAdapter`] is the single façade over every relational destination.
//! Destination differences live in its [`SqlDialect`]; the adapter owns the
//! write orchestration:
//!
//! 1. optional `DELETE` from delete conditions
//! 2. tables without a key: value-limit batched multi-row inserts
//! 3. keyed tables: deduplicate, then merge each bucket through a staging
//!    table (or append per bucket where the engine collapses versions)
//! 4. direct commit; any failure rolls the whole write back
//!
//! Schema changes run in their own transaction. When a dialect reports that
//! creating a primary key failed over a nullable column, the patch is
//! re-applied in a second transaction with the key columns rebuilt as
//! NOT NULL, and key creation is retried once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{plan_inserts, row_values};
use crate::conditions::DeleteConditions;
use crate::connection::DestinationType;
use crate::dedup::deduplicate;
use crate::dialect::{MergeStrategy, SqlDialect, TypeMapping};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::table::{Column, Table};
use crate::transaction::Tx;
use crate::types::{EventRow, Row, Value};

/// A single event to write
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Event identifier, used for logging only
    pub event_id: Option<String>,
    /// Target table with the columns the event requires
    pub table: Table,
    /// Flattened event
    pub row: EventRow,
}

impl EventContext {
    /// Create a context for one row
    pub fn new(table: Table, row: EventRow) -> Self {
        Self {
            event_id: None,
            table,
            row,
        }
    }

    /// Attach the event identifier
    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }
}

/// Contract every destination adapter implements.
///
/// Methods an adapter cannot support keep their default, which returns
/// [`Error::Unsupported`].
#[async_trait]
pub trait Destination: Send + Sync {
    /// Human readable destination name
    fn name(&self) -> String;

    /// Live schema of a table; an empty [`Table`] when it does not exist
    async fn get_table_schema(&self, name: &str) -> Result<Table> {
        Err(Error::unsupported(format!(
            "{} does not support reading table schema ({name})",
            self.name()
        )))
    }

    /// Create a table with its primary key
    async fn create_table(&self, table: &Table) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support creating tables ({})",
            self.name(),
            table.name
        )))
    }

    /// Apply a patch produced by [`Table::diff`]
    async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support altering tables ({})",
            self.name(),
            patch.name
        )))
    }

    /// Write one event: plain insert, or single-row upsert for keyed tables
    async fn insert(&self, event: &EventContext) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support single-event inserts ({})",
            self.name(),
            event.table.name
        )))
    }

    /// Write a batch
    async fn bulk_insert(&self, table: &Table, rows: Vec<EventRow>) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support bulk insert ({}, {} rows)",
            self.name(),
            table.name,
            rows.len()
        )))
    }

    /// Delete rows matching `conditions`, then write a batch, atomically
    async fn bulk_update(
        &self,
        table: &Table,
        rows: Vec<EventRow>,
        _conditions: &DeleteConditions,
    ) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support bulk update ({}, {} rows)",
            self.name(),
            table.name,
            rows.len()
        )))
    }

    /// Remove every row of a table
    async fn truncate(&self, name: &str) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support truncate ({name})",
            self.name()
        )))
    }

    /// Release connections
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Bring a table to the shape `desired` requires: create it when
    /// missing, otherwise apply the diff. Returns the applied patch (the full
    /// table when it was created).
    async fn sync_schema(&self, desired: &Table) -> Result<Table> {
        let current = self.get_table_schema(&desired.name).await?;
        if !current.exists() {
            self.create_table(desired).await?;
            return Ok(desired.clone());
        }
        let patch = current.diff(desired);
        if !patch.is_empty_patch() {
            self.patch_table_schema(&patch).await?;
        }
        Ok(patch)
    }
}

/// Read-only access used for schema introspection, inside or outside a
/// transaction
#[async_trait]
trait SchemaReader: Send + Sync {
    async fn read(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

#[async_trait]
impl SchemaReader for Tx {
    async fn read(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query(sql, params).await
    }
}

#[async_trait]
impl SchemaReader for PooledConnection {
    async fn read(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.connection()
            .query(sql, params)
            .await
            .map_err(|e| e.statement(sql, params))
    }
}

/// Generic relational adapter: one dialect, one pool
pub struct SqlAdapter {
    dialect: Box<dyn SqlDialect>,
    pool: Arc<dyn ConnectionPool>,
    schema: String,
    column_types: HashMap<String, String>,
    type_mapping: TypeMapping,
}

impl std::fmt::Debug for SqlAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAdapter")
            .field("schema", &self.schema)
            .field("column_types", &self.column_types)
            .finish_non_exhaustive()
    }
}

impl SqlAdapter {
    /// Create an adapter writing into `schema`
    pub fn new(
        dialect: Box<dyn SqlDialect>,
        pool: Arc<dyn ConnectionPool>,
        schema: impl Into<String>,
    ) -> Self {
        let type_mapping = dialect.type_mapping();
        Self {
            dialect,
            pool,
            schema: schema.into(),
            column_types: HashMap::new(),
            type_mapping,
        }
    }

    /// Per-column SQL type overrides
    pub fn with_column_types(mut self, column_types: HashMap<String, String>) -> Self {
        self.column_types = column_types;
        self
    }

    /// Dialect in use
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Destination type
    pub fn destination_type(&self) -> DestinationType {
        self.dialect.destination()
    }

    /// Default namespace for tables
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Logical type mapping of the dialect
    pub fn type_mapping(&self) -> &TypeMapping {
        &self.type_mapping
    }

    /// Column for an inferred type, honoring configured overrides
    pub fn column_for(&self, name: &str, data_type: crate::types::DataType) -> Column {
        let column = self.type_mapping.column(data_type);
        match self.column_types.get(name) {
            Some(cast) => column.with_cast(cast.clone()),
            None => column,
        }
    }

    /// Create the default namespace when the dialect supports it
    pub async fn ensure_schema(&self) -> Result<()> {
        let Some(sql) = self.dialect.create_schema_sql(&self.schema) else {
            return Ok(());
        };
        let conn = self.pool.get().await?;
        conn.execute(&sql, &[])
            .await
            .map_err(|e| e.statement(sql.as_str(), &[]))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Tx> {
        let conn = self.pool.get().await?;
        Tx::begin(self.dialect.destination(), conn).await
    }

    // Configured overrides become the column cast type
    fn apply_overrides(&self, table: &Table) -> Table {
        let mut table = table.clone();
        for (name, column) in table.columns.iter_mut() {
            if let Some(cast) = self.column_types.get(name) {
                column.cast_type = Some(cast.clone());
            }
        }
        table
    }

    fn staging_name(table: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{table}_tmp_{}", &suffix[..10])
    }

    async fn load_table(&self, reader: &dyn SchemaReader, schema: &str, name: &str) -> Result<Table> {
        let mut table = Table::new(schema, name);

        let (sql, params) = self.dialect.columns_query(schema, name);
        for row in reader.read(&sql, &params).await? {
            if let Some(column) = row.get_string("column_name") {
                let sql_type = row.get_string("data_type").unwrap_or_default();
                table.columns.insert(column, Column::new(sql_type));
            }
        }
        if table.columns.is_empty() {
            return Ok(table);
        }

        let (sql, params) = self.dialect.primary_key_query(schema, name);
        let mut constraint = String::new();
        for row in reader.read(&sql, &params).await? {
            if let Some(name) = row.get_string("constraint_name") {
                constraint = name;
            }
            if let Some(column) = row.get_string("column_name") {
                table.pk_fields.insert(column);
            }
        }
        table.set_primary_key_name(self.dialect.normalize_primary_key_name(&constraint));
        Ok(table)
    }

    // Constraint merges must name the live key, which may predate the engine
    async fn with_live_constraint(&self, tx: &Tx, table: &Table) -> Result<Table> {
        if self.dialect.merge_strategy() != MergeStrategy::OnConflict
            || !table.primary_key_name().is_empty()
        {
            return Ok(table.clone());
        }
        let live = self.load_table(tx, &table.schema, &table.name).await?;
        if live.primary_key_name().is_empty() {
            return Ok(table.clone());
        }
        debug!(
            schema = %table.schema,
            table = %table.name,
            constraint = %live.primary_key_name(),
            "merging on live primary key constraint"
        );
        Ok(table.clone().with_primary_key_name(live.primary_key_name()))
    }

    async fn create_primary_key(&self, tx: &Tx, table: &Table) -> Result<()> {
        let sql = self.dialect.create_primary_key_sql(table)?;
        tx.execute(&sql, &[]).await?;
        Ok(())
    }

    // Column additions and primary-key drop of a patch
    async fn alter_columns(&self, tx: &Tx, patch: &Table) -> Result<()> {
        for (name, column) in &patch.columns {
            let is_pk = patch.pk_fields.contains(name);
            let sql = self.dialect.add_column_sql(patch, name, column, is_pk)?;
            tx.execute(&sql, &[]).await?;
        }
        if patch.delete_pk_fields {
            let sql = self.dialect.drop_primary_key_sql(patch)?;
            tx.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    async fn rebuild_key_columns(&self, tx: &Tx, patch: &Table) -> Result<bool> {
        let mut live = self.load_table(tx, &patch.schema, &patch.name).await?;
        self.alter_columns(tx, patch).await?;
        for (name, column) in &patch.columns {
            live.columns.insert(name.clone(), column.clone());
        }

        let statements = self
            .dialect
            .nullable_pk_recovery_sql(&live, &patch.pk_fields)?;
        if statements.is_empty() {
            return Ok(false);
        }
        for sql in &statements {
            tx.execute(sql, &[]).await?;
        }
        self.create_primary_key(tx, patch).await?;
        Ok(true)
    }

    async fn recover_nullable_pk(&self, patch: &Table, original: Error) -> Result<()> {
        warn!(
            destination = %self.dialect.destination(),
            schema = %patch.schema,
            table = %patch.name,
            error = %original.driver_message(),
            "primary key creation failed over nullable columns; rebuilding key columns as NOT NULL"
        );

        let tx = self.begin().await?;
        match self.rebuild_key_columns(&tx, patch).await {
            Ok(true) => tx.direct_commit().await,
            Ok(false) => {
                tx.rollback().await;
                Err(original)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn insert_rows(&self, tx: &Tx, table: &Table, rows: &[EventRow]) -> Result<()> {
        let columns = table.column_names();
        let chunks = plan_inserts(&columns, rows, self.dialect.max_values(), |v| {
            self.dialect.reformat_value(v)
        });
        for chunk in chunks {
            let sql = self.dialect.insert_sql(table, &columns, chunk.rows);
            tx.execute(&sql, &chunk.values).await?;
        }
        Ok(())
    }

    async fn merge_bucket(&self, tx: &Tx, table: &Table, bucket: &[EventRow]) -> Result<()> {
        let staging = table.without_pk(Self::staging_name(&table.name));
        let columns = table.column_names();

        tx.execute(&self.dialect.create_staging_table_sql(&staging)?, &[])
            .await?;
        self.insert_rows(tx, &staging, bucket).await?;
        for sql in self.dialect.merge_sql(table, &staging, &columns)? {
            tx.execute(&sql, &[]).await?;
        }
        tx.execute(&self.dialect.drop_staging_table_sql(&staging), &[])
            .await?;
        Ok(())
    }

    async fn write_rows(
        &self,
        tx: &Tx,
        table: &Table,
        rows: Vec<EventRow>,
        conditions: Option<&DeleteConditions>,
    ) -> Result<()> {
        if let Some(conditions) = conditions.filter(|c| !c.is_empty()) {
            let (sql, params) = self.dialect.delete_sql(table, conditions)?;
            tx.execute(&sql, &params).await?;
        }
        if rows.is_empty() {
            return Ok(());
        }
        if table.columns.is_empty() {
            return Err(Error::schema(format!(
                "table {}.{} has no columns to write",
                table.schema, table.name
            )));
        }

        if table.pk_fields.is_empty() {
            return self.insert_rows(tx, table, &rows).await;
        }

        let table = &self.with_live_constraint(tx, table).await?;
        for bucket in deduplicate(&table.pk_fields, rows) {
            match self.dialect.merge_strategy() {
                MergeStrategy::Append => self.insert_rows(tx, table, &bucket).await?,
                _ => self.merge_bucket(tx, table, &bucket).await?,
            }
        }
        Ok(())
    }

    async fn bulk_write(
        &self,
        table: &Table,
        rows: Vec<EventRow>,
        conditions: Option<&DeleteConditions>,
    ) -> Result<()> {
        let table = self.apply_overrides(table);
        let count = rows.len();

        let tx = self.begin().await?;
        match self.write_rows(&tx, &table, rows, conditions).await {
            Ok(()) => tx.direct_commit().await,
            Err(e) => {
                error!(
                    destination = %self.dialect.destination(),
                    schema = %table.schema,
                    table = %table.name,
                    rows = count,
                    error = %e,
                    "bulk write failed, rolling back"
                );
                tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn insert_one(&self, tx: &Tx, table: &Table, row: &EventRow) -> Result<()> {
        let columns = table.column_names();
        let values = row_values(&columns, row, |v| self.dialect.reformat_value(v));

        if table.pk_fields.is_empty() {
            let sql = self.dialect.insert_sql(table, &columns, 1);
            tx.execute(&sql, &values).await?;
            return Ok(());
        }

        match self.dialect.merge_strategy() {
            MergeStrategy::OnConflict | MergeStrategy::DuplicateKey => {
                let sql = self.dialect.upsert_sql(table, &columns)?;
                tx.execute(&sql, &values).await?;
            }
            MergeStrategy::DeleteInsert => {
                let pk_values = row_values(&table.pk_field_names(), row, |v| {
                    self.dialect.reformat_value(v)
                });
                tx.execute(&self.dialect.delete_by_pk_sql(table), &pk_values)
                    .await?;
                tx.execute(&self.dialect.insert_sql(table, &columns, 1), &values)
                    .await?;
            }
            MergeStrategy::Append => {
                tx.execute(&self.dialect.insert_sql(table, &columns, 1), &values)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for SqlAdapter {
    fn name(&self) -> String {
        self.dialect.destination().to_string()
    }

    async fn get_table_schema(&self, name: &str) -> Result<Table> {
        let conn = self.pool.get().await?;
        self.load_table(&conn, &self.schema, name).await
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let table = self.apply_overrides(table);
        let tx = self.begin().await?;

        let result = async {
            tx.execute(&self.dialect.create_table_sql(&table)?, &[])
                .await?;
            if !table.pk_fields.is_empty() && self.dialect.supports_primary_key_changes() {
                let keyed = table.clone().with_primary_key_name(table.pk_name());
                self.create_primary_key(&tx, &keyed).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.direct_commit().await?;
                info!(
                    destination = %self.dialect.destination(),
                    schema = %table.schema,
                    table = %table.name,
                    columns = table.columns.len(),
                    pk = ?table.pk_fields,
                    "created table"
                );
                Ok(())
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
        if patch.is_empty_patch() {
            return Ok(());
        }
        let mut patch = self.apply_overrides(patch);
        let changes_pk = patch.delete_pk_fields || !patch.pk_fields.is_empty();
        if changes_pk && !self.dialect.supports_primary_key_changes() {
            warn!(
                destination = %self.dialect.destination(),
                schema = %patch.schema,
                table = %patch.name,
                pk = ?patch.pk_fields,
                drop_pk = patch.delete_pk_fields,
                "destination cannot change a table's primary key, key change ignored"
            );
            patch.pk_fields.clear();
            patch.delete_pk_fields = false;
            if patch.is_empty_patch() {
                return Ok(());
            }
        }

        let tx = self.begin().await?;
        if let Err(e) = self.alter_columns(&tx, &patch).await {
            tx.rollback().await;
            return Err(e);
        }
        if !patch.pk_fields.is_empty() {
            if let Err(e) = self.create_primary_key(&tx, &patch).await {
                tx.rollback().await;
                if self.dialect.is_nullable_pk_error(&e) {
                    return self.recover_nullable_pk(&patch, e).await;
                }
                return Err(e);
            }
        }
        tx.direct_commit().await?;

        info!(
            destination = %self.dialect.destination(),
            schema = %patch.schema,
            table = %patch.name,
            added = ?patch.column_names(),
            drop_pk = patch.delete_pk_fields,
            pk = ?patch.pk_fields,
            "patched table schema"
        );
        Ok(())
    }

    async fn insert(&self, event: &EventContext) -> Result<()> {
        let table = self.apply_overrides(&event.table);
        if table.columns.is_empty() {
            return Err(Error::schema(format!(
                "table {}.{} has no columns to write",
                table.schema, table.name
            )));
        }

        let tx = self.begin().await?;
        match self.insert_one(&tx, &table, &event.row).await {
            Ok(()) => tx.direct_commit().await,
            Err(e) => {
                error!(
                    destination = %self.dialect.destination(),
                    table = %table.name,
                    event_id = event.event_id.as_deref().unwrap_or(""),
                    error = %e,
                    "insert failed, rolling back"
                );
                tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn bulk_insert(&self, table: &Table, rows: Vec<EventRow>) -> Result<()> {
        self.bulk_write(table, rows, None).await
    }

    async fn bulk_update(
        &self,
        table: &Table,
        rows: Vec<EventRow>,
        conditions: &DeleteConditions,
    ) -> Result<()> {
        self.bulk_write(table, rows, Some(conditions)).await
    }

    async fn truncate(&self, name: &str) -> Result<()> {
        let sql = self.dialect.truncate_sql(&self.schema, name);
        let conn = self.pool.get().await?;
        conn.execute(&sql, &[]).await.map_err(|e| {
            e.or_not_exist(format!("{}.{}", self.schema, name))
                .statement(sql.as_str(), &[])
        })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_name_is_unique() {
        let a = SqlAdapter::staging_name("events");
        let b = SqlAdapter::staging_name("events");
        assert!(a.starts_with("events_tmp_"));
        assert_eq!(a.len(), "events_tmp_".len() + 10);
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_context_builder() {
        let ctx = EventContext::new(Table::new("s", "t"), EventRow::new()).with_event_id("evt-1");
        assert_eq!(ctx.event_id.as_deref(), Some("evt-1"));
    }
}
