//! Table schema model and schema diffing
//!
//! A [`Table`] is both the live schema read from a destination and the schema
//! a batch requires. [`Table::diff`] turns the pair into a patch `Table` that
//! lists only the columns to add and the primary-key transition to perform.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// A physical column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// SQL type as spelled by the destination
    pub sql_type: String,
    /// Type used to cast bound placeholders, when it differs from `sql_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast_type: Option<String>,
}

impl Column {
    /// Create a column with the given SQL type
    pub fn new(sql_type: impl Into<String>) -> Self {
        Self {
            sql_type: sql_type.into(),
            cast_type: None,
        }
    }

    /// Set the placeholder cast type
    pub fn with_cast(mut self, cast_type: impl Into<String>) -> Self {
        self.cast_type = Some(cast_type.into());
        self
    }
}

/// Who owns a table's primary-key constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryKeyOwnership {
    /// Created by this engine (or absent); transitions are applied
    #[default]
    Managed,
    /// Named by someone else; primary-key transitions are ignored
    External,
}

/// Table schema, or a schema patch when produced by [`Table::diff`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    /// Destination namespace (schema or database)
    pub schema: String,
    /// Table name
    pub name: String,
    /// Columns by name, iterated in name order
    pub columns: BTreeMap<String, Column>,
    /// Columns forming the primary key
    pub pk_fields: BTreeSet<String>,
    /// Patch-only instruction: drop the existing primary key
    pub delete_pk_fields: bool,
    primary_key_name: String,
    pk_ownership: PrimaryKeyOwnership,
}

impl Table {
    /// Create an empty table
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a column
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    /// Set the primary-key fields
    pub fn with_pk_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the primary-key constraint name as reported by the destination
    pub fn with_primary_key_name(mut self, name: impl Into<String>) -> Self {
        self.set_primary_key_name(name);
        self
    }

    /// Set the constraint name and classify its ownership.
    ///
    /// An empty name or the engine's own deterministic name is managed;
    /// anything else was created outside the engine.
    pub fn set_primary_key_name(&mut self, name: impl Into<String>) {
        self.primary_key_name = name.into();
        self.pk_ownership =
            if self.primary_key_name.is_empty() || self.primary_key_name == self.pk_name() {
                PrimaryKeyOwnership::Managed
            } else {
                PrimaryKeyOwnership::External
            };
    }

    /// Primary-key constraint name (may be empty)
    pub fn primary_key_name(&self) -> &str {
        &self.primary_key_name
    }

    /// Ownership of the primary-key constraint
    pub fn pk_ownership(&self) -> PrimaryKeyOwnership {
        self.pk_ownership
    }

    /// Deterministic constraint name: `schema_table_pk`
    pub fn pk_name(&self) -> String {
        build_constraint_name(&self.schema, &self.name)
    }

    /// Whether the table exists: it has columns, a primary key, or a pending
    /// primary-key drop.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty() || !self.pk_fields.is_empty() || self.delete_pk_fields
    }

    /// Whether a patch carries no change at all
    pub fn is_empty_patch(&self) -> bool {
        !self.exists()
    }

    /// Column names in a stable order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// Primary-key fields in a stable order
    pub fn pk_field_names(&self) -> Vec<&str> {
        self.pk_fields.iter().map(String::as_str).collect()
    }

    /// Copy of the table without its primary key, used for staging tables
    pub fn without_pk(&self, name: impl Into<String>) -> Self {
        Self {
            schema: self.schema.clone(),
            name: name.into(),
            columns: self.columns.clone(),
            ..Default::default()
        }
    }

    /// Compute the patch that brings `self` (the live table) to `desired`.
    ///
    /// Only column presence is compared; a column whose type changed is not
    /// reported.
    pub fn diff(&self, desired: &Table) -> Table {
        let mut patch = Table::new(desired.schema.clone(), desired.name.clone());
        if !desired.exists() {
            return patch;
        }

        for (name, column) in &desired.columns {
            if !self.columns.contains_key(name) {
                patch.columns.insert(name.clone(), column.clone());
            }
        }

        if self.pk_ownership == PrimaryKeyOwnership::External {
            warn!(
                schema = %self.schema,
                table = %self.name,
                constraint = %self.primary_key_name,
                "table has a primary key created outside of rivven; primary key configuration is ignored for this table"
            );
            return patch;
        }

        let has_pk = !self.pk_fields.is_empty();
        let wants_pk = !desired.pk_fields.is_empty();
        match (has_pk, wants_pk) {
            (true, false) => {
                patch.delete_pk_fields = true;
                patch.primary_key_name = self.primary_key_name.clone();
            }
            (false, true) => {
                patch.pk_fields = desired.pk_fields.clone();
                patch.primary_key_name = desired.pk_name();
            }
            (true, true) if self.pk_fields != desired.pk_fields => {
                patch.delete_pk_fields = true;
                patch.pk_fields = desired.pk_fields.clone();
                patch.primary_key_name = desired.pk_name();
            }
            _ => {}
        }

        patch
    }
}

/// Build the deterministic primary-key constraint name for a table
pub fn build_constraint_name(schema: &str, table: &str) -> String {
    format!("{schema}_{table}_pk")
}
