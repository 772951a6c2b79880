//! Value-limit batching for multi-row inserts
//!
//! Every dialect caps the number of bound values a single statement may
//! carry. Rows are packed into `VALUES (…), (…)` statements until one more
//! row would cross the cap; a row is never split between two statements.

use crate::types::{EventRow, Value};

/// Rows that fit in one statement; a row wider than the limit travels alone
pub fn rows_per_statement(max_values: usize, columns: usize) -> usize {
    if columns == 0 {
        return 1;
    }
    (max_values / columns).max(1)
}

/// One multi-row insert: its row count and the flattened values
#[derive(Debug, Clone, PartialEq)]
pub struct InsertChunk {
    /// Number of row tuples in the statement
    pub rows: usize,
    /// Values in row-major order, `rows × columns` long
    pub values: Vec<Value>,
}

/// Flatten one row in `columns` order; missing columns bind as NULL
pub fn row_values(columns: &[&str], row: &EventRow, reformat: impl Fn(&Value) -> Value) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(*c).map(&reformat).unwrap_or(Value::Null))
        .collect()
}

/// Pack rows into statements that respect `max_values`
pub fn plan_inserts(
    columns: &[&str],
    rows: &[EventRow],
    max_values: usize,
    reformat: impl Fn(&Value) -> Value,
) -> Vec<InsertChunk> {
    let per_statement = rows_per_statement(max_values, columns.len());
    let mut chunks = Vec::with_capacity(rows.len().div_ceil(per_statement));
    let mut current = InsertChunk {
        rows: 0,
        values: Vec::new(),
    };

    for row in rows {
        if current.rows > 0 && (current.rows + 1) * columns.len() > max_values {
            chunks.push(std::mem::replace(
                &mut current,
                InsertChunk {
                    rows: 0,
                    values: Vec::new(),
                },
            ));
        }
        current.values.extend(row_values(columns, row, &reformat));
        current.rows += 1;
    }

    if current.rows > 0 {
        chunks.push(current);
    }
    chunks
}
