//! Delete conditions applied before an overwrite-by-chunk bulk write

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Value;

/// How conditions are joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinOperator {
    /// All conditions must hold
    #[default]
    And,
    /// Any condition may hold
    Or,
}

impl JoinOperator {
    /// SQL keyword
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// A single `field <op> value` predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteCondition {
    /// Column name
    pub field: String,
    /// Operator: a comparison, `LIKE`, `[NOT] IN` or `IS [NOT]`
    pub op: String,
    /// Right-hand value: a JSON array for `IN`, null for `IS`
    pub value: Value,
}

/// Ordered delete predicates plus their join operator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteConditions {
    /// Predicates in order
    pub conditions: Vec<DeleteCondition>,
    /// How predicates are joined
    #[serde(default)]
    pub join: JoinOperator,
}

const COMPARISON_OPERATORS: &[&str] = &["=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE"];

impl DeleteConditions {
    /// Conditions joined with `AND`
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditions joined with `OR`
    pub fn any() -> Self {
        Self {
            conditions: Vec::new(),
            join: JoinOperator::Or,
        }
    }

    /// Single equality condition, the common time-chunk case
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with_condition(field, "=", value)
    }

    /// Append a condition
    pub fn with_condition(
        mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.conditions.push(DeleteCondition {
            field: field.into(),
            op: op.into(),
            value: value.into(),
        });
        self
    }

    /// Whether there is nothing to delete
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Render the `WHERE` body.
    ///
    /// `quote` quotes a column name and `placeholder` renders the n-th
    /// (1-based) parameter. Operators are checked against a fixed list since
    /// they are spliced into the statement text. `IN` and `NOT IN` take a JSON
    /// array and bind one parameter per element; `IS` and `IS NOT` only
    /// accept a null value and bind nothing.
    pub fn to_where_clause(
        &self,
        quote: impl Fn(&str) -> String,
        placeholder: impl Fn(usize) -> String,
    ) -> Result<(String, Vec<Value>)> {
        let mut parts = Vec::with_capacity(self.conditions.len());
        let mut values = Vec::with_capacity(self.conditions.len());

        for condition in &self.conditions {
            let op = condition.op.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
            let column = quote(&condition.field);

            match op.as_str() {
                "IN" | "NOT IN" => {
                    let elements = in_list(condition)?;
                    let placeholders: Vec<String> = elements
                        .into_iter()
                        .map(|v| {
                            values.push(v);
                            placeholder(values.len())
                        })
                        .collect();
                    parts.push(format!("{column} {op} ({})", placeholders.join(", ")));
                }
                "IS" | "IS NOT" => {
                    if !condition.value.is_null() {
                        return Err(Error::unsupported(format!(
                            "delete condition '{} {}' only accepts a null value",
                            condition.field, condition.op
                        )));
                    }
                    parts.push(format!("{column} {op} NULL"));
                }
                _ if COMPARISON_OPERATORS.contains(&op.as_str()) => {
                    values.push(condition.value.clone());
                    parts.push(format!("{column} {op} {}", placeholder(values.len())));
                }
                _ => {
                    return Err(Error::unsupported(format!(
                        "delete condition operator '{}' is not supported",
                        condition.op
                    )))
                }
            }
        }

        let separator = format!(" {} ", self.join.as_sql());
        Ok((parts.join(&separator), values))
    }
}

// Elements of an `IN` list, given as a non-empty JSON array of scalars
fn in_list(condition: &DeleteCondition) -> Result<Vec<Value>> {
    let invalid = || {
        Error::unsupported(format!(
            "delete condition '{} {}' needs a non-empty array of scalars",
            condition.field, condition.op
        ))
    };
    let Value::Json(serde_json::Value::Array(items)) = &condition.value else {
        return Err(invalid());
    };
    if items.is_empty() {
        return Err(invalid());
    }
    items
        .iter()
        .map(|item| match Value::from(item.clone()) {
            Value::Null | Value::Json(_) => Err(invalid()),
            scalar => Ok(scalar),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause_and() {
        let conditions = DeleteConditions::eq("_time_chunk", "2024-01-01")
            .with_condition("source", "=", "web");
        let (sql, values) = conditions
            .to_where_clause(|c| format!("\"{c}\""), |i| format!("${i}"))
            .unwrap();

        assert_eq!(sql, "\"_time_chunk\" = $1 AND \"source\" = $2");
        assert_eq!(values, vec![Value::from("2024-01-01"), Value::from("web")]);
    }

    #[test]
    fn test_where_clause_or() {
        let conditions = DeleteConditions::any()
            .with_condition("a", ">=", 1_i64)
            .with_condition("b", "like", "x%");
        let (sql, _) = conditions
            .to_where_clause(|c| format!("`{c}`"), |_| "?".to_string())
            .unwrap();

        assert_eq!(sql, "`a` >= ? OR `b` LIKE ?");
    }

    #[test]
    fn test_rejects_unknown_operator() {
        let conditions = DeleteConditions::new().with_condition("a", "; DROP TABLE x; --", 1_i64);
        let err = conditions
            .to_where_clause(|c| c.to_string(), |_| "?".to_string())
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn test_in_binds_each_element() {
        let conditions = DeleteConditions::new()
            .with_condition("day", "IN", serde_json::json!(["2024-01-01", "2024-01-02"]))
            .with_condition("shard", "=", 3_i64);
        let (sql, values) = conditions
            .to_where_clause(|c| format!("\"{c}\""), |i| format!("${i}"))
            .unwrap();

        assert_eq!(sql, "\"day\" IN ($1, $2) AND \"shard\" = $3");
        assert_eq!(
            values,
            vec![Value::from("2024-01-01"), Value::from("2024-01-02"), Value::Int64(3)]
        );
    }

    #[test]
    fn test_not_in_requires_array() {
        let (sql, values) = DeleteConditions::new()
            .with_condition("id", "not  in", serde_json::json!([1, 2]))
            .to_where_clause(|c| format!("`{c}`"), |_| "?".to_string())
            .unwrap();
        assert_eq!(sql, "`id` NOT IN (?, ?)");
        assert_eq!(values, vec![Value::Int64(1), Value::Int64(2)]);

        for value in [Value::Int64(1), Value::Json(serde_json::json!([]))] {
            let err = DeleteConditions::new()
                .with_condition("id", "IN", value)
                .to_where_clause(|c| c.to_string(), |_| "?".to_string())
                .unwrap_err();
            assert!(matches!(err, Error::Unsupported { .. }));
        }
    }

    #[test]
    fn test_is_null_binds_nothing() {
        let conditions = DeleteConditions::new()
            .with_condition("deleted_at", "IS", Value::Null)
            .with_condition("source", "is not", Value::Null)
            .with_condition("day", "=", "2024-01-01");
        let (sql, values) = conditions
            .to_where_clause(|c| format!("\"{c}\""), |i| format!("${i}"))
            .unwrap();

        assert_eq!(
            sql,
            "\"deleted_at\" IS NULL AND \"source\" IS NOT NULL AND \"day\" = $1"
        );
        assert_eq!(values, vec![Value::from("2024-01-01")]);
    }

    #[test]
    fn test_is_rejects_non_null() {
        let err = DeleteConditions::new()
            .with_condition("flag", "IS", true)
            .to_where_clause(|c| c.to_string(), |_| "?".to_string())
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn test_deserialize() {
        let conditions: DeleteConditions = serde_json::from_str(
            r#"{"conditions":[{"field":"chunk","op":"=","value":{"String":"c1"}}],"join":"OR"}"#,
        )
        .unwrap();
        assert_eq!(conditions.join, JoinOperator::Or);
        assert!(!conditions.is_empty());
    }
}
