//! Identifier quoting and literal escaping
//!
//! Column names come from untrusted event payloads, so every identifier is
//! quoted and every embedded quote doubled. Destinations reached over HTTP
//! (ClickHouse, Snowflake) take no bound parameters; for those the values are
//! rendered as escaped literals by [`inline_params`].

use crate::error::{Error, Result};
use crate::types::Value;

/// Quote an identifier, doubling any embedded quote character.
///
/// ```
/// use rivven_loader::security::quote_identifier;
///
/// assert_eq!(quote_identifier("users", '"'), "\"users\"");
/// assert_eq!(quote_identifier("we\"ird", '"'), "\"we\"\"ird\"");
/// assert_eq!(quote_identifier("a`b", '`'), "`a``b`");
/// ```
pub fn quote_identifier(name: &str, quote: char) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push(quote);
    for c in name.chars() {
        if c == quote {
            out.push(quote);
        }
        out.push(c);
    }
    out.push(quote);
    out
}

/// Validate a schema or database name from configuration.
///
/// Must start with an ASCII letter or underscore and contain only ASCII
/// alphanumerics, underscores or `$`, at most 255 characters.
pub fn validate_sql_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }
    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "invalid SQL identifier '{name}': must start with a letter or underscore"
            )))
        }
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '$') {
        return Err(Error::config(format!(
            "invalid SQL identifier '{name}': contains invalid character '{c}'"
        )));
    }
    Ok(())
}

/// Escape a string for a single-quoted SQL literal.
///
/// ```
/// use rivven_loader::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Validate a SQL type spelling before it is spliced into DDL.
///
/// Allows letters, digits, underscores, spaces, parentheses, commas, periods
/// and single quotes (`DECIMAL(10,2)`, `Nullable(String)`,
/// `DOUBLE PRECISION`).
pub fn validate_sql_type_name(type_name: &str) -> Result<()> {
    if type_name.trim().is_empty() {
        return Err(Error::schema("SQL type name cannot be empty"));
    }
    if type_name.len() > 255 {
        return Err(Error::schema(format!(
            "SQL type name too long: {} chars (max 255)",
            type_name.len()
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || " _(),.'".contains(c);
    if let Some(c) = type_name.chars().find(|c| !allowed(*c)) {
        return Err(Error::schema(format!(
            "invalid SQL type '{type_name}': contains invalid character '{c}'"
        )));
    }
    if type_name.contains("--") {
        return Err(Error::schema(format!(
            "invalid SQL type '{type_name}': contains comment sequence"
        )));
    }
    Ok(())
}

/// How literals are rendered for a destination without bound parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralStyle {
    /// Render booleans as `1`/`0`
    pub bool_as_int: bool,
    /// Backslash is an escape character inside string literals
    pub backslash_escapes: bool,
}

/// Render a value as a SQL literal
pub fn render_literal(value: &Value, style: LiteralStyle) -> String {
    let quoted = |s: &str| {
        let mut escaped = escape_string_literal(s);
        if style.backslash_escapes {
            escaped = escaped.replace('\\', "\\\\");
        }
        format!("'{escaped}'")
    };

    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) if style.bool_as_int => if *b { "1" } else { "0" }.to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int16(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal(_) => {
            value.to_string()
        }
        Value::Float64(f) if f.is_finite() => value.to_string(),
        Value::Float64(_) => "NULL".to_string(),
        Value::DateTimeTz(dt) => quoted(&dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        Value::DateTime(dt) => quoted(&dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        other => quoted(&other.to_string()),
    }
}

/// Replace `?` placeholders outside quoted sections with rendered literals.
///
/// Fails when the number of placeholders and values differ.
pub fn inline_params(sql: &str, params: &[Value], style: LiteralStyle) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut values = params.iter();
    let mut in_quote: Option<char> = None;

    for c in sql.chars() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' || c == '`' => in_quote = Some(c),
            None if c == '?' => {
                let value = values.next().ok_or_else(|| {
                    Error::query_with_sql("more placeholders than parameters", sql)
                })?;
                out.push_str(&render_literal(value, style));
                continue;
            }
            None => {}
        }
        out.push(c);
    }

    if values.next().is_some() {
        return Err(Error::query_with_sql("more parameters than placeholders", sql));
    }
    Ok(out)
}
