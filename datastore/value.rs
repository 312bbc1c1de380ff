use crate::layout::ColumnRepr;
use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use sqlx::any::{Any, AnyArguments, AnyRow};
use sqlx::Row;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// A value bound to an SQL statement parameter.
///
/// The `Any` driver supports text, bigint and double across all three
/// providers; everything richer is encoded onto these (see [`ColumnRepr`]).
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl SqlValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Human-readable form for error reporting (`sql_params`).
    pub fn display(&self) -> String {
        match self {
            Self::Null => "NULL".to_owned(),
            Self::Bool(v) => v.to_string(),
            Self::I64(v) => v.to_string(),
            Self::F64(v) => v.to_string(),
            Self::String(v) => v.clone(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(f: &str) -> Self {
        Self::String(f.to_string())
    }
}

/// Binds `args` onto an sqlx query in order.
pub fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Any, AnyArguments<'q>>,
    args: &'q [SqlValue],
) -> sqlx::query::Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v as i64),
            SqlValue::I64(v) => query.bind(*v),
            SqlValue::F64(v) => query.bind(*v),
            SqlValue::String(v) => query.bind(v.as_str()),
        };
    }
    query
}

/// Coerces a client-provided JSON value into its driver form for a column of
/// representation `repr`.
pub fn to_sql_value(repr: ColumnRepr, value: &JsonValue) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let sql_value = match repr {
        ColumnRepr::StringAsText | ColumnRepr::EnumAsText => SqlValue::String(
            value
                .as_str()
                .context("expected a string value")?
                .to_owned(),
        ),
        ColumnRepr::IntAsBigint => SqlValue::I64(
            value.as_i64().context("expected an integer value")?,
        ),
        ColumnRepr::FloatAsDouble => SqlValue::F64(
            value.as_f64().context("expected a float value")?,
        ),
        ColumnRepr::BooleanAsInt => SqlValue::I64(
            value.as_bool().context("expected a boolean value")? as i64,
        ),
        ColumnRepr::DecimalAsText => match value {
            JsonValue::String(s) => {
                s.parse::<f64>()
                    .with_context(|| format!("`{s}` is not a decimal number"))?;
                SqlValue::String(s.clone())
            }
            JsonValue::Number(n) => SqlValue::String(n.to_string()),
            _ => bail!("expected a decimal value as number or string"),
        },
        ColumnRepr::DateTimeAsText => {
            let s = value
                .as_str()
                .context("expected a DateTime as an RFC 3339 string")?;
            OffsetDateTime::parse(s, &Rfc3339)
                .with_context(|| format!("`{s}` is not a valid RFC 3339 timestamp"))?;
            SqlValue::String(s.to_owned())
        }
        // The null sentinels disambiguate writes to JSON columns: `DbNull`
        // stores SQL NULL, `JsonNull` the JSON literal `null`.
        ColumnRepr::JsonAsText => match value.as_str() {
            Some("DbNull") => SqlValue::Null,
            Some("JsonNull") => SqlValue::String("null".to_owned()),
            _ => SqlValue::String(serde_json::to_string(value)?),
        },
        ColumnRepr::BytesAsBase64 => {
            let s = value.as_str().context("expected Bytes as a base64 string")?;
            base64::decode(s).context("invalid base64 in Bytes value")?;
            SqlValue::String(s.to_owned())
        }
    };
    Ok(sql_value)
}

fn column_is_null(row: &AnyRow, column_idx: usize) -> bool {
    use sqlx::ValueRef;
    row.try_get_raw(column_idx)
        .map(|v| v.is_null())
        .unwrap_or(true)
}

/// Decodes one column of a result row back into its JSON form.
pub fn decode_column(
    row: &AnyRow,
    column_idx: usize,
    repr: ColumnRepr,
    optional: bool,
) -> Result<JsonValue> {
    if optional && column_is_null(row, column_idx) {
        return Ok(JsonValue::Null);
    }
    let value = match repr {
        ColumnRepr::StringAsText
        | ColumnRepr::EnumAsText
        | ColumnRepr::DecimalAsText
        | ColumnRepr::DateTimeAsText
        | ColumnRepr::BytesAsBase64 => {
            let val: String = row.try_get(column_idx)?;
            JsonValue::String(val)
        }
        ColumnRepr::IntAsBigint => {
            let val: i64 = row.try_get(column_idx)?;
            serde_json::json!(val)
        }
        ColumnRepr::FloatAsDouble => {
            // https://github.com/launchbadge/sqlx/issues/1596
            // sqlx gets confused if the float doesn't have decimal points.
            let val: f64 = row.get_unchecked(column_idx);
            serde_json::json!(val)
        }
        ColumnRepr::BooleanAsInt => {
            // Type information is not filled in when the value comes out of
            // an expression, and the database stores integers anyway.
            let val: i64 = row.get_unchecked(column_idx);
            JsonValue::Bool(val != 0)
        }
        ColumnRepr::JsonAsText => {
            let val: String = row.try_get(column_idx)?;
            serde_json::from_str(&val)
                .with_context(|| format!("column {column_idx} holds malformed JSON"))?
        }
    };
    Ok(value)
}

/// Re-coerces a value that arrived embedded in a JSON aggregation (to-many
/// subqueries) from its storage representation to the client shape.
pub fn reencode_from_json(repr: ColumnRepr, value: JsonValue) -> Result<JsonValue> {
    if value.is_null() {
        return Ok(JsonValue::Null);
    }
    let out = match repr {
        ColumnRepr::BooleanAsInt => match &value {
            JsonValue::Number(n) => JsonValue::Bool(n.as_i64().unwrap_or(0) != 0),
            JsonValue::Bool(_) => value,
            other => bail!("expected a stored boolean, got {other}"),
        },
        ColumnRepr::JsonAsText => match value {
            JsonValue::String(s) => {
                serde_json::from_str(&s).context("malformed JSON in aggregated column")?
            }
            // Some providers re-emit nested JSON structurally.
            other => other,
        },
        _ => value,
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitive_coercions() {
        assert_eq!(
            to_sql_value(ColumnRepr::BooleanAsInt, &json!(true)).unwrap(),
            SqlValue::I64(1)
        );
        assert_eq!(
            to_sql_value(ColumnRepr::DecimalAsText, &json!("10.25")).unwrap(),
            SqlValue::String("10.25".to_owned())
        );
        assert_eq!(
            to_sql_value(ColumnRepr::DecimalAsText, &json!(3.5)).unwrap(),
            SqlValue::String("3.5".to_owned())
        );
        assert_eq!(
            to_sql_value(ColumnRepr::JsonAsText, &json!({"a": [1, 2]})).unwrap(),
            SqlValue::String(r#"{"a":[1,2]}"#.to_owned())
        );
        assert!(to_sql_value(ColumnRepr::IntAsBigint, &json!("nope")).is_err());
        assert!(to_sql_value(ColumnRepr::DateTimeAsText, &json!("not a date")).is_err());
        assert!(
            to_sql_value(ColumnRepr::DateTimeAsText, &json!("2023-01-15T10:30:00Z")).is_ok()
        );
        assert!(to_sql_value(ColumnRepr::BytesAsBase64, &json!("aGVsbG8=")).is_ok());
        assert!(to_sql_value(ColumnRepr::BytesAsBase64, &json!("!!!")).is_err());
    }

    #[test]
    fn null_passes_through() {
        assert_eq!(
            to_sql_value(ColumnRepr::StringAsText, &JsonValue::Null).unwrap(),
            SqlValue::Null
        );
    }
}
