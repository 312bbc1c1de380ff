//! Payload validation.
//!
//! Composes per-operation structural checks from the field metadata in the
//! schema: required fields, attribute constraints (`@length`, `@email`, ...),
//! enum membership, typed JSON shapes, and the `@trim`/`@lower`/`@upper`
//! transforms that run before persistence. Failures collect one message per
//! violated constraint and surface as a single invalid-input error.

use crate::error::{Error, Result};
use crate::JsonObject;
use once_cell::sync::Lazy;
use quarry_schema::schema::{
    Field, Model, PrimitiveType, Schema, Transform, Type, Validator,
};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
}

/// Applies the declared value transforms to string fields, in place.
pub fn apply_transforms(model: &Model, data: &mut JsonObject) {
    for (key, value) in data.iter_mut() {
        let field = match model.field(key) {
            Some(field) => field,
            None => continue,
        };
        if field.transforms.is_empty() {
            continue;
        }
        if let JsonValue::String(s) = value {
            let mut out = s.clone();
            for transform in &field.transforms {
                out = match transform {
                    Transform::Trim => out.trim().to_owned(),
                    Transform::Lower => out.to_lowercase(),
                    Transform::Upper => out.to_uppercase(),
                };
            }
            *value = JsonValue::String(out);
        }
    }
}

/// Validates a scalar row about to be written. For creates the row must be
/// complete: every required column either present or covered by a default.
pub fn validate_row(
    schema: &Schema,
    model: &Model,
    row: &JsonObject,
    kind: WriteKind,
) -> Result<()> {
    let mut messages: Vec<String> = vec![];

    if kind == WriteKind::Create {
        for field in model.scalar_fields() {
            if field.optional || field.default.is_some() || field.updated_at {
                continue;
            }
            let missing = match row.get(&field.name) {
                None => true,
                Some(JsonValue::Null) => true,
                Some(_) => false,
            };
            if missing {
                messages.push(format!("field `{}` is required", field.name));
            }
        }
    }

    for (key, value) in row {
        let field = match model.field(key) {
            Some(field) => field,
            None => {
                messages.push(format!(
                    "unknown field `{key}` on model `{}`",
                    model.name
                ));
                continue;
            }
        };
        if field.is_relation() || field.computed {
            messages.push(format!("field `{key}` cannot be written directly"));
            continue;
        }
        check_field_value(schema, field, value, &mut messages);
    }

    if messages.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_input(messages).with_model(model.name.as_str()))
    }
}

fn check_field_value(
    schema: &Schema,
    field: &Arc<Field>,
    value: &JsonValue,
    messages: &mut Vec<String>,
) {
    if value.is_null() {
        // An explicit null is an input error for JSON columns; the DbNull /
        // JsonNull sentinels disambiguate the intent.
        if matches!(field.scalar_type(), Some(PrimitiveType::Json)) && !field.is_list() {
            messages.push(format!(
                "field `{}`: use the DbNull or JsonNull sentinel instead of a literal null",
                field.name
            ));
            return;
        }
        if !field.optional {
            messages.push(format!("field `{}` must not be null", field.name));
        }
        return;
    }

    match &*field.type_ {
        Type::Enum(enum_name) => {
            let member = value.as_str().map_or(false, |s| {
                schema
                    .enums
                    .get(enum_name)
                    .map_or(false, |e| e.values.iter().any(|v| v == s))
            });
            if !member {
                messages.push(format!(
                    "field `{}`: `{value}` is not a member of enum `{enum_name}`",
                    field.name
                ));
            }
        }
        Type::Typedef(typedef_name) => {
            if let Some(typedef) = schema.typedefs.get(typedef_name) {
                check_json_shape(schema, typedef_name, typedef, value, &field.name, messages);
            }
        }
        Type::Array(_) => {
            if !value.is_array() {
                messages.push(format!("field `{}` must be an array", field.name));
            }
        }
        _ => {}
    }

    for validator in &field.validators {
        check_validator(field, validator, value, messages);
    }
}

fn check_validator(
    field: &Arc<Field>,
    validator: &Validator,
    value: &JsonValue,
    messages: &mut Vec<String>,
) {
    let field_name = &field.name;
    let mut fail = |msg: String| messages.push(format!("field `{field_name}`: {msg}"));

    match validator {
        Validator::Length { min, max } => {
            if let Some(s) = value.as_str() {
                let len = s.chars().count() as u64;
                if let Some(min) = min {
                    if len < *min {
                        fail(format!("must be at least {min} characters"));
                    }
                }
                if let Some(max) = max {
                    if len > *max {
                        fail(format!("must be at most {max} characters"));
                    }
                }
            }
        }
        Validator::Email => {
            if value.as_str().map_or(true, |s| !EMAIL_RE.is_match(s)) {
                fail("must be a valid email address".to_owned());
            }
        }
        Validator::Url => {
            if value.as_str().map_or(true, |s| !URL_RE.is_match(s)) {
                fail("must be a valid URL".to_owned());
            }
        }
        Validator::Datetime => {
            let ok = value
                .as_str()
                .map_or(false, |s| OffsetDateTime::parse(s, &Rfc3339).is_ok());
            if !ok {
                fail("must be an RFC 3339 datetime".to_owned());
            }
        }
        Validator::Regex { pattern } => match Regex::new(pattern) {
            Ok(re) => {
                if value.as_str().map_or(true, |s| !re.is_match(s)) {
                    fail(format!("must match /{pattern}/"));
                }
            }
            Err(_) => fail(format!("has an invalid regex constraint /{pattern}/")),
        },
        Validator::Contains { value: needle } => {
            if value.as_str().map_or(true, |s| !s.contains(needle)) {
                fail(format!("must contain `{needle}`"));
            }
        }
        Validator::StartsWith { value: prefix } => {
            if value.as_str().map_or(true, |s| !s.starts_with(prefix)) {
                fail(format!("must start with `{prefix}`"));
            }
        }
        Validator::EndsWith { value: suffix } => {
            if value.as_str().map_or(true, |s| !s.ends_with(suffix)) {
                fail(format!("must end with `{suffix}`"));
            }
        }
        Validator::Gt { value: bound } => numeric_bound(value, bound, |v, b| v > b, ">", &mut fail),
        Validator::Gte { value: bound } => {
            numeric_bound(value, bound, |v, b| v >= b, ">=", &mut fail)
        }
        Validator::Lt { value: bound } => numeric_bound(value, bound, |v, b| v < b, "<", &mut fail),
        Validator::Lte { value: bound } => {
            numeric_bound(value, bound, |v, b| v <= b, "<=", &mut fail)
        }
    }
}

fn numeric_bound(
    value: &JsonValue,
    bound: &serde_json::Number,
    cmp: impl Fn(f64, f64) -> bool,
    op: &str,
    fail: &mut impl FnMut(String),
) {
    let v = match value.as_f64() {
        Some(v) => v,
        None => {
            fail("must be a number".to_owned());
            return;
        }
    };
    let b = bound.as_f64().unwrap_or(f64::NAN);
    if !cmp(v, b) {
        fail(format!("must be {op} {bound}"));
    }
}

/// Structural check of a typed JSON value against its type-def. Extra
/// properties are allowed unless the type-def is closed.
fn check_json_shape(
    schema: &Schema,
    typedef_name: &str,
    typedef: &quarry_schema::schema::TypeDef,
    value: &JsonValue,
    path: &str,
    messages: &mut Vec<String>,
) {
    let obj = match value {
        JsonValue::Object(obj) => obj,
        _ => {
            messages.push(format!("field `{path}`: expected a `{typedef_name}` object"));
            return;
        }
    };
    for field in typedef.fields.values() {
        let nested_path = format!("{path}.{}", field.name);
        match obj.get(&field.name) {
            None | Some(JsonValue::Null) => {
                if !field.optional {
                    messages.push(format!("field `{nested_path}` is required"));
                }
            }
            Some(nested) => check_typed_value(schema, &field.type_, nested, &nested_path, messages),
        }
    }
    if typedef.closed {
        for key in obj.keys() {
            if !typedef.fields.contains_key(key) {
                messages.push(format!(
                    "field `{path}.{key}` is not part of `{typedef_name}`"
                ));
            }
        }
    }
}

fn check_typed_value(
    schema: &Schema,
    ty: &Arc<Type>,
    value: &JsonValue,
    path: &str,
    messages: &mut Vec<String>,
) {
    match &**ty {
        Type::Primitive(p) => {
            let ok = match p {
                PrimitiveType::String
                | PrimitiveType::DateTime
                | PrimitiveType::Bytes
                | PrimitiveType::Decimal => value.is_string() || value.is_number(),
                PrimitiveType::Boolean => value.is_boolean(),
                PrimitiveType::Int | PrimitiveType::BigInt | PrimitiveType::Float => {
                    value.is_number()
                }
                PrimitiveType::Json => true,
            };
            if !ok {
                messages.push(format!("field `{path}` has the wrong type"));
            }
        }
        Type::Enum(enum_name) => {
            let member = value.as_str().map_or(false, |s| {
                schema
                    .enums
                    .get(enum_name)
                    .map_or(false, |e| e.values.iter().any(|v| v == s))
            });
            if !member {
                messages.push(format!(
                    "field `{path}` is not a member of enum `{enum_name}`"
                ));
            }
        }
        Type::Typedef(name) => {
            if let Some(typedef) = schema.typedefs.get(name) {
                check_json_shape(schema, name, typedef, value, path, messages);
            }
        }
        Type::Array(inner) => match value {
            JsonValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    check_typed_value(schema, inner, item, &format!("{path}[{i}]"), messages);
                }
            }
            _ => messages.push(format!("field `{path}` must be an array")),
        },
        Type::Model(_) => {
            messages.push(format!("field `{path}` cannot reference a model"));
        }
    }
}
