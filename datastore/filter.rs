use crate::error::{Error, Result};
use crate::expr::{
    BinaryExpr, BinaryOp, Expr, JsonTest, JsonTestOp, ListTest, ListTestKind, Literal,
    PropertyAccess, RelationTest,
};
use crate::plan::{json_literal, RequestContext};
use quarry_schema::schema::{Field, Model, PrimitiveType, Type};
use serde_json::Value as JsonValue;
use std::sync::Arc;

const MAX_FILTER_DEPTH: u32 = 100;

/// Translates a `where` argument into a filter expression over `model`.
pub fn where_to_expr(
    ctx: &RequestContext,
    model: &Arc<Model>,
    value: &JsonValue,
) -> Result<Expr> {
    to_expr_rec(ctx, model, 0, value)
}

fn to_expr_rec(
    ctx: &RequestContext,
    model: &Arc<Model>,
    depth: u32,
    value: &JsonValue,
) -> Result<Expr> {
    if depth > MAX_FILTER_DEPTH {
        return Err(Error::invalid_input(vec![format!(
            "reached maximum filter recursion depth of {MAX_FILTER_DEPTH}"
        )]));
    }

    let filter_obj = match value {
        JsonValue::Object(obj) => obj,
        JsonValue::Null => return Ok(Expr::constant(true)),
        _ => {
            return Err(Error::invalid_input(vec![
                "filter value is not an object".to_owned(),
            ]))
        }
    };

    let mut expr = Expr::constant(true);
    for (key, value) in filter_obj {
        let e = match key.as_str() {
            "AND" => {
                let mut acc = Expr::constant(true);
                for operand in combinator_operands(key, value)? {
                    acc = BinaryExpr::and(acc, to_expr_rec(ctx, model, depth + 1, operand)?);
                }
                acc
            }
            "OR" => {
                let mut acc = Expr::constant(false);
                for operand in combinator_operands(key, value)? {
                    acc = BinaryExpr::or(acc, to_expr_rec(ctx, model, depth + 1, operand)?);
                }
                acc
            }
            "NOT" => {
                let mut acc = Expr::constant(true);
                for operand in combinator_operands(key, value)? {
                    acc = BinaryExpr::and(acc, to_expr_rec(ctx, model, depth + 1, operand)?);
                }
                Expr::not(acc)
            }
            field_name => {
                let (_, field) = ctx.lookup_field(model, field_name)?.ok_or_else(|| {
                    Error::invalid_input(vec![format!(
                        "model `{}` has no field named `{field_name}`",
                        model.name
                    )])
                })?;
                field_filter(ctx, model, &field, depth, value)?
            }
        };
        expr = BinaryExpr::and(expr, e);
    }
    Ok(expr)
}

/// `AND`/`OR`/`NOT` accept a single filter object or an array of them.
fn combinator_operands<'v>(
    key: &str,
    value: &'v JsonValue,
) -> Result<Vec<&'v JsonValue>> {
    match value {
        JsonValue::Array(items) => Ok(items.iter().collect()),
        JsonValue::Object(_) => Ok(vec![value]),
        _ => Err(Error::invalid_input(vec![format!(
            "operator `{key}` must be used with an object or an array"
        )])),
    }
}

fn field_filter(
    ctx: &RequestContext,
    model: &Arc<Model>,
    field: &Arc<Field>,
    depth: u32,
    value: &JsonValue,
) -> Result<Expr> {
    if field.is_relation() {
        return relation_filter(ctx, model, field, depth, value);
    }
    match &*field.type_ {
        Type::Primitive(PrimitiveType::Json) | Type::Typedef(_) => json_filter(field, value),
        Type::Array(_) => list_filter(field, value),
        _ => scalar_filter(field, value),
    }
}

fn scalar_filter(field: &Arc<Field>, value: &JsonValue) -> Result<Expr> {
    let property = || PropertyAccess::chain(&[field.name.clone()]);

    let ops = match value {
        JsonValue::Object(obj) => obj,
        // Shorthand: a bare value means equality.
        JsonValue::Null => return Ok(Expr::is_null(property(), false)),
        _ => {
            return Ok(BinaryExpr::eq(property(), json_literal(value)?.into()));
        }
    };

    let insensitive = ops
        .get("mode")
        .and_then(|m| m.as_str())
        .map_or(false, |m| m == "insensitive");

    let mut expr = Expr::constant(true);
    for (op_name, op_value) in ops {
        let e = match op_name.as_str() {
            "mode" => continue,
            "equals" => match op_value {
                JsonValue::Null => Expr::is_null(property(), false),
                _ => BinaryExpr::eq(property(), json_literal(op_value)?.into()),
            },
            "not" => match op_value {
                JsonValue::Null => Expr::is_null(property(), true),
                JsonValue::Object(_) => {
                    Expr::not(scalar_filter(field, op_value)?)
                }
                _ => BinaryExpr::new(
                    BinaryOp::NotEq,
                    property(),
                    json_literal(op_value)?.into(),
                )
                .into(),
            },
            "in" => Expr::In {
                expr: Box::new(property()),
                list: literal_list(op_value)?,
                negated: false,
            },
            "notIn" => Expr::In {
                expr: Box::new(property()),
                list: literal_list(op_value)?,
                negated: true,
            },
            "lt" => comparison(BinaryOp::Lt, property(), op_value)?,
            "lte" => comparison(BinaryOp::LtEq, property(), op_value)?,
            "gt" => comparison(BinaryOp::Gt, property(), op_value)?,
            "gte" => comparison(BinaryOp::GtEq, property(), op_value)?,
            "contains" => string_pattern(property(), op_value, insensitive, true, true)?,
            "startsWith" => string_pattern(property(), op_value, insensitive, false, true)?,
            "endsWith" => string_pattern(property(), op_value, insensitive, true, false)?,
            other => {
                return Err(Error::invalid_input(vec![format!(
                    "unknown filter operator `{other}` on field `{}`",
                    field.name
                )]))
            }
        };
        expr = BinaryExpr::and(expr, e);
    }
    Ok(expr)
}

fn comparison(op: BinaryOp, property: Expr, value: &JsonValue) -> Result<Expr> {
    Ok(BinaryExpr::new(op, property, json_literal(value)?.into()).into())
}

/// Escapes LIKE wildcards with `!`, matching the `ESCAPE '!'` clause the
/// renderer emits.
fn escape_like(value: &str) -> String {
    value
        .replace('!', "!!")
        .replace('%', "!%")
        .replace('_', "!_")
}

fn string_pattern(
    property: Expr,
    value: &JsonValue,
    insensitive: bool,
    prefix_wildcard: bool,
    suffix_wildcard: bool,
) -> Result<Expr> {
    let needle = value.as_str().ok_or_else(|| {
        Error::invalid_input(vec!["string filters require a string value".to_owned()])
    })?;
    let mut pattern = String::new();
    if prefix_wildcard {
        pattern.push('%');
    }
    pattern.push_str(&escape_like(needle));
    if suffix_wildcard {
        pattern.push('%');
    }
    let op = if insensitive { BinaryOp::ILike } else { BinaryOp::Like };
    Ok(BinaryExpr::new(op, property, Literal::String(pattern).into()).into())
}

fn literal_list(value: &JsonValue) -> Result<Vec<Literal>> {
    let items = value.as_array().ok_or_else(|| {
        Error::invalid_input(vec!["`in`/`notIn` require an array".to_owned()])
    })?;
    items.iter().map(json_literal).collect()
}

fn relation_filter(
    ctx: &RequestContext,
    model: &Arc<Model>,
    field: &Arc<Field>,
    depth: u32,
    value: &JsonValue,
) -> Result<Expr> {
    let target_name = field.relation_target().ok_or_else(|| {
        Error::internal(anyhow::anyhow!("relation field without target"))
    })?;
    let target = ctx.model(target_name)?;
    let _ = model;

    let obj = match value {
        JsonValue::Object(obj) => obj,
        JsonValue::Null => {
            // `relation: null` means the relation is absent.
            return Ok(Expr::Exists(Box::new(RelationTest {
                relation: field.name.clone(),
                filter: None,
                negated: true,
                all: false,
            })));
        }
        _ => {
            return Err(Error::invalid_input(vec![format!(
                "relation filter on `{}` must be an object",
                field.name
            )]))
        }
    };

    let keywords = ["some", "every", "none", "is", "isNot"];
    let has_keyword = obj.keys().any(|k| keywords.contains(&k.as_str()));
    if !has_keyword {
        // Shorthand for to-one relations: a bare filter object means `is`.
        let filter = to_expr_rec(ctx, &target, depth + 1, value)?;
        return Ok(Expr::Exists(Box::new(RelationTest {
            relation: field.name.clone(),
            filter: Some(filter),
            negated: false,
            all: false,
        })));
    }

    let mut expr = Expr::constant(true);
    for (key, inner) in obj {
        let test = match key.as_str() {
            "some" | "is" => RelationTest {
                relation: field.name.clone(),
                filter: filter_or_none(ctx, &target, depth, inner)?,
                negated: false,
                all: false,
            },
            "none" | "isNot" => RelationTest {
                relation: field.name.clone(),
                filter: filter_or_none(ctx, &target, depth, inner)?,
                negated: true,
                all: false,
            },
            "every" => RelationTest {
                relation: field.name.clone(),
                filter: Some(to_expr_rec(ctx, &target, depth + 1, inner)?),
                negated: false,
                all: true,
            },
            other => {
                return Err(Error::invalid_input(vec![format!(
                    "unknown relation filter `{other}` on `{}`",
                    field.name
                )]))
            }
        };
        // `is: null` / `isNot: null` test bare existence.
        let test = if inner.is_null() {
            match key.as_str() {
                "is" => RelationTest {
                    relation: field.name.clone(),
                    filter: None,
                    negated: true,
                    all: false,
                },
                "isNot" => RelationTest {
                    relation: field.name.clone(),
                    filter: None,
                    negated: false,
                    all: false,
                },
                _ => test,
            }
        } else {
            test
        };
        expr = BinaryExpr::and(expr, Expr::Exists(Box::new(test)));
    }
    Ok(expr)
}

fn filter_or_none(
    ctx: &RequestContext,
    target: &Arc<Model>,
    depth: u32,
    value: &JsonValue,
) -> Result<Option<Expr>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(to_expr_rec(ctx, target, depth + 1, value)?))
}

/// The JSON null sentinels: `DbNull` is the SQL NULL, `JsonNull` the JSON
/// literal `null`, `AnyNull` either.
fn null_sentinel(value: &JsonValue) -> Option<JsonTestOp> {
    match value.as_str()? {
        "DbNull" => Some(JsonTestOp::IsDbNull),
        "JsonNull" => Some(JsonTestOp::IsJsonNull),
        "AnyNull" => Some(JsonTestOp::IsAnyNull),
        _ => None,
    }
}

fn json_filter(field: &Arc<Field>, value: &JsonValue) -> Result<Expr> {
    let obj = match value {
        JsonValue::Object(obj) => obj,
        _ => {
            return Err(Error::invalid_input(vec![format!(
                "JSON filter on `{}` must be an object",
                field.name
            )]))
        }
    };

    let path: Vec<String> = match obj.get("path") {
        None => vec![],
        Some(JsonValue::Array(parts)) => parts
            .iter()
            .map(|p| {
                p.as_str().map(|s| s.to_owned()).ok_or_else(|| {
                    Error::invalid_input(vec!["JSON path segments must be strings".to_owned()])
                })
            })
            .collect::<Result<_>>()?,
        Some(_) => {
            return Err(Error::invalid_input(vec![
                "JSON `path` must be an array of strings".to_owned(),
            ]))
        }
    };

    let mut expr = Expr::constant(true);
    for (op_name, op_value) in obj {
        let op = match op_name.as_str() {
            "path" => continue,
            "equals" => match null_sentinel(op_value) {
                Some(sentinel) => sentinel,
                None => JsonTestOp::Equals(op_value.clone()),
            },
            "not" => match null_sentinel(op_value) {
                Some(JsonTestOp::IsDbNull) => {
                    expr = BinaryExpr::and(
                        expr,
                        Expr::is_null(
                            PropertyAccess::chain(&[field.name.clone()]),
                            true,
                        ),
                    );
                    continue;
                }
                Some(_) => {
                    return Err(Error::invalid_input(vec![
                        "only DbNull can be negated in a JSON filter".to_owned(),
                    ]))
                }
                None => JsonTestOp::NotEquals(op_value.clone()),
            },
            "array_contains" => JsonTestOp::ArrayContains(op_value.clone()),
            other => {
                return Err(Error::invalid_input(vec![format!(
                    "unknown JSON filter operator `{other}` on `{}`",
                    field.name
                )]))
            }
        };
        expr = BinaryExpr::and(
            expr,
            Expr::JsonTest(Box::new(JsonTest {
                property: field.name.clone(),
                path: path.clone(),
                op,
            })),
        );
    }
    Ok(expr)
}

fn list_filter(field: &Arc<Field>, value: &JsonValue) -> Result<Expr> {
    let obj = match value {
        JsonValue::Object(obj) => obj,
        _ => {
            return Err(Error::invalid_input(vec![format!(
                "list filter on `{}` must be an object",
                field.name
            )]))
        }
    };

    let mut expr = Expr::constant(true);
    for (op_name, op_value) in obj {
        let test = match op_name.as_str() {
            "has" => ListTest {
                property: field.name.clone(),
                kind: ListTestKind::Has,
                values: vec![json_literal(op_value)?],
            },
            "hasSome" => ListTest {
                property: field.name.clone(),
                kind: ListTestKind::HasSome,
                values: literal_list(op_value)?,
            },
            "hasEvery" => ListTest {
                property: field.name.clone(),
                kind: ListTestKind::HasEvery,
                values: literal_list(op_value)?,
            },
            "isEmpty" => {
                let want_empty = op_value.as_bool().unwrap_or(true);
                let test = Expr::ListTest(Box::new(ListTest {
                    property: field.name.clone(),
                    kind: ListTestKind::IsEmpty,
                    values: vec![],
                }));
                expr = BinaryExpr::and(
                    expr,
                    if want_empty { test } else { Expr::not(test) },
                );
                continue;
            }
            "equals" => {
                // whole-list equality compares the canonical JSON encoding
                expr = BinaryExpr::and(
                    expr,
                    Expr::JsonTest(Box::new(JsonTest {
                        property: field.name.clone(),
                        path: vec![],
                        op: JsonTestOp::Equals(op_value.clone()),
                    })),
                );
                continue;
            }
            other => {
                return Err(Error::invalid_input(vec![format!(
                    "unknown list filter operator `{other}` on `{}`",
                    field.name
                )]))
            }
        };
        expr = BinaryExpr::and(expr, Expr::ListTest(Box::new(test)));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("50%_done!"), "50!%!_done!!");
    }
}
