//! The access-policy subsystem.
//!
//! Policies are boolean expressions attached to models and fields in the
//! schema. Reads are rewritten: the combined predicate
//! `OR(allow) AND NOT OR(deny)` is compiled to SQL and injected into every
//! query node that touches the model (see [`compile`] and
//! [`enforce::PolicyInterceptor`]). Mutations are authorized by read-back:
//! the operation runs inside a transaction and the affected row is then
//! re-selected under the relevant predicates; failure rolls everything back.

pub mod compile;
pub mod enforce;

use crate::error::{Error, Result};
use crate::plan::RequestContext;
use crate::JsonObject;
use quarry_schema::schema::{Model, PolicyExpr, PolicyBinaryOp};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Whether the model (or any delegate ancestor) declares access policies.
/// Models without any policy are not under policy control.
pub fn model_has_policies(ctx: &RequestContext, model: &Arc<Model>) -> Result<bool> {
    for owner in ctx.ancestry(model)? {
        if !owner.policies.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evaluates a policy expression in memory against a row. Used for
/// `@@validate` row checks and field-level write gates, where the value is
/// at hand and a round-trip to the database would be wasteful.
///
/// Relation traversals, `check()` and `before()` are not available here.
pub fn eval_expr(
    model: &Model,
    expr: &PolicyExpr,
    row: &JsonObject,
    auth: Option<&JsonValue>,
    operation: &str,
) -> Result<bool> {
    let v = eval_value(model, expr, row, auth, operation)?;
    Ok(truthy(&v))
}

fn truthy(v: &JsonValue) -> bool {
    match v {
        JsonValue::Bool(b) => *b,
        JsonValue::Null => false,
        _ => true,
    }
}

fn eval_value(
    model: &Model,
    expr: &PolicyExpr,
    row: &JsonObject,
    auth: Option<&JsonValue>,
    operation: &str,
) -> Result<JsonValue> {
    let out = match expr {
        PolicyExpr::Literal { value } => value.clone(),
        PolicyExpr::Field { names } => {
            let mut current = JsonValue::Object(row.clone());
            for name in names {
                current = match current {
                    JsonValue::Object(mut obj) => {
                        obj.remove(name).unwrap_or(JsonValue::Null)
                    }
                    _ => JsonValue::Null,
                };
            }
            current
        }
        PolicyExpr::This => JsonValue::Object(row.clone()),
        PolicyExpr::Auth { names } => project(auth.cloned().unwrap_or(JsonValue::Null), names),
        PolicyExpr::CurrentModel => JsonValue::String(model.name.0.clone()),
        PolicyExpr::CurrentOperation => JsonValue::String(operation.to_owned()),
        PolicyExpr::Before { .. } | PolicyExpr::Check { .. } => {
            return Err(Error::invalid_input(vec![format!(
                "`before()`/`check()` cannot be used in this rule position"
            )]))
        }
        PolicyExpr::Not { expr } => {
            JsonValue::Bool(!eval_expr(model, expr, row, auth, operation)?)
        }
        PolicyExpr::In { expr, list } => {
            let needle = eval_value(model, expr, row, auth, operation)?;
            JsonValue::Bool(list.iter().any(|candidate| json_eq(candidate, &needle)))
        }
        PolicyExpr::Binary { op, left, right } => match op {
            PolicyBinaryOp::And => JsonValue::Bool(
                eval_expr(model, left, row, auth, operation)?
                    && eval_expr(model, right, row, auth, operation)?,
            ),
            PolicyBinaryOp::Or => JsonValue::Bool(
                eval_expr(model, left, row, auth, operation)?
                    || eval_expr(model, right, row, auth, operation)?,
            ),
            cmp => {
                let l = eval_value(model, left, row, auth, operation)?;
                let r = eval_value(model, right, row, auth, operation)?;
                JsonValue::Bool(compare(cmp, &l, &r))
            }
        },
    };
    Ok(out)
}

fn project(value: JsonValue, names: &[String]) -> JsonValue {
    let mut current = value;
    for name in names {
        current = match current {
            JsonValue::Object(mut obj) => obj.remove(name).unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        };
    }
    current
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: &PolicyBinaryOp, l: &JsonValue, r: &JsonValue) -> bool {
    match op {
        PolicyBinaryOp::Eq => json_eq(l, r),
        PolicyBinaryOp::NotEq => !json_eq(l, r),
        PolicyBinaryOp::Lt | PolicyBinaryOp::LtEq | PolicyBinaryOp::Gt | PolicyBinaryOp::GtEq => {
            match (l, r) {
                (JsonValue::String(a), JsonValue::String(b)) => match op {
                    PolicyBinaryOp::Lt => a < b,
                    PolicyBinaryOp::LtEq => a <= b,
                    PolicyBinaryOp::Gt => a > b,
                    PolicyBinaryOp::GtEq => a >= b,
                    _ => unreachable!(),
                },
                _ => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => match op {
                        PolicyBinaryOp::Lt => a < b,
                        PolicyBinaryOp::LtEq => a <= b,
                        PolicyBinaryOp::Gt => a > b,
                        PolicyBinaryOp::GtEq => a >= b,
                        _ => unreachable!(),
                    },
                    _ => false,
                },
            }
        }
        PolicyBinaryOp::And | PolicyBinaryOp::Or => unreachable!("handled by eval_value"),
    }
}
