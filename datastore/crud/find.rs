use super::args::FindArgs;
use super::{or_rollback, unique_where_expr};
use crate::client::ClientCore;
use crate::error::{Error, Result};
use crate::filter;
use crate::mutation::QueryNode;
use crate::plan::{self, QueryOp, QueryPlan, SortBy, SortKey};
use crate::JsonObject;
use quarry_schema::schema::Model;
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub async fn find_many(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let args = FindArgs::parse(args)?;
    let rows = run_find(core, model, &args, "findMany").await?;
    Ok(JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect()))
}

/// `findFirst` is compiled as `findMany` with `take = 1`.
pub async fn find_first(
    core: &ClientCore,
    model: &Arc<Model>,
    args: JsonValue,
    or_throw: bool,
) -> Result<JsonValue> {
    let mut args = FindArgs::parse(args)?;
    args.take = Some(1);
    args.distinct = None;
    let mut rows = run_find(core, model, &args, "findFirst").await?;
    first_or_optional(model, rows.pop(), or_throw)
}

pub async fn find_unique(
    core: &ClientCore,
    model: &Arc<Model>,
    args: JsonValue,
    or_throw: bool,
) -> Result<JsonValue> {
    let args = FindArgs::parse(args)?;
    let where_ = args
        .where_
        .as_ref()
        .and_then(|w| w.as_object())
        .ok_or_else(|| Error::invalid_input(vec!["`where` is required".to_owned()]))?;

    let rcx = core.request_context("findUnique", true);
    let unique_expr = unique_where_expr(&rcx, model, where_)?;
    let mut plan = QueryPlan::build(&rcx, model, &args.selection(), true)?;
    plan.push_filter(unique_expr);
    plan.extend_operators(vec![QueryOp::Take { count: 1 }]);

    let scope = core.begin_scope().await?;
    let result = async {
        core.run_node(
            &scope.tr,
            &rcx,
            model.name.as_str(),
            "findUnique",
            QueryNode::Select(plan),
        )
        .await?
        .into_rows()
    }
    .await;
    let (mut rows, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    first_or_optional(model, rows.pop(), or_throw)
}

fn first_or_optional(
    model: &Model,
    row: Option<JsonObject>,
    or_throw: bool,
) -> Result<JsonValue> {
    match row {
        Some(row) => Ok(JsonValue::Object(row)),
        None if or_throw => not_found!("no `{}` row matched the query", model.name),
        None => Ok(JsonValue::Null),
    }
}

/// Shared find pipeline: filters, ordering, cursor, pagination, distinct.
pub(crate) async fn run_find(
    core: &ClientCore,
    model: &Arc<Model>,
    args: &FindArgs,
    op_name: &str,
) -> Result<Vec<JsonObject>> {
    let rcx = core.request_context(op_name, true);
    let mut plan = QueryPlan::build(&rcx, model, &args.selection(), true)?;

    if let Some(where_) = &args.where_ {
        plan.push_filter(filter::where_to_expr(&rcx, model, where_)?);
    }

    let mut keys = match &args.order_by {
        Some(order_by) => plan::parse_order_by(model, order_by)?,
        None => vec![],
    };

    // A negative take reads from the opposite end: reverse every sort key
    // (falling back to the id order) and take the magnitude.
    let mut take: Option<u64> = None;
    match args.take {
        Some(t) if t < 0 => {
            if keys.is_empty() {
                keys = id_sort_keys(model);
            }
            for key in &mut keys {
                key.ascending = !key.ascending;
            }
            take = Some(t.unsigned_abs());
        }
        Some(t) => take = Some(t as u64),
        None => {}
    }

    if let Some(cursor) = &args.cursor {
        let cursor_keys = if keys.is_empty() { id_sort_keys(model) } else { keys.clone() };
        plan.push_filter(plan::cursor_filter(model, &cursor_keys, cursor)?);
        if keys.is_empty() {
            keys = cursor_keys;
        }
    }

    let mut ops = vec![];
    if !keys.is_empty() {
        ops.push(QueryOp::SortBy(SortBy { keys }));
    }
    if let Some(skip) = args.skip {
        ops.push(QueryOp::Skip { count: skip });
    }
    if let Some(take) = take {
        ops.push(QueryOp::Take { count: take });
    }
    plan.extend_operators(ops);

    let scope = core.begin_scope().await?;
    let result = async {
        core.run_node(
            &scope.tr,
            &rcx,
            model.name.as_str(),
            op_name,
            QueryNode::Select(plan),
        )
        .await?
        .into_rows()
    }
    .await;
    let (rows, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;

    match &args.distinct {
        Some(fields) => Ok(dedup_rows(rows, fields)),
        None => Ok(rows),
    }
}

fn id_sort_keys(model: &Model) -> Vec<SortKey> {
    model
        .id_fields
        .iter()
        .map(|f| SortKey { field_name: f.clone(), ascending: true })
        .collect()
}

/// Engine-side `distinct`: keeps the first row per distinct-fields tuple,
/// preserving order.
fn dedup_rows(rows: Vec<JsonObject>, fields: &[String]) -> Vec<JsonObject> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key: Vec<String> = fields
            .iter()
            .map(|f| row.get(f).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        if seen.insert(key) {
            out.push(row);
        }
    }
    out
}
