use super::args::{AggregateArgs, GroupByArgs};
use super::or_rollback;
use crate::client::ClientCore;
use crate::error::{Error, Result};
use crate::filter;
use crate::plan::{self, QueryOp, QueryPlan, RequestContext, SortBy};
use crate::policy::{self, compile};
use crate::sql_writer::SqlWriter;
use crate::value;
use crate::JsonObject;
use itertools::Itertools;
use quarry_schema::schema::{Model, PrimitiveType, Provider};
use serde_json::Value as JsonValue;
use sqlx::Row;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    fn sql_name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    fn output_key(self) -> &'static str {
        match self {
            Self::Count => "_count",
            Self::Sum => "_sum",
            Self::Avg => "_avg",
            Self::Min => "_min",
            Self::Max => "_max",
        }
    }
}

/// One aggregate selection: `COUNT(*)` or `fn(field)`.
#[derive(Debug, Clone)]
struct AggItem {
    func: AggFunc,
    /// `None` means `COUNT(*)`.
    field: Option<String>,
    decode: AggDecode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggDecode {
    Integer,
    Double,
    /// min/max keep the field's own representation.
    Column(crate::layout::ColumnRepr),
}

/// `aggregate`: `_count` / `_sum` / `_avg` / `_min` / `_max` over the rows
/// selected by `where`/`orderBy`/`skip`/`take`.
pub async fn aggregate(
    core: &ClientCore,
    model: &Arc<Model>,
    args: JsonValue,
) -> Result<JsonValue> {
    let args = AggregateArgs::parse(args)?;
    let items = collect_items(model, &args)?;
    if items.is_empty() {
        return Err(Error::invalid_input(vec![
            "aggregate requires at least one of _count, _sum, _avg, _min, _max".to_owned(),
        ]));
    }

    let rcx = core.request_context("aggregate", true);
    let mut plan = base_plan(&rcx, model, &args.where_)?;

    let mut ops = vec![];
    if let Some(order_by) = &args.order_by {
        let keys = plan::parse_order_by(model, order_by)?;
        if !keys.is_empty() {
            ops.push(QueryOp::SortBy(SortBy { keys }));
        }
    }
    if let Some(skip) = args.skip {
        ops.push(QueryOp::Skip { count: skip });
    }
    if let Some(take) = args.take {
        ops.push(QueryOp::Take {
            count: take.unsigned_abs(),
        });
    }
    plan.extend_operators(ops);

    let inner = plan.build_query(&rcx)?.raw_sql;
    let sql = aggregate_sql(&rcx, &plan, &items, &inner);

    let scope = core.begin_scope().await?;
    let result = core.engine.fetch_sql(&scope.tr, &sql, &[]).await;
    let (rows, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;

    let row = rows
        .first()
        .ok_or_else(|| Error::internal(anyhow::anyhow!("aggregate returned no row")))?;
    let mut out = JsonObject::new();
    decode_aggregates(&items, row, 0, &mut out, args.count_is_scalar())?;
    Ok(JsonValue::Object(out))
}

/// `count` is aggregate `_count` shorthand returning a bare number.
pub async fn count(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let mut obj = match args {
        JsonValue::Object(obj) => obj,
        JsonValue::Null => JsonObject::new(),
        _ => {
            return Err(Error::invalid_input(vec![
                "count arguments must be an object".to_owned(),
            ]))
        }
    };
    obj.insert("_count".to_owned(), JsonValue::Bool(true));
    let result = aggregate(core, model, JsonValue::Object(obj)).await?;
    Ok(result
        .get("_count")
        .cloned()
        .unwrap_or_else(|| serde_json::json!(0)))
}

/// `groupBy`: multi-column grouping with aggregates, `having`, and ordering
/// over group keys or aggregates.
pub async fn group_by(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let args = GroupByArgs::parse(args)?;
    if args.by.is_empty() {
        return Err(Error::invalid_input(vec![
            "`by` must name at least one field".to_owned(),
        ]));
    }
    for field_name in &args.by {
        let ok = model
            .field(field_name)
            .map_or(false, |f| !f.is_relation());
        if !ok {
            return Err(Error::invalid_input(vec![format!(
                "cannot group by `{field_name}`"
            )]));
        }
    }

    let agg_args = AggregateArgs {
        where_: None,
        order_by: None,
        skip: None,
        take: None,
        count: args.count.clone(),
        sum: args.sum.clone(),
        avg: args.avg.clone(),
        min: args.min.clone(),
        max: args.max.clone(),
    };
    let items = collect_items(model, &agg_args)?;

    let rcx = core.request_context("groupBy", true);
    let plan = base_plan(&rcx, model, &args.where_)?;
    let inner = plan.build_query(&rcx)?.raw_sql;

    let group_cols: Vec<String> = args
        .by
        .iter()
        .map(|f| quote(&rcx, &plan.output_alias(f)))
        .collect();

    let mut sql = format!(
        "SELECT {}{} FROM ({inner}) AS subquery GROUP BY {}",
        group_cols.join(", "),
        items
            .iter()
            .map(|item| format!(", {}", aggregate_expr(&rcx, &plan, item)))
            .collect::<String>(),
        group_cols.join(", "),
    );

    if let Some(having) = &args.having {
        let rendered = having_sql(&rcx, model, &plan, &args.by, having)?;
        if !rendered.is_empty() {
            sql = format!("{sql} HAVING {rendered}");
        }
    }
    if let Some(order_by) = &args.order_by {
        let rendered = group_order_sql(&rcx, model, &plan, &args.by, order_by)?;
        if !rendered.is_empty() {
            sql = format!("{sql} ORDER BY {rendered}");
        }
    }
    if let Some(take) = args.take {
        sql = format!("{sql} LIMIT {}", take.unsigned_abs());
    }
    if let Some(skip) = args.skip {
        if args.take.is_none() && rcx.provider == Provider::Sqlite {
            sql = format!("{sql} LIMIT {skip},-1");
        } else {
            sql = format!("{sql} OFFSET {skip}");
        }
    }

    let scope = core.begin_scope().await?;
    let result = core.engine.fetch_sql(&scope.tr, &sql, &[]).await;
    let (rows, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;

    let mut out = vec![];
    for row in &rows {
        let mut obj = JsonObject::new();
        for (idx, field_name) in args.by.iter().enumerate() {
            let field = model.field(field_name).unwrap();
            let repr = rcx
                .layout
                .table(&model.name)?
                .column(field_name)
                .map(|c| c.repr)
                .unwrap_or(crate::layout::ColumnRepr::StringAsText);
            let value = value::decode_column(row, idx, repr, field.optional)
                .map_err(Error::internal)?;
            obj.insert(field_name.clone(), value);
        }
        decode_aggregates(&items, row, args.by.len(), &mut obj, count_is_scalar(&args.count))?;
        out.push(JsonValue::Object(obj));
    }
    Ok(JsonValue::Array(out))
}

impl AggregateArgs {
    fn count_is_scalar(&self) -> bool {
        count_is_scalar(&self.count)
    }
}

fn count_is_scalar(count: &Option<JsonValue>) -> bool {
    matches!(count, Some(JsonValue::Bool(true)))
}

fn base_plan(
    rcx: &RequestContext,
    model: &Arc<Model>,
    where_: &Option<JsonValue>,
) -> Result<QueryPlan> {
    let mut plan = QueryPlan::from_model(rcx, model)?;
    if let Some(where_) = where_ {
        plan.push_filter(filter::where_to_expr(rcx, model, where_)?);
    }
    // Aggregates do not flow through the node interceptor, so the read
    // predicate is injected here.
    if policy::model_has_policies(rcx, model)? {
        if let Some(pred) = compile::read_predicate(rcx, model)? {
            plan.push_policy_filter(pred);
        }
    }
    Ok(plan)
}

fn collect_items(model: &Model, args: &AggregateArgs) -> Result<Vec<AggItem>> {
    let mut items = vec![];

    match &args.count {
        None => {}
        Some(JsonValue::Bool(true)) => {
            items.push(AggItem { func: AggFunc::Count, field: None, decode: AggDecode::Integer });
        }
        Some(JsonValue::Object(fields)) => {
            for (field_name, v) in fields {
                if matches!(v, JsonValue::Bool(false)) {
                    continue;
                }
                if field_name == "_all" {
                    items.push(AggItem {
                        func: AggFunc::Count,
                        field: None,
                        decode: AggDecode::Integer,
                    });
                    continue;
                }
                require_scalar(model, field_name)?;
                items.push(AggItem {
                    func: AggFunc::Count,
                    field: Some(field_name.clone()),
                    decode: AggDecode::Integer,
                });
            }
        }
        Some(_) => {
            return Err(Error::invalid_input(vec![
                "`_count` must be `true` or a field selection".to_owned(),
            ]))
        }
    }

    let mut numeric = |selection: &Option<JsonObject>, func: AggFunc| -> Result<()> {
        if let Some(fields) = selection {
            for (field_name, v) in fields {
                if matches!(v, JsonValue::Bool(false)) {
                    continue;
                }
                let scalar = require_scalar(model, field_name)?;
                if !scalar.is_numeric() {
                    return Err(Error::invalid_input(vec![format!(
                        "{} requires a numeric field; `{field_name}` is {}",
                        func.output_key(),
                        scalar.name()
                    )]));
                }
                let decode = if func == AggFunc::Avg {
                    AggDecode::Double
                } else {
                    match scalar {
                        PrimitiveType::Int | PrimitiveType::BigInt => AggDecode::Integer,
                        _ => AggDecode::Double,
                    }
                };
                items.push(AggItem { func, field: Some(field_name.clone()), decode });
            }
        }
        Ok(())
    };
    numeric(&args.sum, AggFunc::Sum)?;
    numeric(&args.avg, AggFunc::Avg)?;

    let mut minmax = |selection: &Option<JsonObject>, func: AggFunc| -> Result<()> {
        if let Some(fields) = selection {
            for (field_name, v) in fields {
                if matches!(v, JsonValue::Bool(false)) {
                    continue;
                }
                let scalar = require_scalar(model, field_name)?;
                let decode = AggDecode::Column(plan::scalar_repr(scalar));
                items.push(AggItem { func, field: Some(field_name.clone()), decode });
            }
        }
        Ok(())
    };
    minmax(&args.min, AggFunc::Min)?;
    minmax(&args.max, AggFunc::Max)?;

    Ok(items)
}

fn require_scalar(model: &Model, field_name: &str) -> Result<PrimitiveType> {
    model
        .field(field_name)
        .filter(|f| !f.is_relation() && !f.computed)
        .and_then(|f| f.scalar_type())
        .ok_or_else(|| {
            Error::invalid_input(vec![format!(
                "`{field_name}` is not an aggregatable scalar field of `{}`",
                model.name
            )])
        })
}

fn quote(rcx: &RequestContext, ident: &str) -> String {
    let mut w = SqlWriter::new(rcx.provider);
    w.write_ident(ident);
    w.build()
}

/// Renders one aggregate selection, casting SUM/AVG so every provider
/// returns a decodable type.
fn aggregate_expr(rcx: &RequestContext, plan: &QueryPlan, item: &AggItem) -> String {
    let arg = match &item.field {
        None => "*".to_owned(),
        Some(field) => quote(rcx, &plan.output_alias(field)),
    };
    let raw = format!("{}({})", item.func.sql_name(), arg);
    match (item.func, item.decode) {
        (AggFunc::Sum | AggFunc::Avg, AggDecode::Integer) => cast(rcx, &raw, true),
        (AggFunc::Sum | AggFunc::Avg, _) => cast(rcx, &raw, false),
        _ => raw,
    }
}

fn cast(rcx: &RequestContext, expr: &str, integer: bool) -> String {
    let ty = match (rcx.provider, integer) {
        (Provider::Sqlite, true) => "INTEGER",
        (Provider::Sqlite, false) => "REAL",
        (Provider::Postgres, true) => "bigint",
        (Provider::Postgres, false) => "double precision",
        (Provider::MySql, true) => "SIGNED",
        (Provider::MySql, false) => "DOUBLE",
    };
    format!("CAST({expr} AS {ty})")
}

fn aggregate_sql(
    rcx: &RequestContext,
    plan: &QueryPlan,
    items: &[AggItem],
    inner: &str,
) -> String {
    let selections = items
        .iter()
        .map(|item| aggregate_expr(rcx, plan, item))
        .join(", ");
    format!("SELECT {selections} FROM ({inner}) AS subquery")
}

/// Decodes aggregate columns starting at `offset`, nesting the values under
/// `_count`/`_sum`/... keys. A bare `_count: true` decodes to a number.
fn decode_aggregates(
    items: &[AggItem],
    row: &sqlx::any::AnyRow,
    offset: usize,
    out: &mut JsonObject,
    bare_count: bool,
) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        let idx = offset + i;
        use sqlx::ValueRef;
        let is_null = row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true);
        let value = match item.decode {
            // SUM/MIN/MAX over an empty set come back NULL.
            AggDecode::Integer if is_null => JsonValue::Null,
            AggDecode::Double if is_null => JsonValue::Null,
            AggDecode::Integer => {
                let v: i64 = row.get_unchecked(idx);
                serde_json::json!(v)
            }
            AggDecode::Double => {
                let v: f64 = row.get_unchecked(idx);
                serde_json::json!(v)
            }
            AggDecode::Column(repr) => {
                value::decode_column(row, idx, repr, true).map_err(Error::internal)?
            }
        };
        let key = item.func.output_key();
        if item.func == AggFunc::Count && item.field.is_none() && bare_count {
            out.insert(key.to_owned(), value);
            continue;
        }
        let entry = out
            .entry(key.to_owned())
            .or_insert_with(|| JsonValue::Object(JsonObject::new()));
        if let JsonValue::Object(map) = entry {
            map.insert(
                item.field.clone().unwrap_or_else(|| "_all".to_owned()),
                value,
            );
        }
    }
    Ok(())
}

/// Renders a `having` object: scalar predicates over grouped fields and
/// aggregate predicates (`{_sum: {field: {gt: 10}}}`), ANDed together.
fn having_sql(
    rcx: &RequestContext,
    model: &Arc<Model>,
    plan: &QueryPlan,
    by: &[String],
    having: &JsonObject,
) -> Result<String> {
    let mut conds = vec![];
    for (key, value) in having {
        match key.as_str() {
            "_sum" | "_avg" | "_min" | "_max" | "_count" => {
                let func = match key.as_str() {
                    "_sum" => AggFunc::Sum,
                    "_avg" => AggFunc::Avg,
                    "_min" => AggFunc::Min,
                    "_max" => AggFunc::Max,
                    _ => AggFunc::Count,
                };
                let fields = value.as_object().ok_or_else(|| {
                    Error::invalid_input(vec![format!("`{key}` in having must be an object")])
                })?;
                for (field_name, ops) in fields {
                    require_scalar(model, field_name)?;
                    let expr = aggregate_expr(
                        rcx,
                        plan,
                        &AggItem {
                            func,
                            field: Some(field_name.clone()),
                            decode: AggDecode::Double,
                        },
                    );
                    conds.push(scalar_ops_sql(rcx, &expr, ops)?);
                }
            }
            field_name => {
                if !by.contains(&field_name.to_owned()) {
                    return Err(Error::invalid_input(vec![format!(
                        "having references `{field_name}` which is not grouped or aggregated"
                    )]));
                }
                let col = quote(rcx, &plan.output_alias(field_name));
                conds.push(scalar_ops_sql(rcx, &col, value)?);
            }
        }
    }
    Ok(conds.join(" AND "))
}

/// Scalar comparison ops over a rendered SQL expression.
fn scalar_ops_sql(rcx: &RequestContext, target: &str, ops: &JsonValue) -> Result<String> {
    let literal = |v: &JsonValue| -> Result<String> {
        let mut w = SqlWriter::new(rcx.provider);
        match plan::json_literal(v)? {
            crate::expr::Literal::Bool(b) => w.write_literal_bool(b),
            crate::expr::Literal::I64(i) => w.write_literal_i64(i),
            crate::expr::Literal::U64(u) => w.write_literal_i64(u as i64),
            crate::expr::Literal::F64(f) => w
                .write_literal_f64(f)
                .map_err(|e| Error::invalid_input(vec![format!("{e:#}")]))?,
            crate::expr::Literal::String(s) => w
                .write_literal_str(&s)
                .map_err(|e| Error::invalid_input(vec![format!("{e:#}")]))?,
            crate::expr::Literal::Null => w.write_str("NULL"),
        }
        Ok(w.build())
    };

    let obj = match ops {
        JsonValue::Object(obj) => obj,
        shorthand => return Ok(format!("{target} = {}", literal(shorthand)?)),
    };
    let mut conds = vec![];
    for (op, v) in obj {
        let sql_op = match op.as_str() {
            "equals" => "=",
            "not" => "!=",
            "lt" => "<",
            "lte" => "<=",
            "gt" => ">",
            "gte" => ">=",
            other => {
                return Err(Error::invalid_input(vec![format!(
                    "unsupported having operator `{other}`"
                )]))
            }
        };
        conds.push(format!("{target} {sql_op} {}", literal(v)?));
    }
    Ok(conds.join(" AND "))
}

/// Renders a groupBy `orderBy`: group keys or aggregates.
fn group_order_sql(
    rcx: &RequestContext,
    model: &Arc<Model>,
    plan: &QueryPlan,
    by: &[String],
    order_by: &JsonValue,
) -> Result<String> {
    let entries: Vec<&JsonObject> = match order_by {
        JsonValue::Array(items) => items
            .iter()
            .map(|v| {
                v.as_object().ok_or_else(|| {
                    Error::invalid_input(vec!["orderBy entries must be objects".to_owned()])
                })
            })
            .collect::<Result<_>>()?,
        JsonValue::Object(obj) => vec![obj],
        _ => return Ok(String::new()),
    };

    let mut tokens = vec![];
    for entry in entries {
        for (key, v) in entry {
            match key.as_str() {
                "_sum" | "_avg" | "_min" | "_max" | "_count" => {
                    let func = match key.as_str() {
                        "_sum" => AggFunc::Sum,
                        "_avg" => AggFunc::Avg,
                        "_min" => AggFunc::Min,
                        "_max" => AggFunc::Max,
                        _ => AggFunc::Count,
                    };
                    let fields = v.as_object().ok_or_else(|| {
                        Error::invalid_input(vec![format!("`{key}` in orderBy must be an object")])
                    })?;
                    for (field_name, dir) in fields {
                        require_scalar(model, field_name)?;
                        let expr = aggregate_expr(
                            rcx,
                            plan,
                            &AggItem {
                                func,
                                field: Some(field_name.clone()),
                                decode: AggDecode::Double,
                            },
                        );
                        tokens.push(format!("{expr} {}", direction(dir)?));
                    }
                }
                field_name => {
                    if !by.contains(&field_name.to_owned()) {
                        return Err(Error::invalid_input(vec![format!(
                            "orderBy references `{field_name}` which is not grouped or aggregated"
                        )]));
                    }
                    let col = quote(rcx, &plan.output_alias(field_name));
                    tokens.push(format!("{col} {}", direction(v)?));
                }
            }
        }
    }
    Ok(tokens.join(", "))
}

fn direction(v: &JsonValue) -> Result<&'static str> {
    match v.as_str() {
        Some("asc") => Ok("ASC"),
        Some("desc") => Ok("DESC"),
        _ => Err(Error::invalid_input(vec![
            "orderBy direction must be \"asc\" or \"desc\"".to_owned(),
        ])),
    }
}
