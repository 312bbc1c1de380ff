use super::args::{NestedUpdate, NestedWrite, UpdateArgs, UpdateManyArgs, UpsertArgs};
use super::create::{
    connect_child, find_optional, find_required, insert_graph, prepare_scalar_row, wrap_hook_error,
};
use super::delete::delete_row_graph;
use super::{
    extract_ids, id_filter_expr, or_rollback, read_back, run_after_hooks_outside,
    run_after_hooks_within, run_before_hooks, unique_where_expr,
};
use crate::client::{ClientCore, TxScope};
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::filter;
use crate::mutation::{QueryNode, SetItem, SetOp, UpdatePlan};
use crate::plan::{relation_link, QueryPlan, RequestContext, Selection};
use crate::plugin::MutationAction;
use crate::policy::{self, compile, enforce};
use crate::util;
use crate::validate::{self, WriteKind};
use crate::value::to_sql_value;
use crate::JsonObject;
use futures::future::BoxFuture;
use quarry_schema::schema::{Field, Model, PolicyOp};
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub async fn update(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let args = UpdateArgs::parse(args)?;
    let scope = core.begin_scope().await?;
    let result = async {
        let pre = find_required(core, &scope, model, &args.where_).await?;
        let ids = extract_ids(model, &pre)?;
        run_before_hooks(core, model, MutationAction::Update, &[args.data.clone()])
            .await
            .map_err(wrap_hook_error)?;
        apply_update_graph(core, &scope, model.clone(), pre.clone(), args.data.clone()).await?;
        run_after_hooks_within(core, model, MutationAction::Update, &[pre.clone()])
            .await
            .map_err(wrap_hook_error)?;
        read_back(
            core,
            &scope,
            model,
            PolicyOp::Update,
            "update",
            &ids,
            &args.selection(),
            Some(&pre),
        )
        .await
    }
    .await;
    let (row, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    run_after_hooks_outside(core, model, MutationAction::Update, &[row.clone()])
        .await
        .map_err(wrap_hook_error)?;
    Ok(JsonValue::Object(row))
}

pub async fn update_many(
    core: &ClientCore,
    model: &Arc<Model>,
    args: JsonValue,
    and_return: bool,
) -> Result<JsonValue> {
    let args = UpdateManyArgs::parse(args)?;
    let rcx = core.request_context("updateMany", false);
    let sets = parse_scalar_sets(core, &rcx, model, &args.data, None)?;

    run_before_hooks(core, model, MutationAction::Update, &[args.data.clone()])
        .await
        .map_err(wrap_hook_error)?;

    let scope = core.begin_scope().await?;
    let result = async {
        // Policies restrict silently: only readable-and-updatable rows are
        // touched.
        let mut filter_plan = QueryPlan::from_model(&rcx, model)?;
        if let Some(where_) = &args.where_ {
            filter_plan.push_filter(filter::where_to_expr(&rcx, model, where_)?);
        }
        if policy::model_has_policies(&rcx, model)? {
            if let Some(pred) = compile::read_predicate(&rcx, model)? {
                filter_plan.push_filter(pred);
            }
            if let Some(pred) = compile::op_predicate(&rcx, model, PolicyOp::Update, None)? {
                filter_plan.push_filter(pred);
            }
        }

        // The affected ids are pinned before the update so the post-images
        // can be returned (and checked) afterwards.
        let target_ids = if and_return {
            let plan = clone_id_plan(&filter_plan, args.limit);
            let rows = core
                .run_node_internal(&scope.tr, &rcx, QueryNode::Select(plan))
                .await?
                .into_rows()?;
            Some(rows)
        } else {
            None
        };

        let count = run_scalar_update(core, &scope, &rcx, model, sets.clone(), filter_plan, args.limit).await?;

        if let Some(target_rows) = target_ids {
            let mut out = vec![];
            for row in target_rows {
                let ids = extract_ids(model, &row)?;
                let shaped = read_back(
                    core,
                    &scope,
                    model,
                    PolicyOp::Update,
                    "updateManyAndReturn",
                    &ids,
                    &Selection::default(),
                    Some(&row),
                )
                .await?;
                out.push(JsonValue::Object(shaped));
            }
            Ok(JsonValue::Array(out))
        } else {
            Ok(serde_json::json!({ "count": count }))
        }
    }
    .await;
    let (out, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    run_after_hooks_outside(core, model, MutationAction::Update, &[])
        .await
        .map_err(wrap_hook_error)?;
    Ok(out)
}

/// Atomic "find by unique, then update or create".
pub async fn upsert(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let args = UpsertArgs::parse(args)?;
    let scope = core.begin_scope().await?;
    let result = async {
        match find_optional(core, &scope, model, &args.where_).await? {
            Some(pre) => {
                let ids = extract_ids(model, &pre)?;
                run_before_hooks(core, model, MutationAction::Update, &[args.update.clone()])
                    .await
                    .map_err(wrap_hook_error)?;
                apply_update_graph(core, &scope, model.clone(), pre.clone(), args.update.clone())
                    .await?;
                run_after_hooks_within(core, model, MutationAction::Update, &[pre.clone()])
                    .await
                    .map_err(wrap_hook_error)?;
                read_back(
                    core,
                    &scope,
                    model,
                    PolicyOp::Update,
                    "upsert",
                    &ids,
                    &args.selection(),
                    Some(&pre),
                )
                .await
            }
            None => {
                run_before_hooks(core, model, MutationAction::Create, &[args.create.clone()])
                    .await
                    .map_err(wrap_hook_error)?;
                let row = insert_graph(core, &scope, model.clone(), args.create.clone()).await?;
                let ids = extract_ids(model, &row)?;
                run_after_hooks_within(core, model, MutationAction::Create, &[row])
                    .await
                    .map_err(wrap_hook_error)?;
                read_back(
                    core,
                    &scope,
                    model,
                    PolicyOp::Create,
                    "upsert",
                    &ids,
                    &args.selection(),
                    None,
                )
                .await
            }
        }
    }
    .await;
    let (row, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    Ok(JsonValue::Object(row))
}

/// A parsed scalar assignment: plain value or numeric atomic op.
fn parse_scalar_sets(
    core: &ClientCore,
    rcx: &RequestContext,
    model: &Arc<Model>,
    data: &JsonObject,
    pre: Option<&JsonObject>,
) -> Result<Vec<(Arc<Model>, SetItem)>> {
    let mut sets = vec![];
    let mut plain_values = JsonObject::new();

    for (key, value) in data {
        let (owner, field) = rcx.lookup_field(model, key)?.ok_or_else(|| {
            Error::invalid_input(vec![format!(
                "unknown field `{key}` on model `{}`",
                model.name
            )])
        })?;
        if field.is_relation() {
            continue; // handled by the relation pass
        }
        if model.id_fields.contains(key) {
            return Err(Error::invalid_input(vec![
                "updating id fields is not supported".to_owned(),
            ]));
        }
        if field.computed {
            return Err(Error::invalid_input(vec![format!(
                "computed field `{key}` is not writable"
            )]));
        }
        if rcx
            .ancestry(model)?
            .iter()
            .any(|m| m.delegate.as_ref().map(|d| &d.discriminator) == Some(key))
        {
            return Err(Error::invalid_input(vec![format!(
                "discriminator field `{key}` is not writable"
            )]));
        }

        let (op, raw_value) = match value {
            JsonValue::Object(obj) if obj.len() == 1 => {
                let (op_key, op_value) = obj.iter().next().unwrap();
                match op_key.as_str() {
                    "set" => (SetOp::Set, op_value.clone()),
                    "increment" => (SetOp::Increment, op_value.clone()),
                    "decrement" => (SetOp::Decrement, op_value.clone()),
                    "multiply" => (SetOp::Multiply, op_value.clone()),
                    "divide" => (SetOp::Divide, op_value.clone()),
                    _ => (SetOp::Set, value.clone()),
                }
            }
            _ => (SetOp::Set, value.clone()),
        };

        if op != SetOp::Set && field.scalar_type().map_or(true, |t| !t.is_numeric()) {
            return Err(Error::invalid_input(vec![format!(
                "atomic operations require a numeric field; `{key}` is not numeric"
            )]));
        }

        let mut raw_value = raw_value;
        if op == SetOp::Set {
            if let JsonValue::String(s) = &raw_value {
                let mut tmp = JsonObject::new();
                tmp.insert(key.clone(), JsonValue::String(s.clone()));
                validate::apply_transforms(&owner, &mut tmp);
                raw_value = tmp.remove(key).unwrap();
            }
            plain_values.insert(key.clone(), raw_value.clone());
        }

        let col = rcx
            .layout
            .table(&owner.name)?
            .column(&field.name)
            .ok_or_else(|| Error::internal(anyhow::anyhow!("no column for `{key}`")))?
            .clone();
        sets.push((
            owner.clone(),
            SetItem {
                field: field.name.clone(),
                op,
                value: to_sql_value(col.repr, &raw_value)
                    .map_err(|e| Error::invalid_input(vec![format!("field `{key}`: {e:#}")]))?,
            },
        ));
    }

    // Stamp `@updatedAt` fields.
    for owner in rcx.ancestry(model)? {
        for field in owner.scalar_fields() {
            if field.updated_at && !data.contains_key(&field.name) {
                sets.push((
                    owner.clone(),
                    SetItem {
                        field: field.name.clone(),
                        op: SetOp::Set,
                        value: crate::value::SqlValue::String(util::now_iso()),
                    },
                ));
            }
        }
    }

    if core.validation_enabled && !plain_values.is_empty() {
        for owner in rcx.ancestry(model)? {
            let slice: JsonObject = plain_values
                .iter()
                .filter(|(k, _)| owner.field(k).is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !slice.is_empty() {
                validate::validate_row(&core.schema, &owner, &slice, WriteKind::Update)?;
            }
        }
        // `@@validate` sees the post-image as far as it is known.
        if let Some(pre) = pre {
            let mut merged = pre.clone();
            for (k, v) in &plain_values {
                merged.insert(k.clone(), v.clone());
            }
            enforce::check_row_validations(rcx, model, &merged)?;
        }
    }
    enforce::check_field_writes(rcx, model, &plain_values, PolicyOp::Update)?;

    Ok(sets)
}

/// Applies an update payload to one existing row: scalar sets plus nested
/// relation writes.
pub(crate) fn apply_update_graph<'a>(
    core: &'a ClientCore,
    scope: &'a TxScope,
    model: Arc<Model>,
    pre: JsonObject,
    data: JsonObject,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let rcx = core.request_context("update", false);
        let ids = extract_ids(&model, &pre)?;

        let sets = parse_scalar_sets(core, &rcx, &model, &data, Some(&pre))?;
        if !sets.is_empty() {
            let mut filter = QueryPlan::from_model(&rcx, &model)?;
            filter.push_filter(id_filter_expr(&model, &ids)?);
            run_grouped_sets(core, scope, &rcx, &model, sets, filter, None).await?;
        }

        for (key, value) in &data {
            let (owner, field) = match rcx.lookup_field(&model, key)? {
                Some(pair) => pair,
                None => continue,
            };
            if !field.is_relation() {
                continue;
            }
            let writes = super::args::parse_nested_writes(key, value)?;
            apply_relation_updates(core, scope, &rcx, &owner, &field, writes, &pre).await?;
        }
        Ok(())
    })
}

/// Groups set items by owning table (delegate ancestors have their own
/// tables) and issues one UPDATE per table.
async fn run_grouped_sets(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    sets: Vec<(Arc<Model>, SetItem)>,
    filter: QueryPlan,
    limit: Option<u64>,
) -> Result<u64> {
    let mut count = 0;
    let ancestry = rcx.ancestry(model)?;
    for owner in &ancestry {
        let owner_sets: Vec<SetItem> = sets
            .iter()
            .filter(|(set_owner, _)| set_owner.name == owner.name)
            .map(|(_, item)| item.clone())
            .collect();
        if owner_sets.is_empty() {
            continue;
        }
        // Target rows are selected through the concrete model's plan; the id
        // columns drive the per-table WHERE.
        let plan = UpdatePlan {
            table: rcx.layout.table(&owner.name)?.clone(),
            sets: owner_sets,
            filter: filter.clone(),
            limit,
        };
        count = core
            .run_node(
                &scope.tr,
                rcx,
                model.name.as_str(),
                "update",
                QueryNode::Update(plan),
            )
            .await?
            .into_count()?
            .max(count);
    }
    Ok(count)
}

async fn run_scalar_update(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    sets: Vec<(Arc<Model>, SetItem)>,
    filter: QueryPlan,
    limit: Option<u64>,
) -> Result<u64> {
    if sets.is_empty() {
        return Ok(0);
    }
    run_grouped_sets(core, scope, rcx, model, sets, filter, limit).await
}

fn clone_id_plan(filter: &QueryPlan, limit: Option<u64>) -> QueryPlan {
    let mut plan = filter.clone();
    if let Some(limit) = limit {
        plan.extend_operators(vec![crate::plan::QueryOp::Take { count: limit }]);
    }
    plan
}

/// Applies one relation's nested writes during an update.
async fn apply_relation_updates(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    owner: &Arc<Model>,
    field: &Arc<Field>,
    writes: Vec<NestedWrite>,
    parent_row: &JsonObject,
) -> Result<()> {
    let relation = field.relation.as_ref().unwrap();
    let target = rcx.model(field.relation_target().unwrap())?;

    if relation.is_owning() {
        apply_owning_updates(core, scope, rcx, owner, field, writes, parent_row).await
    } else {
        apply_child_updates(core, scope, rcx, owner, field, &target, writes, parent_row).await
    }
}

/// Nested writes on a to-one relation whose key lives on the updated row.
async fn apply_owning_updates(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    owner: &Arc<Model>,
    field: &Arc<Field>,
    writes: Vec<NestedWrite>,
    parent_row: &JsonObject,
) -> Result<()> {
    let relation = field.relation.as_ref().unwrap();
    let target = rcx.model(field.relation_target().unwrap())?;
    let parent_ids = extract_ids(owner, parent_row)?;

    // The currently-linked target row, if any.
    let current_target = || -> Result<Option<JsonObject>> {
        let mut selector = JsonObject::new();
        for (fk, referenced) in relation.fields.iter().zip(relation.references.iter()) {
            match parent_row.get(fk) {
                Some(JsonValue::Null) | None => return Ok(None),
                Some(v) => {
                    selector.insert(referenced.clone(), v.clone());
                }
            }
        }
        Ok(Some(selector))
    };

    for write in writes {
        match write {
            NestedWrite::Connect(selectors) => {
                for selector in selectors {
                    let target_row = find_required(core, scope, &target, &selector).await?;
                    set_own_fk(core, scope, rcx, owner, relation, &parent_ids, Some(&target_row))
                        .await?;
                }
            }
            NestedWrite::ConnectOrCreate(entries) => {
                for entry in entries {
                    let target_row = match find_optional(core, scope, &target, &entry.where_)
                        .await?
                    {
                        Some(row) => row,
                        None => insert_graph(core, scope, target.clone(), entry.create).await?,
                    };
                    set_own_fk(core, scope, rcx, owner, relation, &parent_ids, Some(&target_row))
                        .await?;
                }
            }
            NestedWrite::Create(entries) => {
                for data in entries {
                    let target_row = insert_graph(core, scope, target.clone(), data).await?;
                    set_own_fk(core, scope, rcx, owner, relation, &parent_ids, Some(&target_row))
                        .await?;
                }
            }
            NestedWrite::Disconnect(_) => {
                if !field.optional {
                    return Err(Error::invalid_input(vec![format!(
                        "required relation `{}` cannot be disconnected",
                        field.name
                    )]));
                }
                set_own_fk(core, scope, rcx, owner, relation, &parent_ids, None).await?;
            }
            NestedWrite::Update(entries) => {
                for entry in entries {
                    if let Some(selector) = current_target()? {
                        let pre = find_required(core, scope, &target, &selector).await?;
                        apply_update_graph(core, scope, target.clone(), pre, entry.data).await?;
                    }
                }
            }
            NestedWrite::Upsert(entries) => {
                for entry in entries {
                    match current_target()? {
                        Some(selector) => {
                            let pre = find_required(core, scope, &target, &selector).await?;
                            apply_update_graph(core, scope, target.clone(), pre, entry.update)
                                .await?;
                        }
                        None => {
                            let target_row =
                                insert_graph(core, scope, target.clone(), entry.create).await?;
                            set_own_fk(
                                core,
                                scope,
                                rcx,
                                owner,
                                relation,
                                &parent_ids,
                                Some(&target_row),
                            )
                            .await?;
                        }
                    }
                }
            }
            NestedWrite::Delete(_) => {
                if let Some(selector) = current_target()? {
                    if !field.optional {
                        return Err(Error::invalid_input(vec![format!(
                            "required relation `{}` cannot be deleted from its owner",
                            field.name
                        )]));
                    }
                    set_own_fk(core, scope, rcx, owner, relation, &parent_ids, None).await?;
                    if let Some(row) = find_optional(core, scope, &target, &selector).await? {
                        let ids = extract_ids(&target, &row)?;
                        delete_row_graph(core, scope, target.clone(), ids).await?;
                    }
                }
            }
            NestedWrite::Set(_) | NestedWrite::CreateMany { .. } | NestedWrite::UpdateMany(_)
            | NestedWrite::DeleteMany(_) => {
                return Err(Error::invalid_input(vec![format!(
                    "operation not available on to-one relation `{}`",
                    field.name
                )]));
            }
        }
    }
    Ok(())
}

/// Writes the owner-side foreign key columns; `target_row: None` nulls them.
async fn set_own_fk(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    owner: &Arc<Model>,
    relation: &quarry_schema::schema::Relation,
    parent_ids: &JsonObject,
    target_row: Option<&JsonObject>,
) -> Result<()> {
    let table = rcx.layout.table(&owner.name)?.clone();
    let mut sets = vec![];
    for (fk, referenced) in relation.fields.iter().zip(relation.references.iter()) {
        let col = table
            .column(fk)
            .ok_or_else(|| Error::internal(anyhow::anyhow!("no column for `{fk}`")))?;
        let value = match target_row {
            Some(row) => {
                let v = row.get(referenced).cloned().ok_or_else(|| {
                    Error::internal(anyhow::anyhow!("target row is missing `{referenced}`"))
                })?;
                to_sql_value(col.repr, &v)
                    .map_err(|e| Error::invalid_input(vec![format!("{e:#}")]))?
            }
            None => crate::value::SqlValue::Null,
        };
        sets.push(SetItem { field: fk.clone(), op: SetOp::Set, value });
    }
    let mut filter = QueryPlan::from_model(rcx, owner)?;
    filter.push_filter(id_filter_expr(owner, parent_ids)?);
    let plan = UpdatePlan { table, sets, filter, limit: None };
    core.run_node(
        &scope.tr,
        rcx,
        owner.name.as_str(),
        "update",
        QueryNode::Update(plan),
    )
    .await?
    .into_count()?;
    Ok(())
}

/// Nested writes on relations whose key lives on the child rows.
#[allow(clippy::too_many_arguments)]
async fn apply_child_updates(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    owner: &Arc<Model>,
    field: &Arc<Field>,
    target: &Arc<Model>,
    writes: Vec<NestedWrite>,
    parent_row: &JsonObject,
) -> Result<()> {
    let link = relation_link(rcx, owner, field, target)?;
    let link_filter = |rcx: &RequestContext| -> Result<Expr> {
        let mut selector = JsonObject::new();
        for (parent_field, child_field) in &link {
            let value = parent_row.get(parent_field).cloned().ok_or_else(|| {
                Error::internal(anyhow::anyhow!("parent row is missing `{parent_field}`"))
            })?;
            selector.insert(child_field.clone(), value);
        }
        filter::where_to_expr(rcx, target, &JsonValue::Object(selector))
    };
    let with_fk = |mut data: JsonObject| -> Result<JsonObject> {
        for (parent_field, child_field) in &link {
            let value = parent_row.get(parent_field).cloned().ok_or_else(|| {
                Error::internal(anyhow::anyhow!("parent row is missing `{parent_field}`"))
            })?;
            data.insert(child_field.clone(), value);
        }
        Ok(data)
    };

    for write in writes {
        match write {
            NestedWrite::Create(entries) => {
                for data in entries {
                    insert_graph(core, scope, target.clone(), with_fk(data)?).await?;
                }
            }
            NestedWrite::CreateMany { data, skip_duplicates: _ } => {
                for row in data {
                    let mut row = with_fk(row)?;
                    prepare_scalar_row(core, rcx, target, &mut row)?;
                    super::create::run_insert_tables(core, scope, rcx, target, &row, false)
                        .await?;
                }
            }
            NestedWrite::Connect(selectors) => {
                for selector in selectors {
                    connect_child(core, scope, rcx, target, &link, parent_row, &selector).await?;
                }
            }
            NestedWrite::ConnectOrCreate(entries) => {
                for entry in entries {
                    match find_optional(core, scope, target, &entry.where_).await? {
                        Some(_) => {
                            connect_child(core, scope, rcx, target, &link, parent_row, &entry.where_)
                                .await?
                        }
                        None => {
                            insert_graph(core, scope, target.clone(), with_fk(entry.create)?)
                                .await?;
                        }
                    }
                }
            }
            NestedWrite::Disconnect(selectors) => {
                for selector in selectors {
                    disconnect_child(core, scope, rcx, target, &link, link_filter(rcx)?, &selector)
                        .await?;
                }
            }
            NestedWrite::Set(selectors) => {
                // full replacement: sever everything, then connect the set
                null_children_fk(core, scope, rcx, target, &link, link_filter(rcx)?).await?;
                for selector in selectors {
                    connect_child(core, scope, rcx, target, &link, parent_row, &selector).await?;
                }
            }
            NestedWrite::Update(entries) => {
                for NestedUpdate { where_, data } in entries {
                    let mut candidates =
                        children_matching(core, scope, rcx, target, &link_filter(rcx)?, &where_)
                            .await?;
                    let pre = candidates.pop().ok_or_else(|| {
                        Error::not_found(anyhow::anyhow!(
                            "`{}` row to update was not found",
                            target.name
                        ))
                    })?;
                    apply_update_graph(core, scope, target.clone(), pre, data).await?;
                }
            }
            NestedWrite::UpdateMany(entries) => {
                for NestedUpdate { where_, data } in entries {
                    let sets = parse_scalar_sets(core, rcx, target, &data, None)?;
                    let mut filter = QueryPlan::from_model(rcx, target)?;
                    filter.push_filter(link_filter(rcx)?);
                    if let Some(where_) = &where_ {
                        filter.push_filter(filter::where_to_expr(rcx, target, where_)?);
                    }
                    run_scalar_update(core, scope, rcx, target, sets, filter, None).await?;
                }
            }
            NestedWrite::Upsert(entries) => {
                for entry in entries {
                    let selector = entry.where_.clone().unwrap_or_default();
                    let existing = if selector.is_empty() {
                        None
                    } else {
                        find_optional(core, scope, target, &selector).await?
                    };
                    match existing {
                        Some(pre) => {
                            apply_update_graph(core, scope, target.clone(), pre, entry.update)
                                .await?
                        }
                        None => {
                            insert_graph(core, scope, target.clone(), with_fk(entry.create)?)
                                .await?;
                        }
                    }
                }
            }
            NestedWrite::Delete(selectors) => {
                for selector in selectors {
                    let mut rows = children_matching(
                        core,
                        scope,
                        rcx,
                        target,
                        &link_filter(rcx)?,
                        &Some(JsonValue::Object(selector)),
                    )
                    .await?;
                    let row = rows.pop().ok_or_else(|| {
                        Error::not_found(anyhow::anyhow!(
                            "`{}` row to delete was not found",
                            target.name
                        ))
                    })?;
                    let ids = extract_ids(target, &row)?;
                    delete_row_graph(core, scope, target.clone(), ids).await?;
                }
            }
            NestedWrite::DeleteMany(wheres) => {
                for where_ in wheres {
                    let rows = children_matching(
                        core,
                        scope,
                        rcx,
                        target,
                        &link_filter(rcx)?,
                        &Some(where_),
                    )
                    .await?;
                    for row in rows {
                        let ids = extract_ids(target, &row)?;
                        delete_row_graph(core, scope, target.clone(), ids).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn children_matching(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    target: &Arc<Model>,
    link_filter: &Expr,
    where_: &Option<JsonValue>,
) -> Result<Vec<JsonObject>> {
    let mut plan = QueryPlan::from_model(rcx, target)?;
    plan.push_filter(link_filter.clone());
    if let Some(where_) = where_ {
        plan.push_filter(filter::where_to_expr(rcx, target, where_)?);
    }
    core.run_node(
        &scope.tr,
        rcx,
        target.name.as_str(),
        "findMany",
        QueryNode::Select(plan),
    )
    .await?
    .into_rows()
}

/// Severs one child row (by unique selector, within the link) by nulling its
/// foreign key columns.
async fn disconnect_child(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    target: &Arc<Model>,
    link: &[(String, String)],
    link_filter: Expr,
    selector: &JsonObject,
) -> Result<()> {
    let mut filter = QueryPlan::from_model(rcx, target)?;
    filter.push_filter(link_filter);
    if !selector.is_empty() {
        filter.push_filter(unique_where_expr(rcx, target, selector)?);
    }
    null_fk_with_filter(core, scope, rcx, target, link, filter).await
}

async fn null_children_fk(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    target: &Arc<Model>,
    link: &[(String, String)],
    link_filter: Expr,
) -> Result<()> {
    let mut filter = QueryPlan::from_model(rcx, target)?;
    filter.push_filter(link_filter);
    null_fk_with_filter(core, scope, rcx, target, link, filter).await
}

async fn null_fk_with_filter(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    target: &Arc<Model>,
    link: &[(String, String)],
    filter: QueryPlan,
) -> Result<()> {
    let sets = link
        .iter()
        .map(|(_, child_field)| SetItem {
            field: child_field.clone(),
            op: SetOp::Set,
            value: crate::value::SqlValue::Null,
        })
        .collect();
    let plan = UpdatePlan {
        table: rcx.layout.table(&target.name)?.clone(),
        sets,
        filter,
        limit: None,
    };
    core.run_node(
        &scope.tr,
        rcx,
        target.name.as_str(),
        "update",
        QueryNode::Update(plan),
    )
    .await?
    .into_count()?;
    Ok(())
}
