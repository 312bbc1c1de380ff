use super::args::{DeleteArgs, DeleteManyArgs};
use super::create::{find_required, wrap_hook_error};
use super::{
    extract_ids, id_filter_expr, or_rollback, row_satisfies, run_after_hooks_outside,
    run_after_hooks_within, run_before_hooks,
};
use crate::client::{ClientCore, TxScope};
use crate::error::{Error, RejectReason, Result};
use crate::filter;
use crate::mutation::{DeletePlan, QueryNode, SetItem, SetOp, UpdatePlan};
use crate::plan::{QueryOp, QueryPlan, RequestContext};
use crate::plugin::MutationAction;
use crate::policy::{self, compile, enforce};
use crate::value::SqlValue;
use crate::JsonObject;
use futures::future::BoxFuture;
use quarry_schema::schema::{Model, PolicyOp, ReferentialAction};
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub async fn delete(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let args = DeleteArgs::parse(args)?;
    let scope = core.begin_scope().await?;
    let result = async {
        // The row must exist, be readable, and satisfy the delete rules.
        let pre = find_required(core, &scope, model, &args.where_).await?;
        let ids = extract_ids(model, &pre)?;

        let rcx = core.request_context("delete", false);
        if policy::model_has_policies(&rcx, model)? {
            let preds = enforce::readback_predicates(&rcx, model, PolicyOp::Delete, None)?;
            if let Some(pred) = preds.op_predicate {
                if !row_satisfies(core, &scope, &rcx, model, &ids, pred).await? {
                    return Err(Error::rejected_by_policy(
                        RejectReason::NoAccess,
                        model.name.as_str(),
                    ));
                }
            }
        }

        run_before_hooks(core, model, MutationAction::Delete, &[pre.clone()])
            .await
            .map_err(wrap_hook_error)?;

        // Shape the result before the row disappears.
        let shaped = shape_pre_image(core, &scope, model, &ids, &args).await?;

        delete_row_graph(core, &scope, model.clone(), ids).await?;
        run_after_hooks_within(core, model, MutationAction::Delete, &[pre.clone()])
            .await
            .map_err(wrap_hook_error)?;
        Ok(shaped)
    }
    .await;
    let (row, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    run_after_hooks_outside(core, model, MutationAction::Delete, &[row.clone()])
        .await
        .map_err(wrap_hook_error)?;
    Ok(JsonValue::Object(row))
}

async fn shape_pre_image(
    core: &ClientCore,
    scope: &TxScope,
    model: &Arc<Model>,
    ids: &JsonObject,
    args: &DeleteArgs,
) -> Result<JsonObject> {
    let rcx = core.request_context("delete", true);
    let mut plan = QueryPlan::build(&rcx, model, &args.selection(), true)?;
    plan.push_filter(id_filter_expr(model, ids)?);
    let mut rows = core
        .run_node(
            &scope.tr,
            &rcx,
            model.name.as_str(),
            "delete",
            QueryNode::Select(plan),
        )
        .await?
        .into_rows()?;
    rows.pop().ok_or_else(|| {
        Error::rejected_by_policy(RejectReason::CannotReadBack, model.name.as_str())
    })
}

pub async fn delete_many(
    core: &ClientCore,
    model: &Arc<Model>,
    args: JsonValue,
) -> Result<JsonValue> {
    let args = DeleteManyArgs::parse(args)?;
    let rcx = core.request_context("deleteMany", false);

    run_before_hooks(core, model, MutationAction::Delete, &[])
        .await
        .map_err(wrap_hook_error)?;

    let scope = core.begin_scope().await?;
    let result = async {
        // Policies restrict silently: unauthorized rows are left in place.
        let mut plan = QueryPlan::from_model(&rcx, model)?;
        if let Some(where_) = &args.where_ {
            plan.push_filter(filter::where_to_expr(&rcx, model, where_)?);
        }
        if policy::model_has_policies(&rcx, model)? {
            if let Some(pred) = compile::read_predicate(&rcx, model)? {
                plan.push_filter(pred);
            }
            if let Some(pred) = compile::op_predicate(&rcx, model, PolicyOp::Delete, None)? {
                plan.push_filter(pred);
            }
        }
        if let Some(limit) = args.limit {
            plan.extend_operators(vec![QueryOp::Take { count: limit }]);
        }

        let rows = core
            .run_node(
                &scope.tr,
                &rcx,
                model.name.as_str(),
                "deleteMany",
                QueryNode::Select(plan),
            )
            .await?
            .into_rows()?;

        let mut count = 0u64;
        for row in rows {
            let ids = extract_ids(model, &row)?;
            delete_row_graph(core, &scope, model.clone(), ids).await?;
            count += 1;
        }
        Ok(serde_json::json!({ "count": count }))
    }
    .await;
    let (out, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    run_after_hooks_outside(core, model, MutationAction::Delete, &[])
        .await
        .map_err(wrap_hook_error)?;
    Ok(out)
}

/// Deletes one row: referential actions first (engine-side, since tables are
/// created without foreign-key constraints), then the model's own table, then
/// its delegate ancestor rows.
pub(crate) fn delete_row_graph<'a>(
    core: &'a ClientCore,
    scope: &'a TxScope,
    model: Arc<Model>,
    ids: JsonObject,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let rcx = core.request_context("delete", false);
        apply_referential_actions(core, scope, &rcx, &model, &ids).await?;

        for owner in rcx.ancestry(&model)? {
            let table = rcx.layout.table(&owner.name)?.clone();
            let mut filter = QueryPlan::from_model(&rcx, &owner)?;
            filter.push_filter(id_filter_expr(&owner, &ids)?);
            let plan = DeletePlan { table, filter, limit: None };
            core.run_node(
                &scope.tr,
                &rcx,
                owner.name.as_str(),
                "delete",
                QueryNode::Delete(plan),
            )
            .await?
            .into_count()?;
        }
        Ok(())
    })
}

/// Applies `onDelete` rules of relations pointing at the deleted row:
/// `Cascade` removes the referencing rows (recursively), `SetNull` severs
/// them.
async fn apply_referential_actions(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    ids: &JsonObject,
) -> Result<()> {
    let deleted_names: Vec<_> = rcx
        .ancestry(model)?
        .iter()
        .map(|m| m.name.clone())
        .collect();

    for other in rcx.schema.models.values() {
        for field in other.relation_fields() {
            let relation = field.relation.as_ref().unwrap();
            if !relation.is_owning() {
                continue;
            }
            let target = match field.relation_target() {
                Some(name) => name,
                None => continue,
            };
            if !deleted_names.contains(target) {
                continue;
            }
            // this row's referenced values identify the children
            let mut selector = JsonObject::new();
            let mut complete = true;
            for (fk, referenced) in relation.fields.iter().zip(relation.references.iter()) {
                match ids.get(referenced) {
                    Some(v) => {
                        selector.insert(fk.clone(), v.clone());
                    }
                    None => complete = false,
                }
            }
            if !complete || selector.is_empty() {
                continue; // the relation references non-id fields; nothing to do here
            }
            match relation.on_delete {
                Some(ReferentialAction::Cascade) => {
                    let mut plan = QueryPlan::from_model(rcx, other)?;
                    plan.push_filter(filter::where_to_expr(
                        rcx,
                        other,
                        &JsonValue::Object(selector),
                    )?);
                    let rows = core
                        .run_node_internal(&scope.tr, rcx, QueryNode::Select(plan))
                        .await?
                        .into_rows()?;
                    for row in rows {
                        let child_ids = extract_ids(other, &row)?;
                        delete_row_graph(core, scope, other.clone(), child_ids).await?;
                    }
                }
                Some(ReferentialAction::SetNull) => {
                    let mut filter = QueryPlan::from_model(rcx, other)?;
                    filter.push_filter(filter::where_to_expr(
                        rcx,
                        other,
                        &JsonValue::Object(selector),
                    )?);
                    let sets = relation
                        .fields
                        .iter()
                        .map(|fk| SetItem {
                            field: fk.clone(),
                            op: SetOp::Set,
                            value: SqlValue::Null,
                        })
                        .collect();
                    let plan = UpdatePlan {
                        table: rcx.layout.table(&other.name)?.clone(),
                        sets,
                        filter,
                        limit: None,
                    };
                    core.run_node_internal(&scope.tr, rcx, QueryNode::Update(plan))
                        .await?
                        .into_count()?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}
