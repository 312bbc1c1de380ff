//! Operation handlers, one per CRUD verb.
//!
//! A handler translates validated arguments into query nodes, runs them
//! through the node-level plugin chain inside a transaction, and coordinates
//! the policy read-back that authorizes mutations.

pub mod args;
mod aggregate;
mod create;
mod delete;
mod find;
mod update;

use crate::client::{ClientCore, TxScope};
use crate::error::{Error, RejectReason, Result};
use crate::expr::{and_all, BinaryExpr, Expr, PropertyAccess};
use crate::mutation::QueryNode;
use crate::plan::{json_literal, QueryPlan, RequestContext, Selection};
use crate::plugin::{MutationAction, MutationHookContext};
use crate::policy;
use crate::JsonObject;
use quarry_schema::schema::Model;
use serde_json::Value as JsonValue;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudOp {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Create,
    CreateMany,
    CreateManyAndReturn,
    Update,
    UpdateMany,
    UpdateManyAndReturn,
    Upsert,
    Delete,
    DeleteMany,
    Aggregate,
    GroupBy,
    Count,
}

impl CrudOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::FindUnique => "findUnique",
            Self::FindUniqueOrThrow => "findUniqueOrThrow",
            Self::FindFirst => "findFirst",
            Self::FindFirstOrThrow => "findFirstOrThrow",
            Self::FindMany => "findMany",
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::CreateManyAndReturn => "createManyAndReturn",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::UpdateManyAndReturn => "updateManyAndReturn",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "groupBy",
            Self::Count => "count",
        }
    }

    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::CreateMany
                | Self::CreateManyAndReturn
                | Self::Update
                | Self::UpdateMany
                | Self::UpdateManyAndReturn
                | Self::Upsert
                | Self::Delete
                | Self::DeleteMany
        )
    }
}

/// The core handler, invoked at the bottom of the high-level plugin chain.
pub async fn handle(
    core: &ClientCore,
    model: &Arc<Model>,
    op: CrudOp,
    mut args: JsonValue,
) -> Result<JsonValue> {
    args::normalize_args(&mut args);
    match op {
        CrudOp::FindUnique => find::find_unique(core, model, args, false).await,
        CrudOp::FindUniqueOrThrow => find::find_unique(core, model, args, true).await,
        CrudOp::FindFirst => find::find_first(core, model, args, false).await,
        CrudOp::FindFirstOrThrow => find::find_first(core, model, args, true).await,
        CrudOp::FindMany => find::find_many(core, model, args).await,
        CrudOp::Create => create::create(core, model, args).await,
        CrudOp::CreateMany => create::create_many(core, model, args, false).await,
        CrudOp::CreateManyAndReturn => create::create_many(core, model, args, true).await,
        CrudOp::Update => update::update(core, model, args).await,
        CrudOp::UpdateMany => update::update_many(core, model, args, false).await,
        CrudOp::UpdateManyAndReturn => update::update_many(core, model, args, true).await,
        CrudOp::Upsert => update::upsert(core, model, args).await,
        CrudOp::Delete => delete::delete(core, model, args).await,
        CrudOp::DeleteMany => delete::delete_many(core, model, args).await,
        CrudOp::Aggregate => aggregate::aggregate(core, model, args).await,
        CrudOp::GroupBy => aggregate::group_by(core, model, args).await,
        CrudOp::Count => aggregate::count(core, model, args).await,
    }
}

/// Expands and validates a unique `where`: the referenced fields must form
/// the primary key, a `@unique` field, or a named `@@unique` tuple. Compound
/// tuples use the `{ tupleName: { f1: v1, f2: v2 } }` shape.
pub(crate) fn unique_where_expr(
    rcx: &RequestContext,
    model: &Arc<Model>,
    where_: &JsonObject,
) -> Result<Expr> {
    let mut expanded = JsonObject::new();
    for (key, value) in where_ {
        if let Some(tuple_fields) = model.unique_keys.get(key) {
            let obj = value.as_object().ok_or_else(|| {
                Error::invalid_input(vec![format!(
                    "compound unique `{key}` must be an object of its fields"
                )])
            })?;
            for field in tuple_fields {
                let v = obj.get(field).cloned().ok_or_else(|| {
                    Error::invalid_input(vec![format!(
                        "compound unique `{key}` is missing field `{field}`"
                    )])
                })?;
                expanded.insert(field.clone(), v);
            }
            continue;
        }
        expanded.insert(key.clone(), value.clone());
    }

    let keys: Vec<&str> = expanded.keys().map(|s| s.as_str()).collect();
    if keys.is_empty() || !model.is_unique_selector(&keys) {
        return Err(Error::invalid_input(vec![format!(
            "`where` must identify a unique row of `{}` (an id, a unique field, or a unique tuple)",
            model.name
        )]));
    }
    crate::filter::where_to_expr(rcx, model, &JsonValue::Object(expanded))
}

/// Equality filter over the row's id values.
pub(crate) fn id_filter_expr(model: &Model, ids: &JsonObject) -> Result<Expr> {
    let mut conds = vec![];
    for id_field in &model.id_fields {
        let value = ids.get(id_field).cloned().ok_or_else(|| {
            Error::internal(anyhow::anyhow!(
                "missing id value for `{}.{id_field}`",
                model.name
            ))
        })?;
        conds.push(BinaryExpr::eq(
            PropertyAccess::chain(&[id_field.clone()]),
            json_literal(&value)?.into(),
        ));
    }
    Ok(and_all(conds).unwrap_or_else(|| Expr::constant(false)))
}

/// Projects the id values out of a row.
pub(crate) fn extract_ids(model: &Model, row: &JsonObject) -> Result<JsonObject> {
    let mut ids = JsonObject::new();
    for id_field in &model.id_fields {
        let value = row.get(id_field).cloned().ok_or_else(|| {
            Error::internal(anyhow::anyhow!(
                "row of `{}` is missing id field `{id_field}`",
                model.name
            ))
        })?;
        ids.insert(id_field.clone(), value);
    }
    Ok(ids)
}

/// Checks whether the row identified by `ids` satisfies `predicate`, inside
/// the current transaction and outside the plugin chain.
pub(crate) async fn row_satisfies(
    core: &ClientCore,
    scope: &TxScope,
    rcx_internal: &RequestContext<'_>,
    model: &Arc<Model>,
    ids: &JsonObject,
    predicate: Expr,
) -> Result<bool> {
    let mut plan = QueryPlan::from_model(rcx_internal, model)?;
    plan.push_filter(id_filter_expr(model, ids)?);
    plan.push_filter(predicate);
    let rows = core
        .run_node_internal(&scope.tr, rcx_internal, QueryNode::Select(plan))
        .await?
        .into_rows()?;
    Ok(!rows.is_empty())
}

/// Post-mutation authorization: confirms the affected row still satisfies
/// the operation's policy rules and is readable, then returns it in the
/// caller's selection shape. Rolls nothing back itself; callers roll back
/// the scope on error.
pub(crate) async fn read_back(
    core: &ClientCore,
    scope: &TxScope,
    model: &Arc<Model>,
    op: quarry_schema::schema::PolicyOp,
    op_name: &str,
    ids: &JsonObject,
    selection: &Selection,
    before: Option<&JsonObject>,
) -> Result<JsonObject> {
    let rcx_internal = core.request_context(op_name, false);
    let under_policies = policy::model_has_policies(&rcx_internal, model)?;

    if under_policies {
        let preds = policy::enforce::readback_predicates(&rcx_internal, model, op, before)?;
        if let Some(op_pred) = preds.op_predicate {
            if !row_satisfies(core, scope, &rcx_internal, model, ids, op_pred).await? {
                return Err(Error::rejected_by_policy(
                    RejectReason::NoAccess,
                    model.name.as_str(),
                ));
            }
        }
        if let Some(read_pred) = preds.read_predicate {
            if !row_satisfies(core, scope, &rcx_internal, model, ids, read_pred).await? {
                return Err(Error::rejected_by_policy(
                    RejectReason::CannotReadBack,
                    model.name.as_str(),
                ));
            }
        }
    }

    // Shape the result through the regular read path (field guards and
    // relation policies apply).
    let rcx = core.request_context(op_name, true);
    let mut plan = QueryPlan::build(&rcx, model, selection, true)?;
    plan.push_filter(id_filter_expr(model, ids)?);
    let mut rows = core
        .run_node(&scope.tr, &rcx, model.name.as_str(), op_name, QueryNode::Select(plan))
        .await?
        .into_rows()?;
    rows.pop().ok_or_else(|| {
        Error::rejected_by_policy(RejectReason::CannotReadBack, model.name.as_str())
    })
}

/// Runs the `before` entity-mutation hooks, in chain order.
pub(crate) async fn run_before_hooks(
    core: &ClientCore,
    model: &Model,
    action: MutationAction,
    entities: &[JsonObject],
) -> Result<()> {
    for plugin in core.plugins.iter().rev() {
        plugin
            .before_entity_mutation(MutationHookContext {
                model: model.name.as_str(),
                action,
                entities,
            })
            .await?;
    }
    Ok(())
}

/// Runs the `after` hooks that asked to stay inside the transaction.
pub(crate) async fn run_after_hooks_within(
    core: &ClientCore,
    model: &Model,
    action: MutationAction,
    entities: &[JsonObject],
) -> Result<()> {
    for plugin in core.plugins.iter().rev() {
        if plugin.run_after_mutation_within_transaction() {
            plugin
                .after_entity_mutation(MutationHookContext {
                    model: model.name.as_str(),
                    action,
                    entities,
                })
                .await?;
        }
    }
    Ok(())
}

/// Runs the remaining `after` hooks once the transaction has committed.
pub(crate) async fn run_after_hooks_outside(
    core: &ClientCore,
    model: &Model,
    action: MutationAction,
    entities: &[JsonObject],
) -> Result<()> {
    for plugin in core.plugins.iter().rev() {
        if !plugin.run_after_mutation_within_transaction() {
            plugin
                .after_entity_mutation(MutationHookContext {
                    model: model.name.as_str(),
                    action,
                    entities,
                })
                .await?;
        }
    }
    Ok(())
}

/// Wraps scope rollback around a fallible step.
pub(crate) async fn or_rollback<T>(
    core: &ClientCore,
    scope: TxScope,
    result: Result<T>,
) -> Result<(T, TxScope)> {
    match result {
        Ok(value) => Ok((value, scope)),
        Err(err) => {
            let _ = core.rollback_scope(scope).await;
            Err(err)
        }
    }
}
