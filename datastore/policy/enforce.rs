use crate::error::{Error, RejectReason, Result};
use crate::expr::Expr;
use crate::mutation::{NodeOutput, QueryNode};
use crate::plan::RequestContext;
use crate::plugin::{NextNode, NodeHookContext, Plugin};
use crate::policy::{self, compile};
use crate::JsonObject;
use futures::future::BoxFuture;
use quarry_schema::schema::{Model, PolicyKind, PolicyOp};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// The innermost node-level interceptor: rewrites every SELECT node so that
/// the base model's read predicate is ANDed into its WHERE clause, before any
/// user-supplied skip/take applies. Joined relations and subqueries get their
/// guards at plan-build time; this hook covers the outermost FROM.
pub struct PolicyInterceptor;

impl Plugin for PolicyInterceptor {
    fn id(&self) -> &str {
        "policy"
    }

    fn name(&self) -> Option<&str> {
        Some("access policy enforcement")
    }

    fn on_query_node<'a>(
        &'a self,
        ctx: &NodeHookContext<'a>,
        mut node: QueryNode,
        next: NextNode<'a, '_>,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        if let QueryNode::Select(plan) = &mut node {
            if ctx.rcx.apply_policies {
                match compile::read_predicate(ctx.rcx, plan.base_model()) {
                    Ok(Some(predicate)) => plan.push_policy_filter(predicate),
                    Ok(None) => {}
                    Err(e) => return Box::pin(futures::future::ready(Err(e))),
                }
            }
        }
        next.proceed(node)
    }
}

/// Rejects writes that touch fields denied by field-level policies. The
/// policy expressions are evaluated in memory over the incoming data.
pub fn check_field_writes(
    rcx: &RequestContext,
    model: &Arc<Model>,
    data: &JsonObject,
    op: PolicyOp,
) -> Result<()> {
    for (field_name, _) in data {
        let field = match model.field(field_name) {
            Some(field) => field,
            None => continue,
        };
        for policy in &field.policies {
            if !policy.applies_to(op) {
                continue;
            }
            let expr = policy
                .expr
                .clone()
                .unwrap_or_else(|| quarry_schema::schema::PolicyExpr::literal_bool(true));
            let holds = policy::eval_expr(model, &expr, data, rcx.auth, op.name())?;
            let denied = match policy.kind {
                PolicyKind::Deny => holds,
                PolicyKind::Allow => !holds,
            };
            if denied {
                return Err(Error::rejected_by_policy(
                    RejectReason::NoAccess,
                    model.name.as_str(),
                )
                .with_model(model.name.as_str()));
            }
        }
    }
    Ok(())
}

/// The predicate a mutated row must satisfy after execution: the operation's
/// own rules plus readability. Returns the per-check predicates so the
/// caller can distinguish `NoAccess` from `CannotReadBack`.
pub struct ReadbackPredicates {
    /// The `<op>` (and `post-update`) rules; violation is `NoAccess`.
    pub op_predicate: Option<Expr>,
    /// The `read` rules; violation is `CannotReadBack`.
    pub read_predicate: Option<Expr>,
}

pub fn readback_predicates(
    rcx: &RequestContext,
    model: &Arc<Model>,
    op: PolicyOp,
    before: Option<&JsonObject>,
) -> Result<ReadbackPredicates> {
    let mut op_predicate = compile::op_predicate(rcx, model, op, before)?;
    if op == PolicyOp::Update {
        if let Some(post) = compile::op_predicate(rcx, model, PolicyOp::PostUpdate, before)? {
            op_predicate = Some(match op_predicate {
                Some(pred) => crate::expr::BinaryExpr::and(pred, post),
                None => post,
            });
        }
    }
    Ok(ReadbackPredicates {
        op_predicate,
        read_predicate: compile::read_predicate(rcx, model)?,
    })
}

/// Evaluates a model's `@@validate` row checks over the (merged) row value.
pub fn check_row_validations(
    rcx: &RequestContext,
    model: &Arc<Model>,
    row: &JsonObject,
) -> Result<()> {
    let mut messages = vec![];
    for check in &model.row_checks {
        let ok = policy::eval_expr(model, &check.expr, row, rcx.auth, rcx.operation)?;
        if !ok {
            let message = check
                .message
                .clone()
                .unwrap_or_else(|| "row validation failed".to_owned());
            match &check.path {
                Some(path) => messages.push(format!("{}: {message}", path.join("."))),
                None => messages.push(message),
            }
        }
    }
    if messages.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_input(messages).with_model(model.name.as_str()))
    }
}

/// Projects the auth context down `names`. `None` when the auth context is
/// absent or the projection resolves to nothing, which lets `auth()`
/// defaults fall back to the database default.
pub fn auth_projection(rcx: &RequestContext, names: &[String]) -> Option<JsonValue> {
    let mut current = rcx.auth?.clone();
    for name in names {
        current = match current {
            JsonValue::Object(mut obj) => obj.remove(name)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}
