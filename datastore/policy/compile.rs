//! Compiles schema policy expressions into SQL filter expressions.
//!
//! The compiler binds `auth()` projections to literals, qualifies field
//! references against the current entity, expands relation traversals and
//! `check()` into correlated EXISTS tests, and substitutes `before()` with
//! the pre-image values fetched earlier in the transaction.

use crate::error::{Error, Result};
use crate::expr::{and_all, or_all, BinaryExpr, BinaryOp, Expr, Literal, PropertyAccess, RelationTest};
use crate::plan::{json_literal, RequestContext};
use crate::JsonObject;
use quarry_schema::schema::{
    Field, Model, ModelName, Policy, PolicyBinaryOp, PolicyExpr, PolicyKind, PolicyOp,
};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;

/// The read predicate of a model: `OR(allow) AND NOT OR(deny)` over its
/// `read` policies. `None` when the model is not under policy control.
pub fn read_predicate(ctx: &RequestContext, model: &Arc<Model>) -> Result<Option<Expr>> {
    op_predicate(ctx, model, PolicyOp::Read, None)
}

/// The combined predicate for one operation. For `post-update` the pre-image
/// must be supplied and `before()` references resolve into it.
pub fn op_predicate(
    ctx: &RequestContext,
    model: &Arc<Model>,
    op: PolicyOp,
    before: Option<&JsonObject>,
) -> Result<Option<Expr>> {
    let mut compiler = Compiler {
        ctx,
        model: model.clone(),
        op,
        before,
        visited: HashSet::new(),
    };
    compiler.combined(model, op)
}

struct Compiler<'a> {
    ctx: &'a RequestContext<'a>,
    model: Arc<Model>,
    op: PolicyOp,
    before: Option<&'a JsonObject>,
    /// Breaks `check()` cycles, keyed on (model, op).
    visited: HashSet<(ModelName, PolicyOp)>,
}

impl<'a> Compiler<'a> {
    /// The effective policy set of a model is the union of its own rules and
    /// those of every delegate ancestor.
    fn effective_policies(&self, model: &Arc<Model>) -> Result<Vec<Policy>> {
        let mut out = vec![];
        for owner in self.ctx.ancestry(model)? {
            out.extend(owner.policies.iter().cloned());
        }
        Ok(out)
    }

    fn combined(&mut self, model: &Arc<Model>, op: PolicyOp) -> Result<Option<Expr>> {
        let policies = self.effective_policies(model)?;
        if policies.is_empty() {
            return Ok(None);
        }
        let applicable: Vec<&Policy> =
            policies.iter().filter(|p| p.applies_to(op)).collect();
        // `post-update` rules are an additional constraint; absent any, the
        // update is not further restricted.
        if applicable.is_empty() && op == PolicyOp::PostUpdate {
            return Ok(None);
        }

        let saved = std::mem::replace(&mut self.model, model.clone());
        let saved_op = std::mem::replace(&mut self.op, op);
        let result = (|| {
            let mut allows = vec![];
            let mut denies = vec![];
            for policy in &applicable {
                let compiled = self.compile(&policy.expr)?;
                match policy.kind {
                    PolicyKind::Allow => allows.push(compiled),
                    PolicyKind::Deny => denies.push(compiled),
                }
            }
            // No allow rule for the operation means constant false.
            let mut pred = or_all(allows).unwrap_or_else(|| Expr::constant(false));
            if let Some(deny) = or_all(denies) {
                pred = BinaryExpr::and(pred, Expr::not(deny));
            }
            Ok(Some(pred))
        })();
        self.model = saved;
        self.op = saved_op;
        result
    }

    fn compile(&mut self, expr: &PolicyExpr) -> Result<Expr> {
        let out = match expr {
            PolicyExpr::Literal { value } => json_literal(value)?.into(),
            PolicyExpr::Field { names } => self.compile_field_chain(names)?,
            PolicyExpr::Auth { names } => self.auth_literal(names).into(),
            PolicyExpr::This => {
                return Err(Error::config(anyhow::anyhow!(
                    "`this` can only be compared with `auth()`"
                )))
            }
            PolicyExpr::Before { name } => self.before_literal(name)?.into(),
            PolicyExpr::Check { relation, operation } => {
                self.compile_check(relation, *operation)?
            }
            PolicyExpr::CurrentModel => {
                Literal::String(self.model.name.0.clone()).into()
            }
            PolicyExpr::CurrentOperation => {
                Literal::String(self.op.name().to_owned()).into()
            }
            PolicyExpr::Not { expr } => Expr::not(self.compile(expr)?),
            PolicyExpr::In { expr, list } => {
                let lhs = self.compile(expr)?;
                let list = list.iter().map(json_literal).collect::<Result<Vec<_>>>()?;
                Expr::In { expr: Box::new(lhs), list, negated: false }
            }
            PolicyExpr::Binary { op, left, right } => match op {
                PolicyBinaryOp::And => BinaryExpr::and(self.compile(left)?, self.compile(right)?),
                PolicyBinaryOp::Or => BinaryExpr::or(self.compile(left)?, self.compile(right)?),
                cmp => self.compile_comparison(left, *cmp, right)?,
            },
        };
        Ok(out)
    }

    /// A bare field chain used as a boolean, e.g. `@@allow('read', published)`.
    fn compile_field_chain(&mut self, names: &[String]) -> Result<Expr> {
        match self.split_relation_prefix(names)? {
            None => Ok(PropertyAccess::chain(names)),
            Some((relation, rest)) => {
                let filter = if rest.is_empty() {
                    None
                } else {
                    Some(self.in_relation(&relation, |c| c.compile_field_chain(&rest))?)
                };
                Ok(Expr::Exists(Box::new(RelationTest {
                    relation,
                    filter,
                    negated: false,
                    all: false,
                })))
            }
        }
    }

    /// Splits a field chain at its first relation segment, if any.
    fn split_relation_prefix(
        &self,
        names: &[String],
    ) -> Result<Option<(String, Vec<String>)>> {
        let first = match names.first() {
            Some(first) => first,
            None => return Ok(None),
        };
        let (_, field) = self
            .ctx
            .lookup_field(&self.model, first)?
            .ok_or_else(|| {
                Error::config(anyhow::anyhow!(
                    "policy on `{}` references unknown field `{first}`",
                    self.model.name
                ))
            })?;
        if field.is_relation() {
            Ok(Some((first.clone(), names[1..].to_vec())))
        } else {
            Ok(None)
        }
    }

    /// Compiles a sub-expression in the context of a related model.
    fn in_relation<F>(&mut self, relation: &str, f: F) -> Result<Expr>
    where
        F: FnOnce(&mut Self) -> Result<Expr>,
    {
        let (_, field) = self
            .ctx
            .lookup_field(&self.model, relation)?
            .ok_or_else(|| {
                Error::config(anyhow::anyhow!(
                    "policy on `{}` references unknown relation `{relation}`",
                    self.model.name
                ))
            })?;
        let target_name = field.relation_target().ok_or_else(|| {
            Error::config(anyhow::anyhow!("`{relation}` is not a relation"))
        })?;
        let target = self.ctx.model(target_name)?;
        let saved = std::mem::replace(&mut self.model, target);
        let result = f(self);
        self.model = saved;
        result
    }

    fn compile_comparison(
        &mut self,
        left: &PolicyExpr,
        op: PolicyBinaryOp,
        right: &PolicyExpr,
    ) -> Result<Expr> {
        // `auth() == this` / `auth() != this` (either order) compare the
        // auth projection with the row's id fields.
        if match_this_auth(left, right) {
            let negated = match op {
                PolicyBinaryOp::Eq => false,
                PolicyBinaryOp::NotEq => true,
                _ => {
                    return Err(Error::config(anyhow::anyhow!(
                        "`this` only supports equality comparisons with `auth()`"
                    )))
                }
            };
            let mut conds = vec![];
            for id_field in self.model.id_fields.clone() {
                let auth_val = self.auth_literal(&[id_field.clone()]);
                if matches!(auth_val, Literal::Null) {
                    return Ok(Expr::constant(negated));
                }
                conds.push(BinaryExpr::eq(
                    PropertyAccess::chain(&[id_field]),
                    auth_val.into(),
                ));
            }
            let eq = and_all(conds).unwrap_or_else(|| Expr::constant(false));
            return Ok(if negated { Expr::not(eq) } else { eq });
        }

        // Relation-traversing field chains become EXISTS around the inner
        // comparison.
        for (this_side, other_side, flipped) in
            [(left, right, false), (right, left, true)]
        {
            if let PolicyExpr::Field { names } = this_side {
                if let Some((relation, rest)) = self.split_relation_prefix(names)? {
                    if rest.is_empty() {
                        return self.compile_relation_identity(&relation, op, other_side);
                    }
                    let inner = self.in_relation(&relation, |c| {
                        let field_expr = PolicyExpr::Field { names: rest.clone() };
                        if flipped {
                            c.compile_comparison(other_side, op, &field_expr)
                        } else {
                            c.compile_comparison(&field_expr, op, other_side)
                        }
                    })?;
                    return Ok(Expr::Exists(Box::new(RelationTest {
                        relation,
                        filter: Some(inner),
                        negated: false,
                        all: false,
                    })));
                }
            }
        }

        let lhs = self.compile(left)?;
        let rhs = self.compile(right)?;

        // Comparisons against NULL become IS (NOT) NULL.
        let null_test = |e: Expr, negated: bool| Expr::is_null(e, negated);
        match (&lhs, op, &rhs) {
            (Expr::Value { value: Literal::Null }, PolicyBinaryOp::Eq, _) => {
                return Ok(null_test(rhs, false))
            }
            (Expr::Value { value: Literal::Null }, PolicyBinaryOp::NotEq, _) => {
                return Ok(null_test(rhs, true))
            }
            (_, PolicyBinaryOp::Eq, Expr::Value { value: Literal::Null }) => {
                return Ok(null_test(lhs, false))
            }
            (_, PolicyBinaryOp::NotEq, Expr::Value { value: Literal::Null }) => {
                return Ok(null_test(lhs, true))
            }
            _ => {}
        }

        Ok(BinaryExpr::new(binop(op), lhs, rhs).into())
    }

    /// `author == auth()` — identity comparison of a to-one relation.
    fn compile_relation_identity(
        &mut self,
        relation: &str,
        op: PolicyBinaryOp,
        other: &PolicyExpr,
    ) -> Result<Expr> {
        let negated = match op {
            PolicyBinaryOp::Eq => false,
            PolicyBinaryOp::NotEq => true,
            _ => {
                return Err(Error::config(anyhow::anyhow!(
                    "relation `{relation}` only supports equality comparisons"
                )))
            }
        };
        let filter = self.in_relation(relation, |c| {
            let mut conds = vec![];
            for id_field in c.model.id_fields.clone() {
                let rhs = match other {
                    PolicyExpr::Auth { names } => {
                        let mut projected = names.to_vec();
                        projected.push(id_field.clone());
                        c.auth_literal(&projected)
                    }
                    PolicyExpr::Literal { value: JsonValue::Null } => Literal::Null,
                    _ => {
                        return Err(Error::config(anyhow::anyhow!(
                            "relation `{relation}` can only be compared with `auth()` or null"
                        )))
                    }
                };
                conds.push(match rhs {
                    Literal::Null => Expr::constant(false),
                    rhs => BinaryExpr::eq(
                        PropertyAccess::chain(&[id_field]),
                        rhs.into(),
                    ),
                });
            }
            Ok(and_all(conds).unwrap_or_else(|| Expr::constant(false)))
        })?;
        let exists = Expr::Exists(Box::new(RelationTest {
            relation: relation.to_owned(),
            filter: Some(filter),
            negated: false,
            all: false,
        }));
        Ok(if negated { Expr::not(exists) } else { exists })
    }

    fn compile_check(
        &mut self,
        relation: &str,
        operation: Option<PolicyOp>,
    ) -> Result<Expr> {
        let (_, field) = self
            .ctx
            .lookup_field(&self.model, relation)?
            .ok_or_else(|| {
                Error::config(anyhow::anyhow!(
                    "check() on `{}` references unknown relation `{relation}`",
                    self.model.name
                ))
            })?;
        let target_name = field.relation_target().ok_or_else(|| {
            Error::config(anyhow::anyhow!("`{relation}` is not a relation"))
        })?;
        let target = self.ctx.model(target_name)?;
        let op = match operation.unwrap_or(self.op) {
            PolicyOp::All => self.op,
            op => op,
        };

        // Cycles degrade to a bare existence test against the base table.
        if !self.visited.insert((target.name.clone(), op)) {
            return Ok(Expr::Exists(Box::new(RelationTest {
                relation: relation.to_owned(),
                filter: None,
                negated: false,
                all: false,
            })));
        }

        // A policy-free target compiles to a bare existence test.
        let filter = self.combined(&target, op)?;
        Ok(Expr::Exists(Box::new(RelationTest {
            relation: relation.to_owned(),
            filter,
            negated: false,
            all: false,
        })))
    }

    /// Projects the auth context down `names`, yielding a literal. Absent
    /// auth (or a missing projection) evaluates to NULL.
    fn auth_literal(&self, names: &[String]) -> Literal {
        let mut current = match self.ctx.auth {
            Some(auth) => auth.clone(),
            None => return Literal::Null,
        };
        for name in names {
            current = match current {
                JsonValue::Object(mut obj) => obj.remove(name).unwrap_or(JsonValue::Null),
                _ => JsonValue::Null,
            };
        }
        match json_literal(&current) {
            Ok(lit) => lit,
            // non-scalar projections cannot appear in SQL comparisons
            Err(_) => Literal::Null,
        }
    }

    fn before_literal(&self, name: &str) -> Result<Literal> {
        let before = self.before.ok_or_else(|| {
            Error::config(anyhow::anyhow!(
                "`before()` is only available in post-update policies"
            ))
        })?;
        json_literal(&before.get(name).cloned().unwrap_or(JsonValue::Null))
    }
}

/// Detects `auth() == this` (either order, both operators).
fn match_this_auth(left: &PolicyExpr, right: &PolicyExpr) -> bool {
    let is_this = |e: &PolicyExpr| matches!(e, PolicyExpr::This);
    let is_bare_auth =
        |e: &PolicyExpr| matches!(e, PolicyExpr::Auth { names } if names.is_empty());
    (is_this(left) && is_bare_auth(right)) || (is_bare_auth(left) && is_this(right))
}

fn binop(op: PolicyBinaryOp) -> BinaryOp {
    match op {
        PolicyBinaryOp::Eq => BinaryOp::Eq,
        PolicyBinaryOp::NotEq => BinaryOp::NotEq,
        PolicyBinaryOp::Lt => BinaryOp::Lt,
        PolicyBinaryOp::LtEq => BinaryOp::LtEq,
        PolicyBinaryOp::Gt => BinaryOp::Gt,
        PolicyBinaryOp::GtEq => BinaryOp::GtEq,
        PolicyBinaryOp::And | PolicyBinaryOp::Or => unreachable!("handled by compile"),
    }
}

/// The field-level read guard: NULL-projects the column unless the guard
/// holds. `None` when the field declares no read policies.
pub fn field_read_guard(
    ctx: &RequestContext,
    model: &Arc<Model>,
    field: &Arc<Field>,
) -> Result<Option<Expr>> {
    let applicable: Vec<_> = field
        .policies
        .iter()
        .filter(|p| p.applies_to(PolicyOp::Read))
        .collect();
    if applicable.is_empty() {
        return Ok(None);
    }
    let mut compiler = Compiler {
        ctx,
        model: model.clone(),
        op: PolicyOp::Read,
        before: None,
        visited: HashSet::new(),
    };
    let mut allows = vec![];
    let mut denies = vec![];
    for policy in applicable {
        let expr = policy
            .expr
            .clone()
            .unwrap_or_else(|| PolicyExpr::literal_bool(true));
        let compiled = compiler.compile(&expr)?;
        match policy.kind {
            PolicyKind::Allow => allows.push(compiled),
            PolicyKind::Deny => denies.push(compiled),
        }
    }
    // Fields are readable by default; explicit allows narrow that only when
    // present.
    let mut guard = or_all(allows).unwrap_or_else(|| Expr::constant(true));
    if let Some(deny) = or_all(denies) {
        guard = BinaryExpr::and(guard, Expr::not(deny));
    }
    Ok(Some(guard))
}
