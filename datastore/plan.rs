use crate::error::{Error, Result, ResultExt};
use crate::expr::{
    and_all, BinaryExpr, BinaryOp, Expr, JsonTest, JsonTestOp, ListTest, ListTestKind, Literal,
    PropertyAccess, RelationTest,
};
use crate::layout::{ColumnRepr, Layout, ModelTable, Name};
use crate::policy;
use itertools::Itertools;
use crate::sql_writer::SqlWriter;
use crate::util::truncate_identifier;
use quarry_schema::schema::{
    Field, Model, ModelName, PolicyKind, PolicyOp, PrimitiveType, Provider, Schema,
};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Bundle of contextual data used while compiling one operation.
pub struct RequestContext<'a> {
    pub schema: &'a Arc<Schema>,
    pub layout: &'a Arc<Layout>,
    pub provider: Provider,
    /// The auth projection set on the client, if any.
    pub auth: Option<&'a JsonValue>,
    pub computed: &'a ComputedRegistry,
    /// False for raw queries, which bypass policies by design.
    pub apply_policies: bool,
    /// Name of the running operation, for `currentOperation()`.
    pub operation: &'a str,
}

impl<'a> RequestContext<'a> {
    pub fn model(&self, name: &ModelName) -> Result<Arc<Model>> {
        self.schema
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::internal(anyhow::anyhow!("unknown model `{name}`")))
    }

    /// The model plus its ancestor chain (self first, root last).
    pub fn ancestry(&self, model: &Arc<Model>) -> Result<Vec<Arc<Model>>> {
        let mut out = vec![model.clone()];
        let mut current = model.clone();
        while let Some(base_name) = current.base_model.clone() {
            let base = self.model(&base_name)?;
            out.push(base.clone());
            current = base;
        }
        Ok(out)
    }

    /// Looks up a field on the model or any delegate ancestor.
    pub fn lookup_field(
        &self,
        model: &Arc<Model>,
        name: &str,
    ) -> Result<Option<(Arc<Model>, Arc<Field>)>> {
        for owner in self.ancestry(model)? {
            if let Some(field) = owner.field(name) {
                return Ok(Some((owner.clone(), field.clone())));
            }
        }
        Ok(None)
    }
}

/// SQL-expression builders for computed fields, registered at client
/// construction. The callback receives the table alias of the model and
/// returns a scalar SQL expression qualified against it.
pub type ComputedSqlFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Default, Clone)]
pub struct ComputedRegistry {
    map: HashMap<(String, String), ComputedSqlFn>,
}

impl ComputedRegistry {
    pub fn register(&mut self, model: &str, field: &str, builder: ComputedSqlFn) {
        self.map.insert((model.to_owned(), field.to_owned()), builder);
    }

    pub fn get(&self, model: &str, field: &str) -> Option<&ComputedSqlFn> {
        self.map.get(&(model.to_owned(), field.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Where the value of one selected column comes from.
#[derive(Debug, Clone)]
enum ColumnSource {
    Table { table_alias: String, col_name: Name },
    /// A column guarded by a field-level read policy: NULL unless the guard
    /// predicate holds.
    Guarded {
        table_alias: String,
        col_name: Name,
        guard: Expr,
    },
    Computed { sql: String },
    /// A correlated to-many subquery aggregating related rows into JSON.
    Subquery { sql: String },
}

#[derive(Debug, Clone)]
struct Column {
    /// Field name, also used to build the column alias.
    name: String,
    /// Alias of the table this column belongs to (also the alias prefix).
    table_alias: String,
    source: ColumnSource,
}

impl Column {
    fn alias(&self) -> ColumnAlias {
        ColumnAlias {
            field_name: self.name.clone(),
            table_alias: self.table_alias.clone(),
        }
    }
}

/// Uniquely identifies a retrieved column within the SQL query. Its string
/// representation is used in the SELECT statement and referenced by the
/// filtering and sorting layers wrapped around it.
struct ColumnAlias {
    field_name: String,
    table_alias: String,
}

impl fmt::Display for ColumnAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.table_alias, self.field_name)
    }
}

/// One output field of a queried entity and how to decode it from the row.
#[derive(Debug, Clone)]
pub enum QueryField {
    Scalar {
        name: String,
        repr: ColumnRepr,
        is_optional: bool,
        column_idx: usize,
    },
    /// A to-one relation loaded through a join.
    Entity { name: String, is_optional: bool },
    /// A to-many relation loaded as a JSON-aggregated subquery column.
    ToMany {
        name: String,
        column_idx: usize,
        /// Field name, repr and optionality of each projected child field,
        /// used to re-coerce the provider's JSON encoding.
        shape: Vec<(String, ColumnRepr, bool)>,
    },
    /// A `_count` entry over a relation.
    RelCount { relation: String, column_idx: usize },
}

/// A queried entity: its output fields, its table alias(es), and the to-one
/// joins hanging off it.
#[derive(Debug, Clone)]
pub struct QueriedEntity {
    pub model: Arc<Model>,
    pub fields: Vec<QueryField>,
    pub table_alias: String,
    /// Delegate ancestor tables joined on the primary key. The first entry
    /// is the model's own table.
    base_tables: Vec<(Arc<ModelTable>, String)>,
    joins: HashMap<String, Join>,
    /// Output projection; `None` keeps every field.
    pub allowed_fields: Option<HashSet<String>>,
}

impl QueriedEntity {
    pub fn get_child_entity<'a>(&'a self, child_name: &str) -> Option<&'a QueriedEntity> {
        self.joins.get(child_name).map(|c| &c.entity)
    }

    /// Index of the first id column, used to detect a missing joined row.
    pub fn id_column_idx(&self) -> Option<usize> {
        let id_field = self.model.id_fields.first()?;
        self.fields.iter().find_map(|f| match f {
            QueryField::Scalar { name, column_idx, .. } if name == id_field => Some(*column_idx),
            _ => None,
        })
    }

    fn locate_field_table(&self, field_name: &str) -> Option<(&Arc<ModelTable>, &str)> {
        for (table, alias) in &self.base_tables {
            if table.column(field_name).is_some() {
                return Some((table, alias));
            }
        }
        None
    }
}

/// A LEFT JOIN pulling in a to-one related entity.
#[derive(Debug, Clone)]
struct Join {
    entity: QueriedEntity,
    /// Pairs of (field on the parent, field on the child) equated in ON.
    on: Vec<(String, String)>,
    /// The child's read-policy predicate, ANDed into the ON clause so that
    /// unreadable rows join as NULL.
    guard: Option<Expr>,
}

/// SortKey specifies a field and the ordering direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field_name: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortBy {
    pub keys: Vec<SortKey>,
}

/// Operators applied to the result set, in order.
#[derive(Debug, Clone)]
pub enum QueryOp {
    Filter { expression: Expr },
    Take { count: u64 },
    Skip { count: u64 },
    SortBy(SortBy),
}

impl QueryOp {
    fn as_take(&self) -> Option<u64> {
        match self {
            QueryOp::Take { count } => Some(*count),
            _ => None,
        }
    }

    fn as_skip(&self) -> Option<u64> {
        match self {
            QueryOp::Skip { count } => Some(*count),
            _ => None,
        }
    }

    fn as_sort_by(&self) -> Option<&SortBy> {
        match self {
            QueryOp::SortBy(sort) => Some(sort),
            _ => None,
        }
    }
}

/// An executable SELECT: raw SQL plus the decoding recipe.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw_sql: String,
    pub entity: QueriedEntity,
}

/// Description of what to select from an entity, parsed from
/// `select`/`include`/`omit` arguments.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Exclusive projection (`select`).
    pub select: Option<serde_json::Map<String, JsonValue>>,
    /// Additional relations (`include`).
    pub include: Option<serde_json::Map<String, JsonValue>>,
    /// Fields to drop from the default projection (`omit`).
    pub omit: Option<serde_json::Map<String, JsonValue>>,
}

impl Selection {
    fn wants_relation(&self, name: &str) -> Option<&JsonValue> {
        if let Some(select) = &self.select {
            return select.get(name).filter(|v| !is_false(v));
        }
        if let Some(include) = &self.include {
            return include.get(name).filter(|v| !is_false(v));
        }
        None
    }

    fn allowed_fields(&self, entity_fields: &[QueryField]) -> Option<HashSet<String>> {
        if let Some(select) = &self.select {
            let mut allowed: HashSet<String> = select
                .iter()
                .filter(|(_, v)| !is_false(v))
                .map(|(k, _)| k.clone())
                .collect();
            allowed.retain(|k| k != "_count");
            if select.contains_key("_count") {
                allowed.insert("_count".to_owned());
            }
            return Some(allowed);
        }
        let mut allowed: HashSet<String> = entity_fields
            .iter()
            .filter_map(|f| match f {
                QueryField::Scalar { name, .. } => Some(name.clone()),
                QueryField::Entity { name, .. } => Some(name.clone()),
                QueryField::ToMany { name, .. } => Some(name.clone()),
                QueryField::RelCount { .. } => Some("_count".to_owned()),
            })
            .collect();
        if let Some(omit) = &self.omit {
            for (name, v) in omit {
                if !is_false(v) {
                    allowed.remove(name);
                }
            }
        }
        Some(allowed)
    }
}

fn is_false(v: &JsonValue) -> bool {
    matches!(v, JsonValue::Bool(false))
}

/// Compiles a `Query` for an entity: recursively descends through the
/// selection capturing the joins and subqueries needed for nested types,
/// then `build_query` emits the raw SQL string along with the decode recipe.
#[derive(Clone)]
pub struct QueryPlan {
    columns: Vec<Column>,
    entity: QueriedEntity,
    join_counter: usize,
    operators: Vec<QueryOp>,
    provider: Provider,
}

impl QueryPlan {
    /// Builds a plan selecting every scalar field of `model`, without
    /// policies. Used internally for mutation target selection.
    pub fn from_model(ctx: &RequestContext, model: &Arc<Model>) -> Result<Self> {
        Self::build(ctx, model, &Selection::default(), false)
    }

    /// Builds a plan honoring the user selection. When `with_policies` is
    /// set, joined entities get their read-policy guards; the base model's
    /// own read predicate is injected later by the policy interceptor.
    pub fn build(
        ctx: &RequestContext,
        model: &Arc<Model>,
        selection: &Selection,
        with_policies: bool,
    ) -> Result<Self> {
        let mut plan = QueryPlan {
            columns: vec![],
            entity: QueriedEntity {
                model: model.clone(),
                fields: vec![],
                table_alias: String::new(),
                base_tables: vec![],
                joins: HashMap::new(),
                allowed_fields: None,
            },
            join_counter: 0,
            operators: vec![],
            provider: ctx.provider,
        };
        let alias = model.table_name.clone();
        plan.entity = plan.load_entity(ctx, model, &alias, selection, with_policies)?;
        Ok(plan)
    }

    pub fn entity(&self) -> &QueriedEntity {
        &self.entity
    }

    /// The output alias of one of the base entity's columns in the emitted
    /// SQL, as referenced by outer wraps (aggregates, groupBy).
    pub fn output_alias(&self, field_name: &str) -> String {
        ColumnAlias {
            field_name: field_name.to_owned(),
            table_alias: self.entity.table_alias.clone(),
        }
        .to_string()
    }

    pub fn base_model(&self) -> &Arc<Model> {
        &self.entity.model
    }

    pub fn push_filter(&mut self, expression: Expr) {
        self.operators.push(QueryOp::Filter { expression });
    }

    /// Injects a filter that applies before any skip/take already recorded,
    /// i.e. at the innermost wrap. Used by the policy interceptor so that
    /// pagination happens over the readable rows only.
    pub fn push_policy_filter(&mut self, expression: Expr) {
        self.operators.insert(0, QueryOp::Filter { expression });
    }

    pub fn extend_operators(&mut self, ops: Vec<QueryOp>) {
        self.operators.extend(ops);
    }

    fn next_join_alias(&mut self, parent: &Model, child: &Model) -> String {
        let alias = format!("JOIN{}_{}_TO_{}", self.join_counter, parent.name, child.name);
        self.join_counter += 1;
        truncate_identifier(&alias).to_owned()
    }

    fn load_entity(
        &mut self,
        ctx: &RequestContext,
        model: &Arc<Model>,
        alias: &str,
        selection: &Selection,
        with_policies: bool,
    ) -> Result<QueriedEntity> {
        let ancestry = ctx.ancestry(model)?;
        let mut base_tables = Vec::with_capacity(ancestry.len());
        for (i, owner) in ancestry.iter().enumerate() {
            let table = ctx.layout.table(&owner.name)?.clone();
            let table_alias = if i == 0 {
                alias.to_owned()
            } else {
                truncate_identifier(&format!("{alias}__base{i}")).to_owned()
            };
            base_tables.push((table, table_alias));
        }

        let mut entity = QueriedEntity {
            model: model.clone(),
            fields: vec![],
            table_alias: alias.to_owned(),
            base_tables,
            joins: HashMap::new(),
            allowed_fields: None,
        };

        // All scalar fields ride along regardless of the projection; the
        // projection is applied when shaping the JSON response. This keeps
        // correlation columns (foreign keys, ids) available to relation
        // filters and policy predicates.
        let mut count_relations: Vec<String> = vec![];
        for owner in &ancestry {
            for field in owner.fields.values() {
                if entity
                    .fields
                    .iter()
                    .any(|f| query_field_name(f) == field.name)
                {
                    continue; // id fields repeat along the ancestry
                }
                if field.computed {
                    self.add_computed_field(ctx, &entity, owner, field)
                        .map(|qf| entity.fields.push(qf))?;
                    continue;
                }
                if field.is_relation() {
                    if let Some(payload) = selection.wants_relation(&field.name).cloned() {
                        let qf = self.add_relation_field(
                            ctx,
                            &mut entity,
                            owner,
                            field,
                            &payload,
                            with_policies,
                        )?;
                        entity.fields.push(qf);
                    }
                    continue;
                }
                let qf = self.add_scalar_field(ctx, &entity, owner, field, with_policies)?;
                entity.fields.push(qf);
            }
        }

        // `_count` selections over to-many relations.
        if let Some(payload) = selection.wants_relation("_count") {
            if let Some(count_select) = payload.get("select").and_then(|v| v.as_object()) {
                for (rel_name, v) in count_select {
                    if !is_false(v) {
                        count_relations.push(rel_name.clone());
                    }
                }
            }
        }
        for rel_name in count_relations {
            let (owner, field) = ctx
                .lookup_field(model, &rel_name)?
                .ok_or_else(|| relation_error(model, &rel_name))?;
            let qf = self.add_relation_count(ctx, &entity, &owner, &field, with_policies)?;
            entity.fields.push(qf);
        }

        entity.allowed_fields = selection.allowed_fields(&entity.fields);

        // Unconditionally read-denied fields drop out of the default
        // projection; an explicit select still gets them, as NULL.
        if with_policies && selection.select.is_none() {
            if let Some(allowed) = &mut entity.allowed_fields {
                for owner in &ancestry {
                    for field in owner.fields.values() {
                        let denied = field.policies.iter().any(|p| {
                            p.kind == PolicyKind::Deny
                                && p.expr.is_none()
                                && p.applies_to(PolicyOp::Read)
                        });
                        if denied {
                            allowed.remove(&field.name);
                        }
                    }
                }
            }
        }
        Ok(entity)
    }

    fn add_scalar_field(
        &mut self,
        ctx: &RequestContext,
        entity: &QueriedEntity,
        owner: &Arc<Model>,
        field: &Arc<Field>,
        with_policies: bool,
    ) -> Result<QueryField> {
        let (table, table_alias) = entity
            .locate_field_table(&field.name)
            .ok_or_else(|| field_error(owner, &field.name))?;
        let col = table.column(&field.name).unwrap();
        let guard = if with_policies {
            policy::compile::field_read_guard(ctx, owner, field)?
        } else {
            None
        };
        // A guarded column can be NULL-masked regardless of its own
        // nullability.
        let is_optional = col.optional || guard.is_some();
        let source = match guard {
            Some(guard) => ColumnSource::Guarded {
                table_alias: table_alias.to_owned(),
                col_name: col.col_name.clone(),
                guard,
            },
            None => ColumnSource::Table {
                table_alias: table_alias.to_owned(),
                col_name: col.col_name.clone(),
            },
        };
        let column_idx = self.columns.len();
        self.columns.push(Column {
            name: field.name.clone(),
            table_alias: entity.table_alias.clone(),
            source,
        });
        Ok(QueryField::Scalar {
            name: field.name.clone(),
            repr: col.repr,
            is_optional,
            column_idx,
        })
    }

    fn add_computed_field(
        &mut self,
        ctx: &RequestContext,
        entity: &QueriedEntity,
        owner: &Arc<Model>,
        field: &Arc<Field>,
    ) -> Result<QueryField> {
        let builder = ctx
            .computed
            .get(owner.name.as_str(), &field.name)
            .ok_or_else(|| {
                Error::config(anyhow::anyhow!(
                    "no expression registered for computed field `{}.{}`",
                    owner.name,
                    field.name
                ))
            })?;
        let sql = builder(&entity.table_alias);
        let repr = field
            .scalar_type()
            .map(scalar_repr)
            .unwrap_or(ColumnRepr::JsonAsText);
        let column_idx = self.columns.len();
        self.columns.push(Column {
            name: field.name.clone(),
            table_alias: entity.table_alias.clone(),
            source: ColumnSource::Computed { sql },
        });
        Ok(QueryField::Scalar {
            name: field.name.clone(),
            repr,
            is_optional: true,
            column_idx,
        })
    }

    fn add_relation_field(
        &mut self,
        ctx: &RequestContext,
        entity: &mut QueriedEntity,
        owner: &Arc<Model>,
        field: &Arc<Field>,
        payload: &JsonValue,
        with_policies: bool,
    ) -> Result<QueryField> {
        let target_name = field
            .relation_target()
            .ok_or_else(|| relation_error(owner, &field.name))?;
        let target = ctx.model(target_name)?;
        let nested: Selection = selection_of_payload(payload)?;

        if field.is_list() {
            let (sql, shape) =
                self.build_to_many_subquery(ctx, entity, owner, field, &target, payload, with_policies)?;
            let column_idx = self.columns.len();
            self.columns.push(Column {
                name: field.name.clone(),
                table_alias: entity.table_alias.clone(),
                source: ColumnSource::Subquery { sql },
            });
            return Ok(QueryField::ToMany {
                name: field.name.clone(),
                column_idx,
                shape,
            });
        }

        // To-one: LEFT JOIN on the link columns, with the child's read
        // policy folded into the ON clause.
        let alias = self.next_join_alias(owner, &target);
        let child_entity = self.load_entity(ctx, &target, &alias, &nested, with_policies)?;
        let on = relation_link(ctx, owner, field, &target)?;
        let guard = if with_policies {
            policy::compile::read_predicate(ctx, &target)?
        } else {
            None
        };
        entity.joins.insert(
            field.name.clone(),
            Join { entity: child_entity, on, guard },
        );
        Ok(QueryField::Entity {
            name: field.name.clone(),
            is_optional: field.optional,
        })
    }

    /// Builds the correlated JSON-aggregation subquery selecting a to-many
    /// relation. The aggregation function and object constructor are the
    /// only provider-specific parts.
    #[allow(clippy::too_many_arguments)]
    fn build_to_many_subquery(
        &mut self,
        ctx: &RequestContext,
        entity: &QueriedEntity,
        owner: &Arc<Model>,
        field: &Arc<Field>,
        target: &Arc<Model>,
        payload: &JsonValue,
        with_policies: bool,
    ) -> Result<(String, Vec<(String, ColumnRepr, bool)>)> {
        let sub_alias = format!("sub{}", self.join_counter);
        self.join_counter += 1;
        let sub_entity = load_sub_entity(ctx, target, &sub_alias)?;

        // Projection: explicitly selected scalar child fields, or all.
        let nested = selection_of_payload(payload)?;
        let allowed = nested
            .select
            .as_ref()
            .map(|sel| {
                sel.iter()
                    .filter(|(_, v)| !is_false(v))
                    .map(|(k, _)| k.clone())
                    .collect::<HashSet<_>>()
            });
        let mut shape = vec![];
        let mut projected: Vec<(String, String)> = vec![]; // (field, column sql)
        for f in &sub_entity.fields {
            if let QueryField::Scalar { name, repr, is_optional, .. } = f {
                if allowed.as_ref().map_or(false, |a| !a.contains(name)) {
                    continue;
                }
                if let Some(omit) = &nested.omit {
                    if omit.get(name).map_or(false, |v| !is_false(v)) {
                        continue;
                    }
                }
                let (table, table_alias) = sub_entity
                    .locate_field_table(name)
                    .ok_or_else(|| field_error(target, name))?;
                let col = table.column(name).unwrap();
                let mut w = SqlWriter::new(ctx.provider);
                w.write_ident(table_alias);
                w.write_str(".");
                w.write_name(&col.col_name);
                projected.push((name.clone(), w.build()));
                shape.push((name.clone(), *repr, *is_optional));
            }
        }

        // Correlation: child link columns equal the parent's.
        let link = relation_link(ctx, owner, field, target)?;
        let mut conds: Vec<String> = vec![];
        for (parent_field, child_field) in &link {
            let (p_table, p_alias) = entity
                .locate_field_table(parent_field)
                .ok_or_else(|| field_error(owner, parent_field))?;
            let p_col = p_table.column(parent_field).unwrap();
            let (c_table, c_alias) = sub_entity
                .locate_field_table(child_field)
                .ok_or_else(|| field_error(target, child_field))?;
            let c_col = c_table.column(child_field).unwrap();
            let mut w = SqlWriter::new(ctx.provider);
            w.write_ident(c_alias);
            w.write_str(".");
            w.write_name(&c_col.col_name);
            w.write_str(" = ");
            w.write_ident(p_alias);
            w.write_str(".");
            w.write_name(&p_col.col_name);
            conds.push(w.build());
        }

        if with_policies {
            if let Some(pred) = policy::compile::read_predicate(ctx, target)? {
                let mut w = SqlWriter::new(ctx.provider);
                render_direct(ctx, &mut w, &sub_entity, &pred)?;
                conds.push(w.build());
            }
        }
        if let Some(where_arg) = payload.get("where") {
            let expr = crate::filter::where_to_expr(ctx, target, where_arg)?;
            let mut w = SqlWriter::new(ctx.provider);
            render_direct(ctx, &mut w, &sub_entity, &expr)?;
            conds.push(w.build());
        }

        // Project with output aliases so the JSON object constructor can
        // reference the columns by name.
        let from_clause = sub_from_clause(ctx, &sub_entity)?;
        let aliased_projection = projected
            .iter()
            .map(|(name, sql)| format!("{} AS {}", sql, quote_plain(ctx.provider, name)))
            .join(", ");
        let mut inner = format!(
            "SELECT {} FROM {} WHERE {}",
            aliased_projection,
            from_clause,
            if conds.is_empty() { "1 = 1".to_owned() } else { conds.join(" AND ") },
        );
        if let Some(order) = payload.get("orderBy") {
            let keys = parse_order_by(target, order)?;
            if !keys.is_empty() {
                let order_str = keys
                    .iter()
                    .map(|k| {
                        let (table, table_alias) =
                            sub_entity.locate_field_table(&k.field_name).unwrap();
                        let col = table.column(&k.field_name).unwrap();
                        let mut w = SqlWriter::new(ctx.provider);
                        w.write_ident(table_alias);
                        w.write_str(".");
                        w.write_name(&col.col_name);
                        format!("{} {}", w.build(), if k.ascending { "ASC" } else { "DESC" })
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                inner = format!("{inner} ORDER BY {order_str}");
            }
        }
        if let Some(take) = payload.get("take").and_then(|v| v.as_u64()) {
            inner = format!("{inner} LIMIT {take}");
        }

        // Aggregate the projected columns into a JSON array of objects.
        let mut pairs = String::new();
        for (i, (name, _)) in projected.iter().enumerate() {
            if i > 0 {
                pairs.push_str(", ");
            }
            pairs.push_str(&format!(
                "'{}', inner_rows.{}",
                name.replace('\'', ""),
                quote_plain(ctx.provider, name)
            ));
        }

        // The aggregate is cast to text so the Any driver decodes it
        // uniformly; the decoder parses it back into an array.
        let agg = match ctx.provider {
            Provider::Sqlite => format!(
                "(SELECT json_group_array(json_object({pairs})) FROM ({inner}) AS inner_rows)"
            ),
            Provider::Postgres => format!(
                "(SELECT COALESCE(json_agg(json_build_object({pairs}))::text, '[]') FROM ({inner}) AS inner_rows)"
            ),
            Provider::MySql => format!(
                "(SELECT CAST(COALESCE(JSON_ARRAYAGG(JSON_OBJECT({pairs})), JSON_ARRAY()) AS CHAR) FROM ({inner}) AS inner_rows)"
            ),
        };
        Ok((agg, shape))
    }

    fn add_relation_count(
        &mut self,
        ctx: &RequestContext,
        entity: &QueriedEntity,
        owner: &Arc<Model>,
        field: &Arc<Field>,
        with_policies: bool,
    ) -> Result<QueryField> {
        let target_name = field
            .relation_target()
            .ok_or_else(|| relation_error(owner, &field.name))?;
        let target = ctx.model(target_name)?;
        let sub_alias = format!("cnt{}", self.join_counter);
        self.join_counter += 1;
        let sub_entity = load_sub_entity(ctx, &target, &sub_alias)?;

        let link = relation_link(ctx, owner, field, &target)?;
        let mut conds: Vec<String> = vec![];
        for (parent_field, child_field) in &link {
            let (p_table, p_alias) = entity
                .locate_field_table(parent_field)
                .ok_or_else(|| field_error(owner, parent_field))?;
            let p_col = p_table.column(parent_field).unwrap();
            let (c_table, c_alias) = sub_entity
                .locate_field_table(child_field)
                .ok_or_else(|| field_error(&target, child_field))?;
            let c_col = c_table.column(child_field).unwrap();
            let mut w = SqlWriter::new(ctx.provider);
            w.write_ident(c_alias);
            w.write_str(".");
            w.write_name(&c_col.col_name);
            w.write_str(" = ");
            w.write_ident(p_alias);
            w.write_str(".");
            w.write_name(&p_col.col_name);
            conds.push(w.build());
        }
        // Counting a concrete subtype through a delegate base counts only
        // rows of that subtype: the join against the subtype's own table in
        // the FROM clause below already restricts the rows.
        if with_policies {
            if let Some(pred) = policy::compile::read_predicate(ctx, &target)? {
                let mut w = SqlWriter::new(ctx.provider);
                render_direct(ctx, &mut w, &sub_entity, &pred)?;
                conds.push(w.build());
            }
        }
        let from_clause = sub_from_clause(ctx, &sub_entity)?;
        let sql = format!(
            "(SELECT COUNT(*) FROM {} WHERE {})",
            from_clause,
            if conds.is_empty() { "1 = 1".to_owned() } else { conds.join(" AND ") },
        );
        let column_idx = self.columns.len();
        self.columns.push(Column {
            name: format!("_count_{}", field.name),
            table_alias: entity.table_alias.clone(),
            source: ColumnSource::Subquery { sql },
        });
        Ok(QueryField::RelCount { relation: field.name.clone(), column_idx })
    }

    fn make_column_string(&self) -> Result<String> {
        let mut parts = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            let alias = c.alias();
            let rendered = match &c.source {
                ColumnSource::Table { table_alias, col_name } => {
                    let mut w = SqlWriter::new(self.provider);
                    w.write_ident(table_alias);
                    w.write_str(".");
                    w.write_name(col_name);
                    w.build()
                }
                ColumnSource::Guarded { table_alias, col_name, guard } => {
                    let mut w = SqlWriter::new(self.provider);
                    w.write_str("CASE WHEN ");
                    render_simple(&mut w, &Scope::Direct(&self.entity), guard)?;
                    w.write_str(" THEN ");
                    w.write_ident(table_alias);
                    w.write_str(".");
                    w.write_name(col_name);
                    w.write_str(" ELSE NULL END");
                    w.build()
                }
                ColumnSource::Computed { sql } => format!("({sql})"),
                ColumnSource::Subquery { sql } => sql.clone(),
            };
            parts.push(format!(
                "{} AS {}",
                rendered,
                quote_plain(self.provider, &alias.to_string())
            ));
        }
        Ok(parts.join(", "))
    }

    fn make_join_string(&self, ctx: &RequestContext) -> Result<String> {
        fn gather_joins(
            ctx: &RequestContext,
            provider: Provider,
            entity: &QueriedEntity,
            out: &mut String,
        ) -> Result<()> {
            for join in entity.joins.values() {
                // the joined entity's own table plus its delegate ancestors
                out.push_str("LEFT JOIN ");
                out.push_str(&join.entity.base_tables[0].0.sql_reference(provider));
                out.push_str(" AS ");
                out.push_str(&quote_plain(provider, &join.entity.base_tables[0].1));
                out.push_str(" ON ");
                let mut conds: Vec<String> = vec![];
                for (parent_field, child_field) in &join.on {
                    let (p_table, p_alias) = entity
                        .locate_field_table(parent_field)
                        .ok_or_else(|| field_error(&entity.model, parent_field))?;
                    let p_col = p_table.column(parent_field).unwrap();
                    let (c_table, c_alias) = join
                        .entity
                        .locate_field_table(child_field)
                        .ok_or_else(|| field_error(&join.entity.model, child_field))?;
                    let c_col = c_table.column(child_field).unwrap();
                    let mut w = SqlWriter::new(provider);
                    w.write_ident(p_alias);
                    w.write_str(".");
                    w.write_name(&p_col.col_name);
                    w.write_str(" = ");
                    w.write_ident(c_alias);
                    w.write_str(".");
                    w.write_name(&c_col.col_name);
                    conds.push(w.build());
                }
                if let Some(guard) = &join.guard {
                    let mut w = SqlWriter::new(provider);
                    render_direct(ctx, &mut w, &join.entity, guard)?;
                    conds.push(w.build());
                }
                out.push_str(&conds.join(" AND "));
                out.push('\n');
                // delegate ancestors of the joined entity
                push_base_joins(provider, &join.entity, out);
                gather_joins(ctx, provider, &join.entity, out)?;
            }
            Ok(())
        }

        let mut out = String::new();
        push_base_joins(self.provider, &self.entity, &mut out);
        gather_joins(ctx, self.provider, &self.entity, &mut out)?;
        Ok(out)
    }

    fn make_core_select(&self, ctx: &RequestContext) -> Result<String> {
        let column_string = self.make_column_string()?;
        let join_string = self.make_join_string(ctx)?;
        let (base_table, base_alias) = &self.entity.base_tables[0];
        Ok(format!(
            "SELECT {} FROM {} AS {} {}",
            column_string,
            base_table.sql_reference(self.provider),
            quote_plain(self.provider, base_alias),
            join_string,
        ))
    }

    /// Splits the operators' slice at the first Take or Skip into the part
    /// to apply at this wrap level (inclusive) and the remainder.
    fn split_on_first_take<'b>(&self, ops: &'b [QueryOp]) -> (&'b [QueryOp], &'b [QueryOp]) {
        for (i, op) in ops.iter().enumerate() {
            match op {
                QueryOp::Take { .. } | QueryOp::Skip { .. } => {
                    return (&ops[..i + 1], &ops[i + 1..]);
                }
                _ => (),
            }
        }
        (ops, &[])
    }

    fn gather_filters(&self, ops: &[QueryOp]) -> Option<Expr> {
        let mut expr = None;
        for op in ops {
            if let QueryOp::Filter { expression } = op {
                expr = Some(match expr {
                    Some(prev) => BinaryExpr::and(prev, expression.clone()),
                    None => expression.clone(),
                });
            }
        }
        expr
    }

    fn find_last_sort_by<'b>(&self, ops: &'b [QueryOp]) -> Option<&'b SortBy> {
        ops.iter().rev().find_map(|op| op.as_sort_by())
    }

    fn find_take_count(&self, ops: &[QueryOp]) -> Option<u64> {
        ops.iter().rev().find_map(|op| op.as_take())
    }

    fn find_skip_count(&self, ops: &[QueryOp]) -> Option<u64> {
        ops.iter().rev().find_map(|op| op.as_skip())
    }

    fn make_filter_string(&self, ctx: &RequestContext, expr: &Option<Expr>) -> Result<String> {
        Ok(match expr {
            Some(expr) => {
                let mut w = SqlWriter::new(self.provider);
                render_wrapped(ctx, &mut w, &self.entity, expr)?;
                format!("WHERE {}", w.build())
            }
            None => String::new(),
        })
    }

    fn make_sort_string(&self, sort: Option<&SortBy>) -> Result<String> {
        let sort_str = if let Some(sort) = sort {
            let mut order_tokens = vec![];
            for sort_key in &sort.keys {
                let known = self
                    .columns
                    .iter()
                    .any(|c| c.name == sort_key.field_name && c.table_alias == self.entity.table_alias);
                if !known {
                    return Err(Error::invalid_input(vec![format!(
                        "model `{}` has no sortable field named `{}`",
                        self.entity.model.name, sort_key.field_name
                    )]));
                }
                let order = if sort_key.ascending { "ASC" } else { "DESC" };
                let alias = ColumnAlias {
                    field_name: sort_key.field_name.clone(),
                    table_alias: self.entity.table_alias.clone(),
                };
                order_tokens.push(format!(
                    "{} {}",
                    quote_plain(self.provider, &alias.to_string()),
                    order
                ));
            }
            format!("ORDER BY {}", order_tokens.join(", "))
        } else {
            String::new()
        };
        Ok(sort_str)
    }

    fn make_limit_and_offset_string(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match self.provider {
            // Covers SQLite not supporting a standalone OFFSET without LIMIT.
            Provider::Sqlite if limit.is_none() && offset.is_some() => {
                format!("LIMIT {},-1", offset.unwrap())
            }
            // MySQL has the same restriction, with a different idiom.
            Provider::MySql if limit.is_none() && offset.is_some() => {
                format!("LIMIT 18446744073709551615 OFFSET {}", offset.unwrap())
            }
            _ => {
                let limit_str = limit.map_or(String::new(), |l| format!("LIMIT {}", l));
                let offset_str = offset.map_or(String::new(), |o| format!("OFFSET {}", o));
                format!("{} {}", limit_str, offset_str)
            }
        }
    }

    fn make_raw_query(&self, ctx: &RequestContext) -> Result<String> {
        let mut sql_query = self.make_core_select(ctx)?;
        let mut remaining_ops: &[QueryOp] = &self.operators[..];
        while !remaining_ops.is_empty() {
            let (ops, remainder) = self.split_on_first_take(remaining_ops);
            remaining_ops = remainder;

            let filter_expr = self.gather_filters(ops);
            let filter_string = self.make_filter_string(ctx, &filter_expr)?;

            let sort = self.find_last_sort_by(ops);
            let sort_string = self.make_sort_string(sort)?;

            let limit = self.find_take_count(ops);
            let offset = self.find_skip_count(ops);
            let lo_string = self.make_limit_and_offset_string(limit, offset);

            // The "AS subquery" part is necessary to make Postgres happy.
            sql_query = format!(
                "SELECT * FROM ({}) AS subquery {} {} {}",
                sql_query, filter_string, sort_string, lo_string
            );
        }
        Ok(sql_query)
    }

    pub fn build_query(&self, ctx: &RequestContext) -> Result<Query> {
        Ok(Query {
            raw_sql: self.make_raw_query(ctx)?,
            entity: self.entity.clone(),
        })
    }

    /// Emits `SELECT <id cols> FROM (plan SQL)`; used as the target-row
    /// subselect of UPDATE/DELETE statements.
    pub fn build_id_select(&self, ctx: &RequestContext) -> Result<(String, Vec<String>)> {
        let inner = self.make_raw_query(ctx)?;
        let id_aliases: Vec<String> = self
            .entity
            .model
            .id_fields
            .iter()
            .map(|f| {
                ColumnAlias {
                    field_name: f.clone(),
                    table_alias: self.entity.table_alias.clone(),
                }
                .to_string()
            })
            .collect();
        let cols = id_aliases
            .iter()
            .map(|a| quote_plain(self.provider, a))
            .join(", ");
        Ok((
            format!("SELECT {cols} FROM ({inner}) AS target_rows"),
            id_aliases,
        ))
    }
}

fn push_base_joins(provider: Provider, entity: &QueriedEntity, out: &mut String) {
    for (table, alias) in entity.base_tables.iter().skip(1) {
        let (own_table, own_alias) = &entity.base_tables[0];
        out.push_str("INNER JOIN ");
        out.push_str(&table.sql_reference(provider));
        out.push_str(" AS ");
        out.push_str(&quote_plain(provider, alias));
        out.push_str(" ON ");
        let conds: Vec<String> = own_table
            .id_fields
            .iter()
            .map(|id_field| {
                let own_col = own_table.column(id_field).expect("id column");
                let base_col = table.column(id_field).expect("base id column");
                format!(
                    "{}.{} = {}.{}",
                    quote_plain(provider, own_alias),
                    quote_name(provider, &own_col.col_name),
                    quote_plain(provider, alias),
                    quote_name(provider, &base_col.col_name),
                )
            })
            .collect();
        out.push_str(&conds.join(" AND "));
        out.push('\n');
    }
}

/// Loads a standalone entity context (table aliases plus delegate ancestor
/// joins) for a subquery, discarding the scratch plan's columns.
fn load_sub_entity(
    ctx: &RequestContext,
    model: &Arc<Model>,
    alias: &str,
) -> Result<QueriedEntity> {
    let mut scratch = QueryPlan {
        columns: vec![],
        entity: QueriedEntity {
            model: model.clone(),
            fields: vec![],
            table_alias: alias.to_owned(),
            base_tables: vec![],
            joins: HashMap::new(),
            allowed_fields: None,
        },
        join_counter: 0,
        operators: vec![],
        provider: ctx.provider,
    };
    scratch.load_entity(ctx, model, alias, &Selection::default(), false)
}

fn sub_from_clause(ctx: &RequestContext, entity: &QueriedEntity) -> Result<String> {
    let (base_table, base_alias) = &entity.base_tables[0];
    let mut from = format!(
        "{} AS {}",
        base_table.sql_reference(ctx.provider),
        quote_plain(ctx.provider, base_alias)
    );
    let mut joins = String::new();
    push_base_joins(ctx.provider, entity, &mut joins);
    if !joins.is_empty() {
        from.push(' ');
        from.push_str(joins.trim_end());
    }
    Ok(from)
}

fn quote_plain(provider: Provider, ident: &str) -> String {
    let mut w = SqlWriter::new(provider);
    w.write_ident(ident);
    w.build()
}

fn quote_name(provider: Provider, name: &Name) -> String {
    let mut w = SqlWriter::new(provider);
    w.write_name(name);
    w.build()
}

fn field_error(model: &Model, field: &str) -> Error {
    Error::invalid_input(vec![format!(
        "model `{}` has no field named `{}`",
        model.name, field
    )])
}

fn relation_error(model: &Model, field: &str) -> Error {
    Error::invalid_input(vec![format!(
        "`{}` is not a relation of model `{}`",
        field, model.name
    )])
}

/// Resolves the link columns of a relation as pairs of
/// `(field on this model, field on the target)`.
pub fn relation_link(
    ctx: &RequestContext,
    model: &Arc<Model>,
    field: &Arc<Field>,
    target: &Arc<Model>,
) -> Result<Vec<(String, String)>> {
    let relation = field.relation.as_ref().expect("relation field");
    if relation.is_owning() {
        return Ok(relation
            .fields
            .iter()
            .cloned()
            .zip(relation.references.iter().cloned())
            .collect());
    }
    // The opposite side owns the foreign key.
    let opposite_name = relation.opposite.as_deref().ok_or_else(|| {
        Error::config(anyhow::anyhow!(
            "relation `{}.{}` declares neither `fields` nor an opposite",
            model.name,
            field.name
        ))
    })?;
    let (_, opposite) = ctx
        .lookup_field(target, opposite_name)?
        .ok_or_else(|| relation_error(target, opposite_name))?;
    let opp_rel = opposite.relation.as_ref().ok_or_else(|| {
        Error::config(anyhow::anyhow!(
            "field `{}.{}` is not a relation",
            target.name,
            opposite_name
        ))
    })?;
    Ok(opp_rel
        .references
        .iter()
        .cloned()
        .zip(opp_rel.fields.iter().cloned())
        .collect())
}

/// Parses an `orderBy` argument (an object or an array of objects mapping a
/// field to `"asc"`/`"desc"`) into sort keys.
pub fn parse_order_by(model: &Model, value: &JsonValue) -> Result<Vec<SortKey>> {
    let mut keys = vec![];
    let items: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(_) => vec![value],
        JsonValue::Null => return Ok(keys),
        _ => {
            return Err(Error::invalid_input(vec![
                "orderBy must be an object or an array of objects".to_owned(),
            ]))
        }
    };
    for item in items {
        let obj = item.as_object().ok_or_else(|| {
            Error::invalid_input(vec!["orderBy entries must be objects".to_owned()])
        })?;
        for (field_name, dir) in obj {
            let ascending = match dir.as_str() {
                Some("asc") => true,
                Some("desc") => false,
                _ => {
                    return Err(Error::invalid_input(vec![format!(
                        "orderBy direction for `{field_name}` must be \"asc\" or \"desc\""
                    )]))
                }
            };
            if !model.has_field(field_name) {
                return Err(field_error(model, field_name));
            }
            keys.push(SortKey { field_name: field_name.clone(), ascending });
        }
    }
    Ok(keys)
}

/// Builds the lexicographic cursor filter: rows at or after the cursor
/// position in the given sort. The cursor row itself is included; pagination
/// skips it with `skip: 1` when exclusive behavior is wanted.
pub fn cursor_filter(
    model: &Model,
    sort_keys: &[SortKey],
    cursor: &serde_json::Map<String, JsonValue>,
) -> Result<Expr> {
    let mut axes: Vec<(SortKey, Literal)> = vec![];
    for key in sort_keys {
        if !model.has_field(&key.field_name) {
            return Err(field_error(model, &key.field_name));
        }
        let value = cursor.get(&key.field_name).cloned().ok_or_else(|| {
            Error::invalid_input(vec![format!(
                "cursor must carry a value for every orderBy field; `{}` is missing",
                key.field_name
            )])
        })?;
        axes.push((key.clone(), json_literal(&value)?));
    }
    if axes.is_empty() {
        return Err(Error::invalid_input(vec![
            "cursor requires a non-empty orderBy".to_owned(),
        ]));
    }

    let mut expr: Option<Expr> = None;
    for (i, (key, value)) in axes.iter().enumerate() {
        let op = if key.ascending {
            if i == axes.len() - 1 { BinaryOp::GtEq } else { BinaryOp::Gt }
        } else if i == axes.len() - 1 {
            BinaryOp::LtEq
        } else {
            BinaryOp::Lt
        };
        let mut e: Expr = BinaryExpr::new(
            op,
            PropertyAccess::chain(&[key.field_name.clone()]),
            value.clone().into(),
        )
        .into();
        for (prev_key, prev_value) in &axes[0..i] {
            let eq = BinaryExpr::eq(
                PropertyAccess::chain(&[prev_key.field_name.clone()]),
                prev_value.clone().into(),
            );
            e = BinaryExpr::and(eq, e);
        }
        expr = Some(match expr {
            Some(prev) => BinaryExpr::or(prev, e),
            None => e,
        });
    }
    Ok(expr.unwrap())
}

pub fn json_literal(value: &JsonValue) -> Result<Literal> {
    Ok(match value {
        JsonValue::Null => Literal::Null,
        JsonValue::Bool(b) => Literal::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Literal::I64(i)
            } else {
                Literal::F64(n.as_f64().expect("numeric json value"))
            }
        }
        JsonValue::String(s) => Literal::String(s.clone()),
        _ => {
            return Err(Error::invalid_input(vec![
                "arrays and objects cannot be used as scalar filter values".to_owned(),
            ]))
        }
    })
}

fn selection_of_payload(payload: &JsonValue) -> Result<Selection> {
    match payload {
        JsonValue::Bool(true) => Ok(Selection::default()),
        JsonValue::Object(obj) => Ok(Selection {
            select: obj.get("select").and_then(|v| v.as_object()).cloned(),
            include: obj.get("include").and_then(|v| v.as_object()).cloned(),
            omit: obj.get("omit").and_then(|v| v.as_object()).cloned(),
        }),
        _ => Err(Error::invalid_input(vec![
            "relation selection must be `true` or an object".to_owned(),
        ])),
    }
}

// ---------------------------------------------------------------------------
// Expression rendering
// ---------------------------------------------------------------------------

/// Renders an expression at a wrap level, where entity fields are visible as
/// aliased columns (`"users_name"`).
fn render_wrapped(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    entity: &QueriedEntity,
    expr: &Expr,
) -> Result<()> {
    render_expr(ctx, w, &Scope::Wrapped(entity), expr)
}

/// Renders an expression directly against an entity's tables
/// (`"alias"."col"`), as used inside correlated subqueries and ON clauses.
fn render_direct(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    entity: &QueriedEntity,
    expr: &Expr,
) -> Result<()> {
    render_expr(ctx, w, &Scope::Direct(entity), expr)
}

enum Scope<'a> {
    /// Entity fields are aliased output columns of an inner select.
    Wrapped(&'a QueriedEntity),
    /// Entity fields are real table columns.
    Direct(&'a QueriedEntity),
}

impl<'a> Scope<'a> {
    fn entity(&self) -> &QueriedEntity {
        match self {
            Scope::Wrapped(e) | Scope::Direct(e) => e,
        }
    }

    fn write_field(&self, w: &mut SqlWriter, field_name: &str) -> Result<()> {
        match self {
            Scope::Wrapped(entity) => {
                let alias = ColumnAlias {
                    field_name: field_name.to_owned(),
                    table_alias: entity.table_alias.clone(),
                };
                w.write_ident(&alias.to_string());
                Ok(())
            }
            Scope::Direct(entity) => {
                let (table, table_alias) = entity
                    .locate_field_table(field_name)
                    .ok_or_else(|| field_error(&entity.model, field_name))?;
                let col = table.column(field_name).unwrap();
                w.write_ident(table_alias);
                w.write_str(".");
                w.write_name(&col.col_name);
                Ok(())
            }
        }
    }
}

fn render_expr(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    scope: &Scope,
    expr: &Expr,
) -> Result<()> {
    match expr {
        Expr::Value { value } => render_literal(w, value)?,
        Expr::Property(prop) => {
            let chain = property_chain(prop)?;
            render_property(ctx, w, scope, &chain)?;
        }
        Expr::Parameter { .. } => {
            return Err(Error::internal(anyhow::anyhow!(
                "unexpected standalone parameter usage"
            )))
        }
        Expr::Binary(binary) => {
            w.write_str("(");
            if binary.op.is_case_insensitive() {
                w.write_str("LOWER(");
                render_expr(ctx, w, scope, &binary.left)?;
                w.write_str(") ");
                w.write_str(binary.op.to_sql_string());
                w.write_str(" LOWER(");
                render_expr(ctx, w, scope, &binary.right)?;
                w.write_str(")");
            } else {
                render_expr(ctx, w, scope, &binary.left)?;
                w.write_str(" ");
                w.write_str(binary.op.to_sql_string());
                w.write_str(" ");
                render_expr(ctx, w, scope, &binary.right)?;
            }
            if matches!(
                binary.op,
                BinaryOp::Like | BinaryOp::NotLike | BinaryOp::ILike | BinaryOp::NotILike
            ) {
                w.write_str(" ESCAPE '!'");
            }
            w.write_str(")");
        }
        Expr::Not(inner) => {
            w.write_str("NOT (");
            render_expr(ctx, w, scope, inner)?;
            w.write_str(")");
        }
        Expr::IsNull { expr, negated } => {
            w.write_str("(");
            render_expr(ctx, w, scope, expr)?;
            w.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            w.write_str(")");
        }
        Expr::In { expr, list, negated } => {
            if list.is_empty() {
                w.write_str(if *negated { "1 = 1" } else { "1 = 0" });
                return Ok(());
            }
            w.write_str("(");
            render_expr(ctx, w, scope, expr)?;
            w.write_str(if *negated { " NOT IN (" } else { " IN (" });
            for (i, lit) in list.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                render_literal(w, lit)?;
            }
            w.write_str("))");
        }
        Expr::Exists(test) => render_exists(ctx, w, scope, test)?,
        Expr::ListTest(test) => render_list_test(ctx, w, scope, test)?,
        Expr::JsonTest(test) => render_json_test(ctx, w, scope, test)?,
        Expr::Sql(sql) => {
            w.write_str("(");
            w.write_str(sql);
            w.write_str(")");
        }
    }
    Ok(())
}

/// Restricted renderer for field-policy guards: no relation tests.
fn render_simple(w: &mut SqlWriter, scope: &Scope, expr: &Expr) -> Result<()> {
    match expr {
        Expr::Value { value } => render_literal(w, value),
        Expr::Property(prop) => {
            let chain = property_chain(prop)?;
            if chain.len() != 1 {
                return Err(Error::internal(anyhow::anyhow!(
                    "field guards cannot traverse relations"
                )));
            }
            scope.write_field(w, &chain[0])
        }
        Expr::Binary(binary) => {
            w.write_str("(");
            render_simple(w, scope, &binary.left)?;
            w.write_str(" ");
            w.write_str(binary.op.to_sql_string());
            w.write_str(" ");
            render_simple(w, scope, &binary.right)?;
            w.write_str(")");
            Ok(())
        }
        Expr::Not(inner) => {
            w.write_str("NOT (");
            render_simple(w, scope, inner)?;
            w.write_str(")");
            Ok(())
        }
        Expr::IsNull { expr, negated } => {
            w.write_str("(");
            render_simple(w, scope, expr)?;
            w.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            w.write_str(")");
            Ok(())
        }
        Expr::In { expr, list, negated } => {
            if list.is_empty() {
                w.write_str(if *negated { "1 = 1" } else { "1 = 0" });
                return Ok(());
            }
            w.write_str("(");
            render_simple(w, scope, expr)?;
            w.write_str(if *negated { " NOT IN (" } else { " IN (" });
            for (i, lit) in list.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                render_literal(w, lit)?;
            }
            w.write_str("))");
            Ok(())
        }
        _ => Err(Error::internal(anyhow::anyhow!(
            "unsupported expression in a field guard"
        ))),
    }
}

fn render_literal(w: &mut SqlWriter, value: &Literal) -> Result<()> {
    match value {
        Literal::Bool(v) => w.write_literal_bool(*v),
        Literal::U64(v) => w.write_literal_i64(*v as i64),
        Literal::I64(v) => w.write_literal_i64(*v),
        Literal::F64(v) => w.write_literal_f64(*v).err_invalid_input()?,
        Literal::String(v) => w.write_literal_str(v).err_invalid_input()?,
        Literal::Null => w.write_str("NULL"),
    }
    Ok(())
}

fn property_chain(prop: &PropertyAccess) -> Result<Vec<String>> {
    fn walk(prop: &PropertyAccess, out: &mut Vec<String>) -> Result<()> {
        match &*prop.object {
            Expr::Property(parent) => {
                walk(parent, out)?;
                out.push(prop.property.clone());
                Ok(())
            }
            Expr::Parameter { .. } => {
                out.push(prop.property.clone());
                Ok(())
            }
            _ => Err(Error::internal(anyhow::anyhow!(
                "unexpected expression in property chain"
            ))),
        }
    }
    let mut out = vec![];
    walk(prop, &mut out)?;
    Ok(out)
}

/// Renders a property chain. Chains longer than one segment walk to-one
/// joins loaded on the entity.
fn render_property(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    scope: &Scope,
    chain: &[String],
) -> Result<()> {
    let _ = ctx;
    match chain {
        [] => Err(Error::internal(anyhow::anyhow!("empty property chain"))),
        [single] => scope.write_field(w, single),
        [first, rest @ ..] => {
            let entity = scope.entity();
            let child = entity.get_child_entity(first).ok_or_else(|| {
                Error::invalid_input(vec![format!(
                    "filtering on `{}.{}` requires the relation to be loaded",
                    entity.model.name, first
                )])
            })?;
            match scope {
                Scope::Wrapped(_) => {
                    render_property(ctx, w, &Scope::Wrapped(child), rest)
                }
                Scope::Direct(_) => render_property(ctx, w, &Scope::Direct(child), rest),
            }
        }
    }
}

fn render_exists(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    scope: &Scope,
    test: &RelationTest,
) -> Result<()> {
    let entity = scope.entity();
    let model = &entity.model;
    let (owner, field) = ctx
        .lookup_field(model, &test.relation)?
        .ok_or_else(|| relation_error(model, &test.relation))?;
    let target_name = field
        .relation_target()
        .ok_or_else(|| relation_error(&owner, &test.relation))?;
    let target = ctx.model(target_name)?;

    let sub_alias = format!("rel_{}", test.relation);
    let sub_entity = load_sub_entity(ctx, &target, &sub_alias)?;

    let link = relation_link(ctx, &owner, &field, &target)?;
    let mut conds: Vec<String> = vec![];
    for (parent_field, child_field) in &link {
        let mut cw = SqlWriter::new(ctx.provider);
        let (c_table, c_alias) = sub_entity
            .locate_field_table(child_field)
            .ok_or_else(|| field_error(&target, child_field))?;
        let c_col = c_table.column(child_field).unwrap();
        cw.write_ident(c_alias);
        cw.write_str(".");
        cw.write_name(&c_col.col_name);
        cw.write_str(" = ");
        scope.write_field(&mut cw, parent_field)?;
        conds.push(cw.build());
    }

    let mut filter_sql = None;
    if let Some(filter) = &test.filter {
        let mut fw = SqlWriter::new(ctx.provider);
        let effective = if test.all {
            Expr::not(filter.clone())
        } else {
            filter.clone()
        };
        render_direct(ctx, &mut fw, &sub_entity, &effective)?;
        filter_sql = Some(fw.build());
    }
    if let Some(f) = filter_sql {
        conds.push(f);
    }

    let from_clause = sub_from_clause(ctx, &sub_entity)?;
    let negate = test.negated || test.all;
    if negate {
        w.write_str("NOT ");
    }
    w.write_str("EXISTS (SELECT 1 FROM ");
    w.write_str(&from_clause);
    w.write_str(" WHERE ");
    w.write_str(&conds.join(" AND "));
    w.write_str(")");
    Ok(())
}

fn render_list_test(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    scope: &Scope,
    test: &ListTest,
) -> Result<()> {
    let mut col = SqlWriter::new(ctx.provider);
    scope.write_field(&mut col, &test.property)?;
    let col = col.build();

    let element_test = |value: &Literal| -> Result<String> {
        let mut lw = SqlWriter::new(ctx.provider);
        render_literal(&mut lw, value)?;
        let lit = lw.build();
        Ok(match ctx.provider {
            Provider::Sqlite => format!(
                "EXISTS (SELECT 1 FROM json_each({col}) WHERE json_each.value = {lit})"
            ),
            Provider::Postgres => format!(
                "EXISTS (SELECT 1 FROM json_array_elements_text(({col})::json) AS elem WHERE elem.value = CAST({lit} AS text))"
            ),
            Provider::MySql => format!("JSON_CONTAINS({col}, JSON_QUOTE({lit}))"),
        })
    };

    match test.kind {
        ListTestKind::IsEmpty => {
            let check = match ctx.provider {
                Provider::Sqlite => format!("json_array_length({col}) = 0"),
                Provider::Postgres => format!("json_array_length(({col})::json) = 0"),
                Provider::MySql => format!("JSON_LENGTH({col}) = 0"),
            };
            w.write_str(&format!("({col} IS NOT NULL AND {check})"));
        }
        ListTestKind::Has => {
            let value = test.values.first().ok_or_else(|| {
                Error::invalid_input(vec!["`has` requires a value".to_owned()])
            })?;
            let sql = element_test(value)?;
            w.write_str(&sql);
        }
        ListTestKind::HasSome | ListTestKind::HasEvery => {
            let joiner = if test.kind == ListTestKind::HasSome { " OR " } else { " AND " };
            if test.values.is_empty() {
                w.write_str(if test.kind == ListTestKind::HasSome { "1 = 0" } else { "1 = 1" });
                return Ok(());
            }
            let parts = test
                .values
                .iter()
                .map(element_test)
                .collect::<Result<Vec<_>>>()?;
            w.write_str("(");
            w.write_str(&parts.join(joiner));
            w.write_str(")");
        }
    }
    Ok(())
}

fn render_json_test(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    scope: &Scope,
    test: &JsonTest,
) -> Result<()> {
    let mut col = SqlWriter::new(ctx.provider);
    scope.write_field(&mut col, &test.property)?;
    let col = col.build();

    let extracted = if test.path.is_empty() {
        col.clone()
    } else {
        let json_path = format!(
            "$.{}",
            test.path
                .iter()
                .map(|p| p.replace('\'', ""))
                .collect::<Vec<_>>()
                .join(".")
        );
        match ctx.provider {
            Provider::Sqlite | Provider::MySql => {
                format!("json_extract({col}, '{json_path}')")
            }
            Provider::Postgres => {
                let parts = test
                    .path
                    .iter()
                    .map(|p| format!("'{}'", p.replace('\'', "")))
                    .collect::<Vec<_>>()
                    .join(",");
                // `#>` keeps the jsonb type so comparisons stay structural
                format!("(({col})::jsonb #> ARRAY[{parts}])")
            }
        }
    };

    match &test.op {
        JsonTestOp::IsDbNull => {
            w.write_str(&format!("({col} IS NULL)"));
        }
        JsonTestOp::IsJsonNull => {
            w.write_str(&format!("({col} IS NOT NULL AND {} = 'null')", json_text(ctx.provider, &col)));
        }
        JsonTestOp::IsAnyNull => {
            w.write_str(&format!(
                "({col} IS NULL OR {} = 'null')",
                json_text(ctx.provider, &col)
            ));
        }
        JsonTestOp::Equals(value) => {
            let cmp = json_compare(ctx.provider, &extracted, !test.path.is_empty(), value, "=")?;
            w.write_str(&cmp);
        }
        JsonTestOp::NotEquals(value) => {
            let cmp = json_compare(ctx.provider, &extracted, !test.path.is_empty(), value, "!=")?;
            w.write_str(&cmp);
        }
        JsonTestOp::ArrayContains(value) => {
            let element = serde_json::to_string(value).err_internal()?;
            let mut lw = SqlWriter::new(ctx.provider);
            lw.write_literal_str(&element).err_invalid_input()?;
            let lit = lw.build();
            let jsonb = if test.path.is_empty() {
                format!("({extracted})::jsonb")
            } else {
                extracted.clone()
            };
            let sql = match ctx.provider {
                Provider::Sqlite => format!(
                    "EXISTS (SELECT 1 FROM json_each({extracted}) WHERE json_quote(json_each.value) = {lit})"
                ),
                Provider::Postgres => format!("({jsonb} @> ({lit})::jsonb)"),
                Provider::MySql => format!("JSON_CONTAINS({extracted}, {lit})"),
            };
            w.write_str(&sql);
        }
    }
    Ok(())
}

/// Normalized JSON text of a column for comparisons: the stored value is
/// already canonical JSON text, so the raw text suffices on every provider.
fn json_text(provider: Provider, col: &str) -> String {
    match provider {
        Provider::Sqlite | Provider::MySql => col.to_owned(),
        Provider::Postgres => format!("({col})::text"),
    }
}

/// Equality between a JSON expression and a JSON literal. Whole-column
/// comparisons run on the canonical stored text; path extractions need the
/// provider's JSON equality, since extraction yields an SQL value rather
/// than JSON text.
fn json_compare(
    provider: Provider,
    extracted: &str,
    through_path: bool,
    value: &serde_json::Value,
    op: &str,
) -> Result<String> {
    let text = serde_json::to_string(value).err_internal()?;
    let mut lw = SqlWriter::new(provider);
    lw.write_literal_str(&text).err_invalid_input()?;
    let lit = lw.build();

    let sql = if !through_path {
        format!(
            "({extracted} IS NOT NULL AND {} {op} {lit})",
            json_text(provider, extracted)
        )
    } else {
        match provider {
            Provider::Sqlite => format!(
                "({extracted} IS NOT NULL AND json_quote({extracted}) {op} {lit})"
            ),
            Provider::Postgres => format!(
                "({extracted} IS NOT NULL AND {extracted} {op} ({lit})::jsonb)"
            ),
            Provider::MySql => format!(
                "({extracted} IS NOT NULL AND {extracted} {op} CAST({lit} AS JSON))"
            ),
        }
    };
    Ok(sql)
}

fn query_field_name(f: &QueryField) -> &str {
    match f {
        QueryField::Scalar { name, .. } => name,
        QueryField::Entity { name, .. } => name,
        QueryField::ToMany { name, .. } => name,
        QueryField::RelCount { relation, .. } => relation,
    }
}

/// The column representation of one scalar type.
pub(crate) fn scalar_repr(scalar: PrimitiveType) -> ColumnRepr {
    match scalar {
        PrimitiveType::String => ColumnRepr::StringAsText,
        PrimitiveType::Boolean => ColumnRepr::BooleanAsInt,
        PrimitiveType::Int | PrimitiveType::BigInt => ColumnRepr::IntAsBigint,
        PrimitiveType::Float => ColumnRepr::FloatAsDouble,
        PrimitiveType::Decimal => ColumnRepr::DecimalAsText,
        PrimitiveType::DateTime => ColumnRepr::DateTimeAsText,
        PrimitiveType::Json => ColumnRepr::JsonAsText,
        PrimitiveType::Bytes => ColumnRepr::BytesAsBase64,
    }
}
