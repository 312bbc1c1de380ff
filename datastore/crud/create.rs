use super::args::{CreateArgs, CreateManyArgs, NestedWrite};
use super::{
    extract_ids, or_rollback, read_back, row_satisfies, run_after_hooks_outside,
    run_after_hooks_within, run_before_hooks, unique_where_expr,
};
use crate::client::{ClientCore, TxScope};
use crate::error::{Error, RejectReason, Result};
use crate::mutation::{InsertPlan, QueryNode, SetItem, SetOp, UpdatePlan};
use crate::plan::{relation_link, QueryPlan, RequestContext, Selection};
use crate::plugin::MutationAction;
use crate::policy::{self, enforce};
use crate::util;
use crate::validate::{self, WriteKind};
use crate::value::to_sql_value;
use crate::JsonObject;
use futures::future::BoxFuture;
use quarry_schema::schema::{DefaultValue, Field, Generator, Model, PolicyOp};
use serde_json::Value as JsonValue;
use sqlx::Row;
use std::sync::Arc;

pub async fn create(core: &ClientCore, model: &Arc<Model>, args: JsonValue) -> Result<JsonValue> {
    let args = CreateArgs::parse(args)?;
    guard_not_delegate(model)?;

    run_before_hooks(core, model, MutationAction::Create, &[args.data.clone()])
        .await
        .map_err(wrap_hook_error)?;

    let scope = core.begin_scope().await?;
    let result = async {
        let row = insert_graph(core, &scope, model.clone(), args.data.clone()).await?;
        let ids = extract_ids(model, &row)?;
        run_after_hooks_within(core, model, MutationAction::Create, &[row.clone()])
            .await
            .map_err(wrap_hook_error)?;
        read_back(
            core,
            &scope,
            model,
            PolicyOp::Create,
            "create",
            &ids,
            &args.selection(),
            None,
        )
        .await
    }
    .await;
    let (row, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    run_after_hooks_outside(core, model, MutationAction::Create, &[row.clone()])
        .await
        .map_err(wrap_hook_error)?;
    Ok(JsonValue::Object(row))
}

pub async fn create_many(
    core: &ClientCore,
    model: &Arc<Model>,
    args: JsonValue,
    and_return: bool,
) -> Result<JsonValue> {
    let parsed = CreateManyArgs::parse(args)?;
    guard_not_delegate(model)?;
    if and_return && !core.engine.kind().supports_returning() {
        not_supported!("createManyAndReturn requires a provider with RETURNING support");
    }

    let rcx = core.request_context("createMany", false);
    if rcx.ancestry(model)?.len() > 1 && parsed.skip_duplicates {
        not_supported!("skipDuplicates is not supported on models extending a delegate");
    }

    run_before_hooks(core, model, MutationAction::Create, &parsed.data)
        .await
        .map_err(wrap_hook_error)?;

    let under_policies = policy::model_has_policies(&rcx, model)?;

    let scope = core.begin_scope().await?;
    let result = async {
        // Prepare every row up-front: defaults, transforms, validation.
        let mut rows = vec![];
        for data in &parsed.data {
            let mut row = data.clone();
            for key in row.keys() {
                match rcx.lookup_field(model, key)? {
                    None => {
                        return Err(Error::invalid_input(vec![format!(
                            "unknown field `{key}` on model `{}`",
                            model.name
                        )]))
                    }
                    Some((_, f)) if f.is_relation() => {
                        return Err(Error::invalid_input(vec![format!(
                            "createMany accepts scalar fields only; `{key}` is a relation"
                        )]))
                    }
                    Some(_) => {}
                }
            }
            prepare_scalar_row(core, &rcx, model, &mut row)?;
            rows.push(row);
        }

        if under_policies {
            // Row-by-row, so each inserted row can be checked (and
            // returned).
            let mut inserted: Vec<JsonObject> = vec![];
            for row in rows {
                let count =
                    run_insert_tables(core, &scope, &rcx, model, &row, parsed.skip_duplicates)
                        .await?;
                if count == 0 {
                    continue; // duplicate skipped
                }
                let mut row = row;
                fill_generated_ids(core, &scope, &rcx, model, &mut row).await?;
                verify_create_policy(core, &scope, &rcx, model, &row).await?;
                inserted.push(row);
            }
            if and_return {
                let mut out = vec![];
                for row in &inserted {
                    let ids = extract_ids(model, row)?;
                    let shaped = read_back(
                        core,
                        &scope,
                        model,
                        PolicyOp::Create,
                        "createManyAndReturn",
                        &ids,
                        &Selection::default(),
                        None,
                    )
                    .await?;
                    out.push(JsonValue::Object(shaped));
                }
                Ok(JsonValue::Array(out))
            } else {
                Ok(serde_json::json!({ "count": inserted.len() }))
            }
        } else {
            // One multi-row INSERT; `*AndReturn` rides on RETURNING.
            match run_insert_rows(core, &scope, &rcx, model, rows, parsed.skip_duplicates, and_return)
                .await?
            {
                crate::mutation::NodeOutput::Rows(rows) => Ok(JsonValue::Array(
                    rows.into_iter().map(JsonValue::Object).collect(),
                )),
                crate::mutation::NodeOutput::Count(count) => {
                    Ok(serde_json::json!({ "count": count }))
                }
            }
        }
    }
    .await;
    let (out, scope) = or_rollback(core, scope, result).await?;
    core.commit_scope(scope).await?;
    run_after_hooks_outside(core, model, MutationAction::Create, &[])
        .await
        .map_err(wrap_hook_error)?;
    Ok(out)
}

fn guard_not_delegate(model: &Model) -> Result<()> {
    if model.is_delegate() {
        invalid_input!(
            "`{}` is a delegate base and cannot be created directly",
            model.name
        );
    }
    Ok(())
}

pub(crate) fn wrap_hook_error(err: Error) -> Error {
    Error::db_query(anyhow::anyhow!(err).context("entity mutation hook failed"), None)
}

async fn verify_create_policy(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    row: &JsonObject,
) -> Result<()> {
    let ids = extract_ids(model, row)?;
    let preds = enforce::readback_predicates(rcx, model, PolicyOp::Create, None)?;
    if let Some(pred) = preds.op_predicate {
        if !row_satisfies(core, scope, rcx, model, &ids, pred).await? {
            return Err(Error::rejected_by_policy(
                RejectReason::NoAccess,
                model.name.as_str(),
            ));
        }
    }
    if let Some(pred) = preds.read_predicate {
        if !row_satisfies(core, scope, rcx, model, &ids, pred).await? {
            return Err(Error::rejected_by_policy(
                RejectReason::CannotReadBack,
                model.name.as_str(),
            ));
        }
    }
    Ok(())
}

/// Recursively inserts one entity graph: resolves the relations this model
/// owns the keys for, writes the row (splitting across delegate ancestor
/// tables), then applies the child-side writes. Returns the full scalar row
/// as written, including generated values.
pub(crate) fn insert_graph<'a>(
    core: &'a ClientCore,
    scope: &'a TxScope,
    model: Arc<Model>,
    data: JsonObject,
) -> BoxFuture<'a, Result<JsonObject>> {
    Box::pin(async move {
        guard_not_delegate(&model)?;
        let rcx = core.request_context("create", false);

        let (mut scalars, relations) = partition_data(&rcx, &model, data)?;

        // Parent side first: relations whose foreign key lives on this row.
        let mut child_writes = vec![];
        for (owner, field, writes) in relations {
            let relation = field.relation.as_ref().unwrap();
            if relation.is_owning() {
                resolve_owning_relation(core, scope, &rcx, &owner, &field, &writes, &mut scalars)
                    .await?;
            } else {
                child_writes.push((owner, field, writes));
            }
        }

        prepare_scalar_row(core, &rcx, &model, &mut scalars)?;
        run_insert_tables(core, scope, &rcx, &model, &scalars, false).await?;
        fill_generated_ids(core, scope, &rcx, &model, &mut scalars).await?;

        // Child side: rows referencing this one.
        for (owner, field, writes) in child_writes {
            apply_child_creates(core, scope, &rcx, &owner, &field, writes, &scalars).await?;
        }

        Ok(scalars)
    })
}

/// Splits a `data` payload into scalar values and relation writes, rejecting
/// writes to computed fields and delegate discriminators.
pub(crate) fn partition_data(
    rcx: &RequestContext,
    model: &Arc<Model>,
    data: JsonObject,
) -> Result<(JsonObject, Vec<(Arc<Model>, Arc<Field>, Vec<NestedWrite>)>)> {
    let discriminators: Vec<String> = rcx
        .ancestry(model)?
        .iter()
        .filter_map(|m| m.delegate.as_ref().map(|d| d.discriminator.clone()))
        .collect();

    let mut scalars = JsonObject::new();
    let mut relations = vec![];
    for (key, value) in data {
        if discriminators.contains(&key) {
            return Err(Error::invalid_input(vec![format!(
                "discriminator field `{key}` is not writable"
            )]));
        }
        let (owner, field) = rcx.lookup_field(model, &key)?.ok_or_else(|| {
            Error::invalid_input(vec![format!(
                "unknown field `{key}` on model `{}`",
                model.name
            )])
        })?;
        if field.computed {
            return Err(Error::invalid_input(vec![format!(
                "computed field `{key}` is not writable"
            )]));
        }
        if field.is_relation() {
            let writes = super::args::parse_nested_writes(&key, &value)?;
            relations.push((owner, field, writes));
        } else {
            // `{ set: value }` shorthand unwraps to the value itself.
            let is_set_wrapper = matches!(
                &value,
                JsonValue::Object(obj) if obj.len() == 1 && obj.contains_key("set")
            );
            let value = if is_set_wrapper {
                value.get("set").unwrap().clone()
            } else {
                value
            };
            scalars.insert(key, value);
        }
    }
    Ok((scalars, relations))
}

/// Fills defaults and the delegate discriminator, applies transforms, and
/// validates the completed row.
pub(crate) fn prepare_scalar_row(
    core: &ClientCore,
    rcx: &RequestContext,
    model: &Arc<Model>,
    row: &mut JsonObject,
) -> Result<()> {
    let ancestry = rcx.ancestry(model)?;
    for owner in &ancestry {
        if let Some(delegate) = &owner.delegate {
            row.insert(
                delegate.discriminator.clone(),
                JsonValue::String(model.name.0.clone()),
            );
        }
        for field in owner.scalar_fields() {
            if row.contains_key(&field.name) {
                continue;
            }
            if field.updated_at {
                row.insert(field.name.clone(), JsonValue::String(util::now_iso()));
                continue;
            }
            if let Some(generated) = generate_default(rcx, field)? {
                row.insert(field.name.clone(), generated);
            }
        }
    }

    for owner in &ancestry {
        validate::apply_transforms(owner, row);
    }

    if core.validation_enabled {
        for owner in &ancestry {
            let slice = slice_for_model(owner, row);
            validate::validate_row(&core.schema, owner, &slice, WriteKind::Create)?;
        }
        enforce::check_row_validations(rcx, model, row)?;
    }
    for owner in &ancestry {
        let slice = slice_for_model(owner, row);
        enforce::check_field_writes(rcx, owner, &slice, PolicyOp::Create)?;
    }
    Ok(())
}

/// Client-side default generation. `auth()` defaults apply only when the
/// projection is present; `autoincrement` is left to the database.
fn generate_default(rcx: &RequestContext, field: &Arc<Field>) -> Result<Option<JsonValue>> {
    let default = match &field.default {
        Some(default) => default,
        None => return Ok(None),
    };
    let value = match default {
        DefaultValue::Literal { value } => Some(value.clone()),
        DefaultValue::Auth { names } => enforce::auth_projection(rcx, names),
        DefaultValue::Generated { generator, format, version: _ } => match generator {
            Generator::Now => Some(JsonValue::String(util::now_iso())),
            Generator::Autoincrement => None,
            gen => {
                let id = match format {
                    Some(format) => util::expand_format(format, || util::generate_id(*gen)),
                    None => util::generate_id(*gen),
                };
                Some(JsonValue::String(id))
            }
        },
    };
    Ok(value)
}

/// The subset of `row` stored on `owner`'s own table.
pub(crate) fn slice_for_model(owner: &Model, row: &JsonObject) -> JsonObject {
    let mut slice = JsonObject::new();
    for field in owner.scalar_fields() {
        if let Some(value) = row.get(&field.name) {
            slice.insert(field.name.clone(), value.clone());
        }
    }
    slice
}

/// Inserts the row into its table and every delegate ancestor table, root
/// first so the base row exists before the concrete one. Returns the number
/// of rows written into the model's own table (0 when a duplicate was
/// skipped).
pub(crate) async fn run_insert_tables(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    row: &JsonObject,
    skip_duplicates: bool,
) -> Result<u64> {
    let ancestry = rcx.ancestry(model)?;
    let mut own_count = 0;
    for owner in ancestry.iter().rev() {
        let table = rcx.layout.table(&owner.name)?.clone();
        let slice = slice_for_model(owner, row);
        let mut fields = vec![];
        let mut values = vec![];
        for col in table.field_cols.values() {
            if let Some(value) = slice.get(&col.field_name) {
                fields.push(col.field_name.clone());
                values.push(to_sql_value(col.repr, value).map_err(|e| {
                    Error::invalid_input(vec![format!(
                        "field `{}`: {e:#}",
                        col.field_name
                    )])
                })?);
            }
        }
        let plan = InsertPlan {
            table,
            fields,
            rows: vec![values],
            skip_duplicates,
            returning: false,
        };
        let count = core
            .run_node(
                &scope.tr,
                rcx,
                owner.name.as_str(),
                "create",
                QueryNode::Insert(plan),
            )
            .await?
            .into_count()?;
        if owner.name == model.name {
            own_count = count;
        }
    }
    Ok(own_count)
}

/// Multi-row scalar insert for `createMany` on single-table models.
async fn run_insert_rows(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    rows: Vec<JsonObject>,
    skip_duplicates: bool,
    returning: bool,
) -> Result<crate::mutation::NodeOutput> {
    if rows.is_empty() {
        return Ok(if returning {
            crate::mutation::NodeOutput::Rows(vec![])
        } else {
            crate::mutation::NodeOutput::Count(0)
        });
    }
    let table = rcx.layout.table(&model.name)?.clone();
    // rows may differ in present columns; the union drives the column list,
    // missing optional values become NULL
    let mut fields: Vec<String> = vec![];
    for col in table.field_cols.values() {
        if rows.iter().any(|r| r.contains_key(&col.field_name)) {
            fields.push(col.field_name.clone());
        }
    }
    let mut sql_rows = vec![];
    for row in &rows {
        let mut values = vec![];
        for field in &fields {
            let col = table.column(field).unwrap();
            let value = row.get(field).cloned().unwrap_or(JsonValue::Null);
            values.push(to_sql_value(col.repr, &value).map_err(|e| {
                Error::invalid_input(vec![format!("field `{field}`: {e:#}")])
            })?);
        }
        sql_rows.push(values);
    }
    let plan = InsertPlan {
        table,
        fields,
        rows: sql_rows,
        skip_duplicates,
        returning,
    };
    core.run_node(
        &scope.tr,
        rcx,
        model.name.as_str(),
        "createMany",
        QueryNode::Insert(plan),
    )
    .await
}

/// Recovers database-generated (autoincrement) id values after an insert.
pub(crate) async fn fill_generated_ids(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    model: &Arc<Model>,
    row: &mut JsonObject,
) -> Result<()> {
    let missing: Vec<String> = model
        .id_fields
        .iter()
        .filter(|f| !row.contains_key(f.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    if missing.len() > 1 {
        return Err(Error::invalid_input(vec![format!(
            "compound id of `{}` must be provided explicitly",
            model.name
        )]));
    }
    let sql = match rcx.provider {
        quarry_schema::schema::Provider::Sqlite => "SELECT last_insert_rowid()",
        quarry_schema::schema::Provider::Postgres => "SELECT lastval()",
        quarry_schema::schema::Provider::MySql => "SELECT LAST_INSERT_ID()",
    };
    let rows = core.engine.fetch_sql(&scope.tr, sql, &[]).await?;
    let value: i64 = rows
        .first()
        .ok_or_else(|| Error::internal(anyhow::anyhow!("no generated id returned")))?
        .try_get(0)
        .map_err(|e| Error::internal(anyhow::anyhow!(e)))?;
    row.insert(missing[0].clone(), serde_json::json!(value));
    Ok(())
}

/// Resolves a to-one relation whose foreign key lives on the row being
/// created: connect/create/connectOrCreate produce the key values.
async fn resolve_owning_relation(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    owner: &Arc<Model>,
    field: &Arc<Field>,
    writes: &[NestedWrite],
    scalars: &mut JsonObject,
) -> Result<()> {
    let relation = field.relation.as_ref().unwrap();
    let target = rcx.model(field.relation_target().unwrap())?;

    let mut resolved: Option<JsonObject> = None;
    for write in writes {
        let target_row = match write {
            NestedWrite::Connect(selectors) => {
                let selector = single_entry(field, selectors)?;
                find_required(core, scope, &target, selector).await?
            }
            NestedWrite::Create(entries) => {
                let data = single_entry(field, entries)?;
                insert_graph(core, scope, target.clone(), data.clone()).await?
            }
            NestedWrite::ConnectOrCreate(entries) => {
                let entry = entries.first().ok_or_else(|| {
                    Error::invalid_input(vec![format!(
                        "`connectOrCreate` on `{}` needs an entry",
                        field.name
                    )])
                })?;
                match find_optional(core, scope, &target, &entry.where_).await? {
                    Some(row) => row,
                    None => insert_graph(core, scope, target.clone(), entry.create.clone()).await?,
                }
            }
            _ => {
                return Err(Error::invalid_input(vec![format!(
                    "unsupported nested operation on `{}.{}` inside create",
                    owner.name, field.name
                )]))
            }
        };
        if resolved.replace(target_row).is_some() {
            return Err(Error::invalid_input(vec![format!(
                "relation `{}` can only be linked once per create",
                field.name
            )]));
        }
    }

    if let Some(target_row) = resolved {
        for (fk_field, referenced) in
            relation.fields.iter().zip(relation.references.iter())
        {
            let value = target_row.get(referenced).cloned().ok_or_else(|| {
                Error::internal(anyhow::anyhow!(
                    "connected `{}` row is missing `{referenced}`",
                    target.name
                ))
            })?;
            scalars.insert(fk_field.clone(), value);
        }
    }
    Ok(())
}

/// Applies nested writes on relations whose foreign key lives on the child.
async fn apply_child_creates(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    owner: &Arc<Model>,
    field: &Arc<Field>,
    writes: Vec<NestedWrite>,
    parent_row: &JsonObject,
) -> Result<()> {
    let target = rcx.model(field.relation_target().unwrap())?;
    let link = relation_link(rcx, owner, field, &target)?;
    let fk_values = |data: &mut JsonObject| -> Result<()> {
        for (parent_field, child_field) in &link {
            let value = parent_row.get(parent_field).cloned().ok_or_else(|| {
                Error::internal(anyhow::anyhow!(
                    "parent row is missing `{parent_field}` for relation `{}`",
                    field.name
                ))
            })?;
            data.insert(child_field.clone(), value);
        }
        Ok(())
    };

    for write in writes {
        match write {
            NestedWrite::Create(entries) => {
                for mut data in entries {
                    fk_values(&mut data)?;
                    insert_graph(core, scope, target.clone(), data).await?;
                }
            }
            NestedWrite::CreateMany { data, skip_duplicates } => {
                let mut rows = vec![];
                for mut row in data {
                    fk_values(&mut row)?;
                    prepare_scalar_row(core, rcx, &target, &mut row)?;
                    rows.push(row);
                }
                run_insert_rows(core, scope, rcx, &target, rows, skip_duplicates, false)
                    .await?;
            }
            NestedWrite::Connect(selectors) => {
                for selector in selectors {
                    connect_child(core, scope, rcx, &target, &link, parent_row, &selector)
                        .await?;
                }
            }
            NestedWrite::ConnectOrCreate(entries) => {
                for entry in entries {
                    match find_optional(core, scope, &target, &entry.where_).await? {
                        Some(_) => {
                            connect_child(
                                core, scope, rcx, &target, &link, parent_row, &entry.where_,
                            )
                            .await?;
                        }
                        None => {
                            let mut data = entry.create;
                            fk_values(&mut data)?;
                            insert_graph(core, scope, target.clone(), data).await?;
                        }
                    }
                }
            }
            _ => {
                return Err(Error::invalid_input(vec![format!(
                    "unsupported nested operation on `{}.{}` inside create",
                    owner.name, field.name
                )]))
            }
        }
    }
    Ok(())
}

/// Points an existing child row at the parent by updating its foreign key.
pub(crate) async fn connect_child(
    core: &ClientCore,
    scope: &TxScope,
    rcx: &RequestContext<'_>,
    target: &Arc<Model>,
    link: &[(String, String)],
    parent_row: &JsonObject,
    selector: &JsonObject,
) -> Result<()> {
    let mut sets = vec![];
    for (parent_field, child_field) in link {
        let value = parent_row.get(parent_field).cloned().ok_or_else(|| {
            Error::internal(anyhow::anyhow!("parent row is missing `{parent_field}`"))
        })?;
        let col = rcx
            .layout
            .table(&target.name)?
            .column(child_field)
            .ok_or_else(|| {
                Error::internal(anyhow::anyhow!("no column for `{child_field}`"))
            })?
            .clone();
        sets.push(SetItem {
            field: child_field.clone(),
            op: SetOp::Set,
            value: to_sql_value(col.repr, &value)
                .map_err(|e| Error::invalid_input(vec![format!("{e:#}")]))?,
        });
    }
    let mut filter = QueryPlan::from_model(rcx, target)?;
    filter.push_filter(unique_where_expr(rcx, target, selector)?);
    let plan = UpdatePlan {
        table: rcx.layout.table(&target.name)?.clone(),
        sets,
        filter,
        limit: None,
    };
    let count = core
        .run_node(
            &scope.tr,
            rcx,
            target.name.as_str(),
            "update",
            QueryNode::Update(plan),
        )
        .await?
        .into_count()?;
    if count == 0 {
        return Err(Error::not_found(anyhow::anyhow!(
            "`{}` row to connect was not found",
            target.name
        ))
        .with_model(target.name.as_str()));
    }
    Ok(())
}

fn single_entry<'e, T>(field: &Field, entries: &'e [T]) -> Result<&'e T> {
    match entries {
        [single] => Ok(single),
        _ => Err(Error::invalid_input(vec![format!(
            "relation `{}` takes exactly one nested entry",
            field.name
        )])),
    }
}

/// Looks up a row by unique selector inside the transaction, honoring read
/// policies (linking to a row you cannot read is not allowed).
pub(crate) async fn find_optional(
    core: &ClientCore,
    scope: &TxScope,
    model: &Arc<Model>,
    selector: &JsonObject,
) -> Result<Option<JsonObject>> {
    let rcx = core.request_context("findUnique", true);
    let expr = unique_where_expr(&rcx, model, selector)?;
    let mut plan = QueryPlan::from_model(&rcx, model)?;
    plan.push_filter(expr);
    let mut rows = core
        .run_node(
            &scope.tr,
            &rcx,
            model.name.as_str(),
            "findUnique",
            QueryNode::Select(plan),
        )
        .await?
        .into_rows()?;
    Ok(rows.pop())
}

pub(crate) async fn find_required(
    core: &ClientCore,
    scope: &TxScope,
    model: &Arc<Model>,
    selector: &JsonObject,
) -> Result<JsonObject> {
    find_optional(core, scope, model, selector)
        .await?
        .ok_or_else(|| {
            Error::not_found(anyhow::anyhow!(
                "required `{}` row was not found",
                model.name
            ))
            .with_model(model.name.as_str())
        })
}
