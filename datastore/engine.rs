use crate::error::{Error, Result};
use crate::layout::{ColumnRepr, ModelTable};
use crate::mutation::{NodeOutput, QueryNode};
use crate::plan::{QueriedEntity, Query, QueryField, RequestContext};
use crate::value::{self, SqlValue};
use crate::JsonObject;
use anyhow::{anyhow, Context as AnyhowContext};
use async_lock::Mutex;
use quarry_schema::schema::Provider;
use sea_query::{Alias, ColumnDef, Index, MysqlQueryBuilder, PostgresQueryBuilder, SchemaBuilder, SqliteQueryBuilder, Table};
use serde_json::Value as JsonValue;
use sqlx::any::{Any, AnyPool, AnyRow};
use sqlx::{Column, Row, Transaction, ValueRef};
use std::sync::Arc;

/// A shared handle to an open driver transaction. The mutex serializes the
/// statements of concurrent sub-operations; the Arc lets read-back checks and
/// hooks run against the same transaction.
pub type TransactionStatic = Arc<Mutex<Transaction<'static, Any>>>;

/// Query engine.
///
/// Executes built query nodes against the backing store and wraps the
/// transactional machinery. The engine performs as much of the query logic as
/// possible inside the database; the policy predicates have already been
/// folded into the SQL by the time a node reaches this point.
#[derive(Clone)]
pub struct QueryEngine {
    kind: Provider,
    pool: AnyPool,
}

impl QueryEngine {
    pub fn new(kind: Provider, pool: AnyPool) -> Self {
        Self { kind, pool }
    }

    pub fn kind(&self) -> Provider {
        self.kind
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn begin_transaction(&self) -> Result<TransactionStatic> {
        let tr = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::db_query(anyhow!(e), None))?;
        Ok(Arc::new(Mutex::new(tr)))
    }

    pub async fn commit_transaction(transaction: TransactionStatic) -> Result<()> {
        let transaction = Arc::try_unwrap(transaction)
            .map_err(|_| Error::internal(anyhow!("transaction still has references held")))?;
        let transaction = transaction.into_inner();
        transaction
            .commit()
            .await
            .map_err(|e| Error::db_query(anyhow!(e), None))
    }

    pub async fn rollback_transaction(transaction: TransactionStatic) -> Result<()> {
        let transaction = Arc::try_unwrap(transaction)
            .map_err(|_| Error::internal(anyhow!("transaction still has references held")))?;
        let transaction = transaction.into_inner();
        transaction
            .rollback()
            .await
            .map_err(|e| Error::db_query(anyhow!(e), None))
    }

    /// Runs one built query node inside the given transaction.
    pub async fn run_node(
        &self,
        tr: &TransactionStatic,
        ctx: &RequestContext<'_>,
        node: QueryNode,
    ) -> Result<NodeOutput> {
        match node {
            QueryNode::Select(plan) => {
                let query = plan.build_query(ctx)?;
                let rows = self.fetch_query(tr, &query).await?;
                Ok(NodeOutput::Rows(rows))
            }
            QueryNode::Insert(plan) => {
                let (sql, args) = plan.build_sql(self.kind)?;
                if plan.returning {
                    let rows = self.fetch_sql(tr, &sql, &args).await?;
                    let decoded = rows
                        .iter()
                        .map(|row| decode_positional(&plan.table, &plan.fields, row))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(NodeOutput::Rows(decoded))
                } else {
                    let count = self.execute_sql(tr, &sql, &args).await?;
                    Ok(NodeOutput::Count(count))
                }
            }
            QueryNode::Update(plan) => {
                let (sql, args) = plan.build_sql(ctx)?;
                let count = self.execute_sql(tr, &sql, &args).await?;
                Ok(NodeOutput::Count(count))
            }
            QueryNode::Delete(plan) => {
                let (sql, args) = plan.build_sql(ctx)?;
                let count = self.execute_sql(tr, &sql, &args).await?;
                Ok(NodeOutput::Count(count))
            }
        }
    }

    /// Executes the given select and decodes the result rows.
    pub async fn fetch_query(
        &self,
        tr: &TransactionStatic,
        query: &Query,
    ) -> Result<Vec<JsonObject>> {
        log::debug!("executing query: {}", query.raw_sql);
        let mut guard = tr.lock().await;
        let rows = sqlx::query(&query.raw_sql)
            .fetch_all(&mut *guard)
            .await
            .map_err(|e| self.tag_db_error(e, &query.raw_sql, &[]))?;
        drop(guard);
        rows.iter()
            .map(|row| row_to_json(&query.entity, row))
            .collect()
    }

    pub async fn execute_sql(
        &self,
        tr: &TransactionStatic,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<u64> {
        log::debug!("executing statement: {sql}");
        let query = value::bind_all(sqlx::query(sql), args);
        let mut guard = tr.lock().await;
        let result = query
            .execute(&mut *guard)
            .await
            .map_err(|e| self.tag_db_error(e, sql, args))?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_sql(
        &self,
        tr: &TransactionStatic,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<Vec<AnyRow>> {
        log::debug!("executing statement: {sql}");
        let query = value::bind_all(sqlx::query(sql), args);
        let mut guard = tr.lock().await;
        query
            .fetch_all(&mut *guard)
            .await
            .map_err(|e| self.tag_db_error(e, sql, args))
    }

    /// Runs a raw, parameterized SQL query outside of the policy and plugin
    /// machinery, returning generically-decoded rows.
    pub async fn fetch_raw(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<JsonObject>> {
        let args = raw_args(params)?;
        let query = value::bind_all(sqlx::query(sql), &args);
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.tag_db_error(e, sql, &args))?;
        rows.iter().map(decode_any_row).collect()
    }

    pub async fn execute_raw(&self, sql: &str, params: &[JsonValue]) -> Result<u64> {
        let args = raw_args(params)?;
        let query = value::bind_all(sqlx::query(sql), &args);
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| self.tag_db_error(e, sql, &args))?;
        Ok(result.rows_affected())
    }

    fn schema_builder(&self) -> &'static dyn SchemaBuilder {
        match self.kind {
            Provider::Postgres => &PostgresQueryBuilder,
            Provider::Sqlite => &SqliteQueryBuilder,
            Provider::MySql => &MysqlQueryBuilder,
        }
    }

    /// Materializes the table for one model. Used by embedders and tests to
    /// bootstrap a database from the layout.
    pub async fn create_table(
        &self,
        tr: &TransactionStatic,
        table: &ModelTable,
    ) -> Result<()> {
        let mut create_table = Table::create()
            .table(Alias::new(&table.table_name.0))
            .if_not_exists()
            .to_owned();

        let single_id = table.id_fields.len() == 1;
        for col in table.field_cols.values() {
            let mut column_def = ColumnDef::new(Alias::new(&col.col_name.0));
            match col.repr {
                ColumnRepr::IntAsBigint => column_def.big_integer(),
                ColumnRepr::FloatAsDouble => column_def.double(),
                ColumnRepr::BooleanAsInt => column_def.integer(),
                _ => column_def.text(),
            };
            if single_id && table.id_fields[0] == col.field_name {
                column_def.primary_key();
            } else {
                if !col.optional {
                    column_def.not_null();
                }
                if col.unique {
                    column_def.unique_key();
                }
            }
            create_table.col(&mut column_def);
        }
        if !single_id {
            let mut pk = Index::create();
            for id_field in &table.id_fields {
                let col = table.column(id_field).ok_or_else(|| {
                    Error::config(anyhow!("id field `{id_field}` has no column"))
                })?;
                pk.col(Alias::new(&col.col_name.0));
            }
            create_table.primary_key(&mut pk);
        }

        let sql = create_table.build_any(self.schema_builder());
        self.execute_sql(tr, &sql, &[]).await?;
        Ok(())
    }

    pub async fn drop_table(&self, tr: &TransactionStatic, table: &ModelTable) -> Result<()> {
        let drop_table = Table::drop()
            .table(Alias::new(&table.table_name.0))
            .if_exists()
            .to_owned();
        let sql = drop_table.build_any(self.schema_builder());
        self.execute_sql(tr, &sql, &[]).await?;
        Ok(())
    }

    fn tag_db_error(&self, err: sqlx::Error, sql: &str, args: &[SqlValue]) -> Error {
        let code = match &err {
            sqlx::Error::Database(db_err) => {
                normalize_db_code(self.kind, db_err.code().as_deref(), db_err.message())
            }
            _ => None,
        };
        Error::db_query(anyhow!(err).context(format!("query failed: {sql}")), code)
            .with_sql(sql, args.iter().map(|a| a.display()).collect())
    }
}

/// Maps the driver's error code to the provider's canonical code for unique
/// constraint violations, passing other codes through.
fn normalize_db_code(
    provider: Provider,
    code: Option<&str>,
    message: &str,
) -> Option<String> {
    match provider {
        Provider::Sqlite => {
            if code == Some("2067")
                || code == Some("1555")
                || message.contains("UNIQUE constraint failed")
            {
                Some("SQLITE_CONSTRAINT_UNIQUE".to_owned())
            } else {
                code.map(|c| c.to_owned())
            }
        }
        Provider::Postgres => code.map(|c| c.to_owned()),
        Provider::MySql => {
            if message.contains("Duplicate entry") {
                Some("ER_DUP_ENTRY".to_owned())
            } else {
                code.map(|c| c.to_owned())
            }
        }
    }
}

fn raw_args(params: &[JsonValue]) -> Result<Vec<SqlValue>> {
    params
        .iter()
        .map(|p| {
            Ok(match p {
                JsonValue::Null => SqlValue::Null,
                JsonValue::Bool(b) => SqlValue::I64(*b as i64),
                JsonValue::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        SqlValue::I64(i)
                    } else {
                        SqlValue::F64(n.as_f64().expect("numeric parameter"))
                    }
                }
                JsonValue::String(s) => SqlValue::String(s.clone()),
                other => SqlValue::String(
                    serde_json::to_string(other)
                        .context("failed to encode raw query parameter")
                        .map_err(Error::internal)?,
                ),
            })
        })
        .collect()
}

/// Decodes one result row back into the JSON shape described by the queried
/// entity, applying the output projection.
pub fn row_to_json(entity: &QueriedEntity, row: &AnyRow) -> Result<JsonObject> {
    let mut ret = JsonObject::new();
    let mut counts = JsonObject::new();
    let allowed = |name: &str| {
        entity
            .allowed_fields
            .as_ref()
            .map_or(true, |fields| fields.contains(name))
    };

    for field in &entity.fields {
        match field {
            QueryField::Scalar { name, repr, is_optional, column_idx } => {
                if !allowed(name) {
                    continue;
                }
                let val = value::decode_column(row, *column_idx, *repr, *is_optional)
                    .map_err(Error::internal)?;
                ret.insert(name.clone(), val);
            }
            QueryField::Entity { name, is_optional } => {
                if !allowed(name) {
                    continue;
                }
                let child = entity.get_child_entity(name).ok_or_else(|| {
                    Error::internal(anyhow!("missing join for relation `{name}`"))
                })?;
                let id_idx = child.id_column_idx().ok_or_else(|| {
                    Error::internal(anyhow!("joined entity `{name}` has no id column"))
                })?;
                if row
                    .try_get_raw(id_idx)
                    .map(|v| v.is_null())
                    .unwrap_or(true)
                {
                    if *is_optional {
                        ret.insert(name.clone(), JsonValue::Null);
                        continue;
                    }
                    // the child row was masked away by its read policy
                    ret.insert(name.clone(), JsonValue::Null);
                    continue;
                }
                ret.insert(name.clone(), JsonValue::Object(row_to_json(child, row)?));
            }
            QueryField::ToMany { name, column_idx, shape } => {
                if !allowed(name) {
                    continue;
                }
                let raw = value::decode_column(row, *column_idx, ColumnRepr::JsonAsText, true)
                    .map_err(Error::internal)?;
                let items = match raw {
                    JsonValue::Null => vec![],
                    JsonValue::Array(items) => items,
                    other => {
                        return Err(Error::internal(anyhow!(
                            "to-many column decoded to a non-array: {other}"
                        )))
                    }
                };
                let items = items
                    .into_iter()
                    .map(|item| reencode_child(shape, item).map(JsonValue::Object))
                    .collect::<Result<Vec<_>>>()?;
                ret.insert(name.clone(), JsonValue::Array(items));
            }
            QueryField::RelCount { relation, column_idx } => {
                let val: i64 = row.get_unchecked(*column_idx);
                counts.insert(relation.clone(), serde_json::json!(val));
            }
        }
    }
    if !counts.is_empty() && allowed("_count") {
        ret.insert("_count".to_owned(), JsonValue::Object(counts));
    }
    Ok(ret)
}

/// Re-coerces one element of a JSON-aggregated to-many column: the database
/// emits its storage representation (0/1 booleans, JSON-as-text strings), not
/// the client shape.
fn reencode_child(
    shape: &[(String, ColumnRepr, bool)],
    item: JsonValue,
) -> Result<JsonObject> {
    let obj = match item {
        JsonValue::Object(obj) => obj,
        other => {
            return Err(Error::internal(anyhow!(
                "to-many element is not an object: {other}"
            )))
        }
    };
    let mut out = JsonObject::new();
    for (name, repr, _optional) in shape {
        let raw = obj.get(name).cloned().unwrap_or(JsonValue::Null);
        out.insert(name.clone(), value::reencode_from_json(*repr, raw).map_err(Error::internal)?);
    }
    Ok(out)
}

fn decode_positional(
    table: &ModelTable,
    fields: &[String],
    row: &AnyRow,
) -> Result<JsonObject> {
    let mut out = JsonObject::new();
    for (idx, field) in fields.iter().enumerate() {
        let col = table.column(field).ok_or_else(|| {
            Error::internal(anyhow!("no column for returned field `{field}`"))
        })?;
        let val = value::decode_column(row, idx, col.repr, col.optional)
            .map_err(Error::internal)?;
        out.insert(field.clone(), val);
    }
    Ok(out)
}

/// Best-effort decoding of a raw-query row: the column types are whatever the
/// SQL produced, so try the narrow types first and fall back to text.
fn decode_any_row(row: &AnyRow) -> Result<JsonObject> {
    let mut out = JsonObject::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_owned();
        if row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true) {
            out.insert(name, JsonValue::Null);
            continue;
        }
        let val = if let Ok(v) = row.try_get::<i64, _>(idx) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<String, _>(idx) {
            JsonValue::String(v)
        } else {
            JsonValue::Null
        };
        out.insert(name, val);
    }
    Ok(out)
}
