//! The client surface.
//!
//! A [`Client`] binds one schema to one connection pool and carries the
//! plugin chain, the auth projection, the computed-field registry and the
//! procedure registry. Clients are immutable: `use_plugin`, `set_auth`,
//! `unuse_all` and `set_input_validation` derive a new client sharing the
//! pool, never mutating the original.

use crate::conn::DataConn;
use crate::crud::{self, CrudOp};
use crate::engine::{QueryEngine, TransactionStatic};
use crate::error::{Error, Result, ResultExt};
use crate::layout::Layout;
use crate::mutation::{NodeOutput, QueryNode};
use crate::plan::{ComputedRegistry, ComputedSqlFn, RequestContext};
use crate::plugin::{self, NodeHookContext, Plugin};
use crate::policy::enforce::PolicyInterceptor;
use crate::procedures::{ProcHandler, ProcRegistry};
use futures::future::BoxFuture;
use quarry_schema::schema::{Model, Schema};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Construction-time options: computed-field SQL builders, procedure
/// handlers, pool sizing and the per-operation timeout.
#[derive(Default)]
pub struct ClientOptions {
    pub computed: ComputedRegistry,
    pub procedures: ProcRegistry,
    pub max_connections: Option<usize>,
    pub operation_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn computed_field(
        mut self,
        model: &str,
        field: &str,
        builder: ComputedSqlFn,
    ) -> Self {
        self.computed.register(model, field, builder);
        self
    }

    pub fn procedure(mut self, name: &str, handler: ProcHandler) -> Self {
        self.procedures.register(name, handler);
        self
    }
}

pub struct ClientCore {
    pub schema: Arc<Schema>,
    pub layout: Arc<Layout>,
    pub engine: Arc<QueryEngine>,
    /// Plugins in registration order; the chain runs outermost-last-in.
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub auth: Option<JsonValue>,
    pub computed: ComputedRegistry,
    pub procedures: ProcRegistry,
    pub validation_enabled: bool,
    pub operation_timeout: Option<Duration>,
    /// Set on clients derived inside `transaction(fn)`; operations join it.
    pub ambient_tx: Option<TransactionStatic>,
}

impl ClientCore {
    pub fn request_context<'a>(
        &'a self,
        operation: &'a str,
        apply_policies: bool,
    ) -> RequestContext<'a> {
        RequestContext {
            schema: &self.schema,
            layout: &self.layout,
            provider: self.engine.kind(),
            auth: self.auth.as_ref(),
            computed: &self.computed,
            apply_policies,
            operation,
        }
    }

    /// Runs one built node through the node-level plugin chain (user plugins
    /// outermost, policy innermost) and the executor.
    pub async fn run_node(
        &self,
        tr: &TransactionStatic,
        rcx: &RequestContext<'_>,
        model: &str,
        operation: &str,
        node: QueryNode,
    ) -> Result<NodeOutput> {
        // Node-level hooks run in registration order, with policy
        // enforcement innermost so user plugins see nodes before the policy
        // predicates are injected.
        let mut chain: Vec<Arc<dyn Plugin>> = self.plugins.to_vec();
        chain.push(Arc::new(PolicyInterceptor));
        let ctx = NodeHookContext { model, operation, rcx };
        let exec = make_node_exec(&self.engine, tr, rcx);
        plugin::dispatch_node(&chain, &ctx, node, &exec).await
    }

    /// Runs a node directly against the executor, bypassing interception.
    /// Used for internal policy read-back checks.
    pub async fn run_node_internal(
        &self,
        tr: &TransactionStatic,
        rcx: &RequestContext<'_>,
        node: QueryNode,
    ) -> Result<NodeOutput> {
        self.engine.run_node(tr, rcx, node).await
    }

    /// Obtains the transaction for one mutation: joins the ambient
    /// transaction through a savepoint, or begins a fresh one.
    pub async fn begin_scope(&self) -> Result<TxScope> {
        match &self.ambient_tx {
            Some(tr) => {
                let name = format!("qsp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
                self.engine
                    .execute_sql(tr, &format!("SAVEPOINT {name}"), &[])
                    .await?;
                Ok(TxScope { tr: tr.clone(), owned: false, savepoint: Some(name) })
            }
            None => Ok(TxScope {
                tr: self.engine.begin_transaction().await?,
                owned: true,
                savepoint: None,
            }),
        }
    }

    pub async fn commit_scope(&self, scope: TxScope) -> Result<()> {
        if let Some(name) = &scope.savepoint {
            self.engine
                .execute_sql(&scope.tr, &format!("RELEASE SAVEPOINT {name}"), &[])
                .await?;
            return Ok(());
        }
        QueryEngine::commit_transaction(scope.tr).await
    }

    pub async fn rollback_scope(&self, scope: TxScope) -> Result<()> {
        if let Some(name) = &scope.savepoint {
            self.engine
                .execute_sql(&scope.tr, &format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                .await?;
            self.engine
                .execute_sql(&scope.tr, &format!("RELEASE SAVEPOINT {name}"), &[])
                .await?;
            return Ok(());
        }
        QueryEngine::rollback_transaction(scope.tr).await
    }
}

fn make_node_exec<'a>(
    engine: &'a QueryEngine,
    tr: &'a TransactionStatic,
    rcx: &'a RequestContext<'a>,
) -> impl Fn(QueryNode) -> BoxFuture<'a, Result<NodeOutput>> + Sync + 'a {
    move |node| Box::pin(engine.run_node(tr, rcx, node))
}

fn make_core_handler<'a>(
    core: &'a ClientCore,
    model: &'a Arc<quarry_schema::schema::Model>,
    op: CrudOp,
) -> impl Fn(JsonValue) -> BoxFuture<'a, Result<JsonValue>> + Sync + 'a {
    move |args| Box::pin(crud::handle(core, model, op, args))
}

/// One mutation's transactional scope: either an owned transaction or a
/// savepoint inside the ambient one.
pub struct TxScope {
    pub tr: TransactionStatic,
    owned: bool,
    savepoint: Option<String>,
}

impl TxScope {
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Validates the schema, computes the layout and opens the pool.
    pub async fn connect(schema: Schema, url: &str, options: ClientOptions) -> Result<Client> {
        quarry_schema::validate(&schema).err_config()?;
        let schema = Arc::new(schema);
        let layout = Arc::new(Layout::from_schema(schema.clone())?);
        let conn = DataConn::connect(url, options.max_connections.unwrap_or(10))
            .await
            .map_err(Error::config)?;
        if conn.kind() != schema.provider {
            return Err(Error::config(anyhow::anyhow!(
                "the connection URL targets a different provider than the schema"
            )));
        }
        // every computed field must have a registered SQL builder
        for model in schema.models.values() {
            for field in model.fields.values() {
                if field.computed && options.computed.get(model.name.as_str(), &field.name).is_none()
                {
                    return Err(Error::config(anyhow::anyhow!(
                        "computed field `{}.{}` has no registered expression",
                        model.name,
                        field.name
                    )));
                }
            }
        }
        let engine = Arc::new(QueryEngine::new(conn.kind(), conn.pool.clone()));
        Ok(Client {
            core: Arc::new(ClientCore {
                schema,
                layout,
                engine,
                plugins: vec![],
                auth: None,
                computed: options.computed,
                procedures: options.procedures,
                validation_enabled: true,
                operation_timeout: options.operation_timeout,
                ambient_tx: None,
            }),
        })
    }

    pub fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.core.schema
    }

    /// Query-builder passthrough: a fresh SQL writer for the client's
    /// provider, for callers that assemble statements by hand and run them
    /// through the raw query surface.
    pub fn query_builder(&self) -> crate::sql_writer::SqlWriter {
        crate::sql_writer::SqlWriter::new(self.core.engine.kind())
    }

    pub async fn disconnect(self) {
        self.core.engine.pool().close().await;
    }

    fn derive(&self, mutate: impl FnOnce(&mut ClientCore)) -> Client {
        let mut core = ClientCore {
            schema: self.core.schema.clone(),
            layout: self.core.layout.clone(),
            engine: self.core.engine.clone(),
            plugins: self.core.plugins.clone(),
            auth: self.core.auth.clone(),
            computed: self.core.computed.clone(),
            procedures: self.core.procedures.clone(),
            validation_enabled: self.core.validation_enabled,
            operation_timeout: self.core.operation_timeout,
            ambient_tx: self.core.ambient_tx.clone(),
        };
        mutate(&mut core);
        Client { core: Arc::new(core) }
    }

    /// Returns a new client with `plugin` appended to the chain; the
    /// receiver is unaffected.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Client {
        self.derive(|core| core.plugins.push(plugin))
    }

    pub fn unuse_all(&self) -> Client {
        self.derive(|core| core.plugins.clear())
    }

    /// Returns a new client carrying the auth projection.
    pub fn set_auth(&self, auth: Option<JsonValue>) -> Client {
        self.derive(|core| core.auth = auth)
    }

    pub fn set_input_validation(&self, enabled: bool) -> Client {
        self.derive(|core| core.validation_enabled = enabled)
    }

    pub fn model(&self, name: &str) -> Result<ModelHandle> {
        let model = self
            .core
            .schema
            .models
            .get(&quarry_schema::schema::ModelName::from(name))
            .cloned()
            .ok_or_else(|| {
                Error::invalid_input(vec![format!("unknown model `{name}`")])
            })?;
        Ok(ModelHandle { client: self.clone(), model })
    }

    /// Runs `f` with a derived client whose operations join one transaction.
    /// The transaction commits when `f` returns Ok and rolls back on Err.
    /// Nested calls collapse to savepoints.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c Client) -> BoxFuture<'c, Result<T>>,
    {
        if let Some(outer) = &self.core.ambient_tx {
            // nested: run under a savepoint on the same transaction
            let name = format!("qsp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
            self.core
                .engine
                .execute_sql(outer, &format!("SAVEPOINT {name}"), &[])
                .await?;
            match f(self).await {
                Ok(value) => {
                    self.core
                        .engine
                        .execute_sql(outer, &format!("RELEASE SAVEPOINT {name}"), &[])
                        .await?;
                    Ok(value)
                }
                Err(err) => {
                    self.core
                        .engine
                        .execute_sql(outer, &format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                        .await?;
                    self.core
                        .engine
                        .execute_sql(outer, &format!("RELEASE SAVEPOINT {name}"), &[])
                        .await?;
                    Err(err)
                }
            }
        } else {
            let tr = self.core.engine.begin_transaction().await?;
            let tx_client = self.derive(|core| core.ambient_tx = Some(tr.clone()));
            match f(&tx_client).await {
                Ok(value) => {
                    drop(tx_client);
                    QueryEngine::commit_transaction(tr).await?;
                    Ok(value)
                }
                Err(err) => {
                    drop(tx_client);
                    let _ = QueryEngine::rollback_transaction(tr).await;
                    Err(err)
                }
            }
        }
    }

    /// Parameterized raw query. Raw SQL bypasses policies and plugins by
    /// design: the caller sees all rows regardless of the auth projection.
    pub async fn query_raw(&self, sql: &str, params: Vec<JsonValue>) -> Result<JsonValue> {
        let rows = self.core.engine.fetch_raw(sql, &params).await?;
        Ok(JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect()))
    }

    /// Unparameterized variant of [`query_raw`](Self::query_raw); the SQL
    /// string is passed to the driver verbatim.
    pub async fn query_raw_unsafe(&self, sql: &str) -> Result<JsonValue> {
        self.query_raw(sql, vec![]).await
    }

    pub async fn execute_raw(&self, sql: &str, params: Vec<JsonValue>) -> Result<u64> {
        self.core.engine.execute_raw(sql, &params).await
    }

    pub async fn execute_raw_unsafe(&self, sql: &str) -> Result<u64> {
        self.execute_raw(sql, vec![]).await
    }

    /// Calls a named procedure declared in the schema.
    pub async fn call_procedure(&self, name: &str, args: Vec<JsonValue>) -> Result<JsonValue> {
        crate::procedures::call(self, name, args).await
    }

    /// Materializes the tables for every model in the schema. A bootstrap
    /// helper for embedders and tests; real deployments migrate externally.
    pub async fn create_tables(&self) -> Result<()> {
        let tr = self.core.engine.begin_transaction().await?;
        for model in self.core.schema.models.values() {
            let table = self.core.layout.table(&model.name)?;
            self.core.engine.create_table(&tr, table).await?;
        }
        QueryEngine::commit_transaction(tr).await
    }
}

/// Per-model CRUD access: `client.model("User")?.find_many(args)`.
///
/// The handle is generic over the model: it carries the schema model and the
/// client, and every verb funnels through the same pipeline.
#[derive(Clone)]
pub struct ModelHandle {
    client: Client,
    model: Arc<Model>,
}

macro_rules! crud_verb {
    ($name:ident, $op:expr) => {
        pub async fn $name(&self, args: JsonValue) -> Result<JsonValue> {
            self.execute($op, args).await
        }
    };
}

impl ModelHandle {
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    crud_verb!(find_unique, CrudOp::FindUnique);
    crud_verb!(find_unique_or_throw, CrudOp::FindUniqueOrThrow);
    crud_verb!(find_first, CrudOp::FindFirst);
    crud_verb!(find_first_or_throw, CrudOp::FindFirstOrThrow);
    crud_verb!(find_many, CrudOp::FindMany);
    crud_verb!(create, CrudOp::Create);
    crud_verb!(create_many, CrudOp::CreateMany);
    crud_verb!(create_many_and_return, CrudOp::CreateManyAndReturn);
    crud_verb!(update, CrudOp::Update);
    crud_verb!(update_many, CrudOp::UpdateMany);
    crud_verb!(update_many_and_return, CrudOp::UpdateManyAndReturn);
    crud_verb!(upsert, CrudOp::Upsert);
    crud_verb!(delete, CrudOp::Delete);
    crud_verb!(delete_many, CrudOp::DeleteMany);
    crud_verb!(aggregate, CrudOp::Aggregate);
    crud_verb!(group_by, CrudOp::GroupBy);
    crud_verb!(count, CrudOp::Count);

    async fn execute(&self, op: CrudOp, args: JsonValue) -> Result<JsonValue> {
        let fut = self.execute_inner(op, args);
        match self.client.core.operation_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                Error::db_query(
                    anyhow::anyhow!("operation timed out after {timeout:?}"),
                    None,
                )
            })?,
            None => fut.await,
        }
    }

    async fn execute_inner(&self, op: CrudOp, args: JsonValue) -> Result<JsonValue> {
        let core = &self.client.core;
        let chain: Vec<Arc<dyn Plugin>> = core.plugins.iter().rev().cloned().collect();
        let handler = make_core_handler(core, &self.model, op);
        plugin::dispatch_query(
            &chain,
            self.model.name.as_str(),
            op.name(),
            args,
            &handler,
        )
        .await
        .map_err(|e| e.with_model(self.model.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RejectReason};
    use crate::mutation::{NodeOutput, QueryNode};
    use crate::plugin::{NextNode, NodeHookContext};
    use crate::value::SqlValue;
    use quarry_schema::schema::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn field(name: &str, ty: Arc<Type>) -> Field {
        Field {
            name: name.to_owned(),
            type_: ty,
            optional: false,
            unique: false,
            updated_at: false,
            omitted: false,
            computed: false,
            column_name: None,
            default: None,
            relation: None,
            foreign_key_for: vec![],
            validators: vec![],
            transforms: vec![],
            policies: vec![],
        }
    }

    fn string_field(name: &str) -> Field {
        field(name, TYPE_STRING.clone())
    }

    fn int_field(name: &str) -> Field {
        field(name, TYPE_INT.clone())
    }

    fn id_field() -> Field {
        let mut f = string_field("id");
        f.default = Some(DefaultValue::Generated {
            generator: Generator::Cuid,
            format: None,
            version: None,
        });
        f
    }

    fn make_model(name: &str, fields: Vec<Field>, id_fields: &[&str]) -> Model {
        Model {
            name: name.into(),
            table_name: format!("{}s", name.to_lowercase()),
            schema_name: None,
            fields: fields
                .into_iter()
                .map(|f| (f.name.clone(), Arc::new(f)))
                .collect(),
            id_fields: id_fields.iter().map(|s| s.to_string()).collect(),
            unique_keys: Default::default(),
            policies: vec![],
            row_checks: vec![],
            base_model: None,
            delegate: None,
            mixins: vec![],
        }
    }

    fn make_schema(models: Vec<Model>) -> Schema {
        Schema {
            provider: Provider::Sqlite,
            models: models
                .into_iter()
                .map(|m| (m.name.clone(), Arc::new(m)))
                .collect::<HashMap<_, _>>(),
            enums: HashMap::new(),
            typedefs: HashMap::new(),
            procedures: HashMap::new(),
            auth_model: None,
        }
    }

    fn allow(ops: &[PolicyOp], expr: PolicyExpr) -> Policy {
        Policy { kind: PolicyKind::Allow, operations: ops.to_vec(), expr }
    }

    fn eq(left: PolicyExpr, right: PolicyExpr) -> PolicyExpr {
        PolicyExpr::Binary {
            op: PolicyBinaryOp::Eq,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn auth(names: &[&str]) -> PolicyExpr {
        PolicyExpr::Auth { names: names.iter().map(|s| s.to_string()).collect() }
    }

    fn this_field(names: &[&str]) -> PolicyExpr {
        PolicyExpr::Field { names: names.iter().map(|s| s.to_string()).collect() }
    }

    async fn connect(schema: Schema, options: ClientOptions) -> (Client, NamedTempFile) {
        let db_file = NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", db_file.path().to_string_lossy());
        let client = Client::connect(schema, &url, options).await.unwrap();
        client.create_tables().await.unwrap();
        (client, db_file)
    }

    fn user_post_schema() -> Schema {
        let mut user = make_model(
            "User",
            vec![
                id_field(),
                {
                    let mut f = string_field("email");
                    f.unique = true;
                    f.transforms = vec![Transform::Trim, Transform::Lower];
                    f.validators = vec![Validator::Email];
                    f
                },
                string_field("name"),
                {
                    let mut f = int_field("age");
                    f.optional = true;
                    f
                },
            ],
            &["id"],
        );
        user.fields.insert(
            "posts".to_owned(),
            Arc::new({
                let mut f = field(
                    "posts",
                    Arc::new(Type::Array(Arc::new(Type::Model("Post".into())))),
                );
                f.relation = Some(Relation {
                    opposite: Some("author".to_owned()),
                    fields: vec![],
                    references: vec![],
                    on_delete: None,
                    on_update: None,
                });
                f
            }),
        );

        let mut post = make_model(
            "Post",
            vec![
                id_field(),
                string_field("title"),
                {
                    let mut f = field("published", TYPE_BOOLEAN.clone());
                    f.default = Some(DefaultValue::Literal { value: json!(false) });
                    f
                },
                {
                    let mut f = string_field("authorId");
                    f.optional = true;
                    f.foreign_key_for = vec!["author".to_owned()];
                    f
                },
            ],
            &["id"],
        );
        post.fields.insert(
            "author".to_owned(),
            Arc::new({
                let mut f = field("author", Arc::new(Type::Model("User".into())));
                f.optional = true;
                f.relation = Some(Relation {
                    opposite: Some("posts".to_owned()),
                    fields: vec!["authorId".to_owned()],
                    references: vec!["id".to_owned()],
                    on_delete: Some(ReferentialAction::Cascade),
                    on_update: None,
                });
                f
            }),
        );

        make_schema(vec![user, post])
    }

    async fn seed_user(client: &Client, email: &str, name: &str, age: i64) -> String {
        let created = client
            .model("User")
            .unwrap()
            .create(json!({ "data": { "email": email, "name": name, "age": age } }))
            .await
            .unwrap();
        created["id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn test_create_and_find_round_trip() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();

        let created = users
            .create(json!({ "data": { "email": "ada@test.com", "name": "Ada", "age": 36 } }))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_owned();
        assert!(id.starts_with('c'));
        assert_eq!(created["email"], "ada@test.com");

        // create -> findUnique(by id) returns the created row
        let fetched = users
            .find_unique(json!({ "where": { "id": id } }))
            .await
            .unwrap();
        assert_eq!(fetched["name"], "Ada");
        assert_eq!(fetched["age"], json!(36));

        let missing = users
            .find_unique(json!({ "where": { "id": "nope" } }))
            .await
            .unwrap();
        assert!(missing.is_null());

        let err = users
            .find_unique_or_throw(json!({ "where": { "id": "nope" } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotFound));

        // a non-unique criterion is rejected
        let err = users
            .find_unique(json!({ "where": { "name": "Ada" } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_find_many_filters_sort_and_pagination() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        for (email, name, age) in [
            ("a@test.com", "Alan", 30),
            ("b@test.com", "John", 20),
            ("c@test.com", "Steve", 29),
            ("d@test.com", "Alex", 40),
        ] {
            seed_user(&client, email, name, age).await;
        }
        let names = |rows: &serde_json::Value| -> Vec<String> {
            rows.as_array()
                .unwrap()
                .iter()
                .map(|r| r["name"].as_str().unwrap().to_owned())
                .collect()
        };

        let rows = users
            .find_many(json!({ "orderBy": { "age": "asc" } }))
            .await
            .unwrap();
        assert_eq!(names(&rows), vec!["John", "Steve", "Alan", "Alex"]);

        let rows = users
            .find_many(json!({ "orderBy": { "age": "asc" }, "skip": 1, "take": 2 }))
            .await
            .unwrap();
        assert_eq!(names(&rows), vec!["Steve", "Alan"]);

        // negative take reverses result order
        let rows = users
            .find_many(json!({ "orderBy": { "age": "asc" }, "take": -2 }))
            .await
            .unwrap();
        assert_eq!(names(&rows), vec!["Alex", "Alan"]);

        let rows = users
            .find_many(json!({ "where": { "age": { "gte": 29, "lt": 40 } } }))
            .await
            .unwrap();
        let mut got = names(&rows);
        got.sort();
        assert_eq!(got, vec!["Alan", "Steve"]);

        let rows = users
            .find_many(json!({ "where": { "name": { "contains": "al", "mode": "insensitive" } } }))
            .await
            .unwrap();
        let mut got = names(&rows);
        got.sort();
        assert_eq!(got, vec!["Alan", "Alex"]);

        let rows = users
            .find_many(json!({ "where": { "name": { "in": ["John", "Alex"] } } }))
            .await
            .unwrap();
        let mut got = names(&rows);
        got.sort();
        assert_eq!(got, vec!["Alex", "John"]);

        // findFirst is findMany take=1
        let first = users
            .find_first(json!({ "orderBy": { "age": "desc" } }))
            .await
            .unwrap();
        assert_eq!(first["name"], "Alex");

        // cursor pagination: rows at or after the cursor in the sort
        let rows = users
            .find_many(json!({
                "orderBy": { "name": "asc" },
                "cursor": { "name": "Alex" },
                "skip": 1,
            }))
            .await
            .unwrap();
        assert_eq!(names(&rows), vec!["John", "Steve"]);
    }

    #[tokio::test]
    async fn test_normalize_strips_nulls_at_option_positions() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        seed_user(&client, "a@test.com", "Alan", 30).await;

        let plain = users.find_many(json!({})).await.unwrap();
        let normalized = users
            .find_many(json!({ "orderBy": null, "take": null, "skip": null, "cursor": null }))
            .await
            .unwrap();
        assert_eq!(plain, normalized);
    }

    #[tokio::test]
    async fn test_validation_and_transforms() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();

        // @trim + @lower run before persistence
        let created = users
            .create(json!({ "data": { "email": "  ADA@Test.Com ", "name": "Ada" } }))
            .await
            .unwrap();
        assert_eq!(created["email"], "ada@test.com");

        // @email violation carries a constraint message
        let err = users
            .create(json!({ "data": { "email": "not-an-email", "name": "X" } }))
            .await
            .unwrap_err();
        match &err.kind {
            ErrorKind::InvalidInput { messages } => {
                assert!(messages.iter().any(|m| m.contains("email")), "{messages:?}");
            }
            other => panic!("unexpected error kind {other:?}"),
        }

        // required field missing
        let err = users
            .create(json!({ "data": { "email": "x@test.com" } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));

        // validation can be disabled per derived client
        let unchecked = client.set_input_validation(false);
        let created = unchecked
            .model("User")
            .unwrap()
            .create(json!({ "data": { "email": "not-an-email", "name": "X" } }))
            .await
            .unwrap();
        assert_eq!(created["email"], "not-an-email");
    }

    #[tokio::test]
    async fn test_unique_violation_surfaces_provider_code() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        seed_user(&client, "dup@test.com", "One", 1).await;

        let err = users
            .create(json!({ "data": { "email": "dup@test.com", "name": "Two" } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DbQuery { .. }));
        assert_eq!(err.db_error_code(), Some("SQLITE_CONSTRAINT_UNIQUE"));
        assert!(err.sql.is_some());
    }

    #[tokio::test]
    async fn test_create_many_and_skip_duplicates() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();

        let out = users
            .create_many(json!({ "data": [
                { "id": "u1", "email": "a@test.com", "name": "A" },
                { "id": "u2", "email": "b@test.com", "name": "B" },
            ]}))
            .await
            .unwrap();
        assert_eq!(out["count"], json!(2));

        // duplicates are skipped and excluded from the count
        let out = users
            .create_many(json!({
                "data": [
                    { "id": "u2", "email": "b@test.com", "name": "B" },
                    { "id": "u3", "email": "c@test.com", "name": "C" },
                ],
                "skipDuplicates": true,
            }))
            .await
            .unwrap();
        assert_eq!(out["count"], json!(1));

        let rows = users
            .create_many_and_return(json!({ "data": [
                { "id": "u4", "email": "d@test.com", "name": "D" },
            ]}))
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["email"], "d@test.com");
    }

    #[tokio::test]
    async fn test_update_upsert_delete() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        let id = seed_user(&client, "a@test.com", "Alan", 30).await;

        let updated = users
            .update(json!({ "where": { "id": id }, "data": { "name": "Alan II" } }))
            .await
            .unwrap();
        assert_eq!(updated["name"], "Alan II");

        // update is idempotent for constant data
        let again = users
            .update(json!({ "where": { "id": id }, "data": { "name": "Alan II" } }))
            .await
            .unwrap();
        assert_eq!(updated, again);

        // atomic numeric ops
        let bumped = users
            .update(json!({ "where": { "id": id }, "data": { "age": { "increment": 5 } } }))
            .await
            .unwrap();
        assert_eq!(bumped["age"], json!(35));

        // updating id fields is rejected
        let err = users
            .update(json!({ "where": { "id": id }, "data": { "id": "other" } }))
            .await
            .unwrap_err();
        match &err.kind {
            ErrorKind::InvalidInput { messages } => {
                assert!(messages[0].contains("updating id fields is not supported"));
            }
            other => panic!("unexpected error kind {other:?}"),
        }

        // upsert with no match behaves as create
        let row = users
            .upsert(json!({
                "where": { "email": "b@test.com" },
                "create": { "email": "b@test.com", "name": "Bea" },
                "update": { "name": "Bea II" },
            }))
            .await
            .unwrap();
        assert_eq!(row["name"], "Bea");

        // upsert with a match behaves as update
        let row = users
            .upsert(json!({
                "where": { "email": "b@test.com" },
                "create": { "email": "b@test.com", "name": "Bea" },
                "update": { "name": "Bea II" },
            }))
            .await
            .unwrap();
        assert_eq!(row["name"], "Bea II");

        let count = users.count(json!({})).await.unwrap();
        assert_eq!(count, json!(2));

        let deleted = users
            .delete(json!({ "where": { "id": id } }))
            .await
            .unwrap();
        assert_eq!(deleted["name"], "Alan II");
        let count = users.count(json!({})).await.unwrap();
        assert_eq!(count, json!(1));

        let out = users.delete_many(json!({})).await.unwrap();
        assert_eq!(out["count"], json!(1));
    }

    #[tokio::test]
    async fn test_nested_writes_and_relation_selection() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        let posts = client.model("Post").unwrap();

        let created = users
            .create(json!({
                "data": {
                    "email": "ada@test.com",
                    "name": "Ada",
                    "posts": { "create": [
                        { "title": "First", "published": true },
                        { "title": "Second" },
                    ]},
                },
            }))
            .await
            .unwrap();
        let user_id = created["id"].as_str().unwrap().to_owned();

        // to-many include rides a JSON-aggregated subquery
        let fetched = users
            .find_unique(json!({
                "where": { "id": user_id },
                "include": { "posts": { "where": { "published": true } } },
            }))
            .await
            .unwrap();
        let published = fetched["posts"].as_array().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["title"], "First");
        assert_eq!(published[0]["published"], json!(true));

        // to-one include is a join
        let post = posts
            .find_first(json!({
                "where": { "title": "Second" },
                "include": { "author": true },
            }))
            .await
            .unwrap();
        assert_eq!(post["author"]["name"], "Ada");

        // relation filters compile to correlated EXISTS
        let rows = users
            .find_many(json!({ "where": { "posts": { "some": { "title": { "contains": "Fir" } } } } }))
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        let rows = users
            .find_many(json!({ "where": { "posts": { "none": {} } } }))
            .await
            .unwrap();
        assert!(rows.as_array().unwrap().is_empty());

        // _count selections count related rows
        let fetched = users
            .find_unique(json!({
                "where": { "id": user_id },
                "include": { "_count": { "select": { "posts": true } } },
            }))
            .await
            .unwrap();
        assert_eq!(fetched["_count"]["posts"], json!(2));

        // nested connect on create
        let second_author = users
            .create(json!({ "data": { "email": "b@test.com", "name": "Bea" } }))
            .await
            .unwrap();
        let post = posts
            .create(json!({
                "data": {
                    "title": "Third",
                    "author": { "connect": { "id": second_author["id"] } },
                },
            }))
            .await
            .unwrap();
        assert_eq!(post["authorId"], second_author["id"]);

        // disconnect requires a unique selector; `title` is not unique
        let err = users
            .update(json!({
                "where": { "id": user_id },
                "data": { "posts": { "disconnect": { "title": "Second" } } },
            }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));

        // deleting the author cascades to the posts
        users
            .delete(json!({ "where": { "id": user_id } }))
            .await
            .unwrap();
        let remaining = posts.find_many(json!({})).await.unwrap();
        assert_eq!(remaining.as_array().unwrap().len(), 1);
        assert_eq!(remaining[0]["title"], "Third");
    }

    #[tokio::test]
    async fn test_select_projection_and_omit() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        seed_user(&client, "a@test.com", "Alan", 30).await;

        let row = users
            .find_first(json!({ "select": { "name": true } }))
            .await
            .unwrap();
        let obj = row.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["name"], "Alan");

        let row = users
            .find_first(json!({ "omit": { "email": true } }))
            .await
            .unwrap();
        assert!(row.get("email").is_none());
        assert_eq!(row["name"], "Alan");
    }

    #[tokio::test]
    async fn test_aggregate_and_group_by() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        for (email, name, age) in [
            ("a@test.com", "Alan", 30),
            ("b@test.com", "John", 20),
            ("c@test.com", "John", 40),
        ] {
            seed_user(&client, email, name, age).await;
        }

        let out = users
            .aggregate(json!({
                "_count": true,
                "_sum": { "age": true },
                "_avg": { "age": true },
                "_min": { "age": true },
                "_max": { "age": true },
            }))
            .await
            .unwrap();
        assert_eq!(out["_count"], json!(3));
        assert_eq!(out["_sum"]["age"], json!(90));
        assert_eq!(out["_avg"]["age"], json!(30.0));
        assert_eq!(out["_min"]["age"], json!(20));
        assert_eq!(out["_max"]["age"], json!(40));

        // _sum over a non-numeric field is rejected
        let err = users
            .aggregate(json!({ "_sum": { "name": true } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));

        let groups = users
            .group_by(json!({
                "by": ["name"],
                "_count": true,
                "_sum": { "age": true },
                "orderBy": { "name": "asc" },
            }))
            .await
            .unwrap();
        let groups = groups.as_array().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["name"], "Alan");
        assert_eq!(groups[0]["_count"], json!(1));
        assert_eq!(groups[1]["name"], "John");
        assert_eq!(groups[1]["_sum"]["age"], json!(60));

        // having over an aggregate
        let groups = users
            .group_by(json!({
                "by": ["name"],
                "_count": true,
                "having": { "_count": { "name": { "gt": 1 } } },
            }))
            .await
            .unwrap();
        let groups = groups.as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["name"], "John");

        // every having/orderBy field must be grouped or aggregated
        let err = users
            .group_by(json!({
                "by": ["name"],
                "_count": true,
                "having": { "age": { "gt": 10 } },
            }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));
    }

    fn profile_policy_schema() -> Schema {
        let mut profile = make_model(
            "Profile",
            vec![string_field("id"), int_field("age")],
            &["id"],
        );
        profile.policies = vec![
            allow(&[PolicyOp::Create], PolicyExpr::literal_bool(true)),
            allow(&[PolicyOp::Read], eq(auth(&["age"]), this_field(&["age"]))),
        ];
        make_schema(vec![profile])
    }

    #[tokio::test]
    async fn test_policy_filter_on_read() {
        let (client, _db) = connect(profile_policy_schema(), ClientOptions::default()).await;

        let with_age = |age: i64| client.set_auth(Some(json!({ "id": 1, "age": age })));
        with_age(18)
            .model("Profile")
            .unwrap()
            .create(json!({ "data": { "id": "1", "age": 18 } }))
            .await
            .unwrap();
        with_age(20)
            .model("Profile")
            .unwrap()
            .create(json!({ "data": { "id": "2", "age": 20 } }))
            .await
            .unwrap();

        let me = with_age(18);
        let rows = me.model("Profile").unwrap().find_many(json!({})).await.unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "1");
        assert_eq!(rows[0]["age"], json!(18));

        let count = me.model("Profile").unwrap().count(json!({})).await.unwrap();
        assert_eq!(count, json!(1));

        // raw queries bypass policy: all rows are visible regardless of auth
        let raw = me
            .query_raw("SELECT COUNT(*) AS n FROM profiles", vec![])
            .await
            .unwrap();
        assert_eq!(raw[0]["n"], json!(2));

        // absent auth reads nothing
        let anonymous = client.set_auth(None);
        let rows = anonymous
            .model("Profile")
            .unwrap()
            .find_many(json!({}))
            .await
            .unwrap();
        assert!(rows.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_readback_rejection_rolls_back() {
        let mut m = make_model(
            "M",
            vec![string_field("id"), int_field("value")],
            &["id"],
        );
        m.policies = vec![
            allow(&[PolicyOp::Create, PolicyOp::Update], PolicyExpr::literal_bool(true)),
            allow(
                &[PolicyOp::Read],
                PolicyExpr::Binary {
                    op: PolicyBinaryOp::Gt,
                    left: Box::new(this_field(&["value"])),
                    right: Box::new(PolicyExpr::Literal { value: json!(0) }),
                },
            ),
        ];
        let (client, _db) = connect(make_schema(vec![m]), ClientOptions::default()).await;

        let err = client
            .model("M")
            .unwrap()
            .create(json!({ "data": { "id": "1", "value": 0 } }))
            .await
            .unwrap_err();
        assert_eq!(err.rejection_reason(), Some(RejectReason::CannotReadBack));

        // the transaction rolled back: the database holds no row
        let raw = client
            .query_raw("SELECT COUNT(*) AS n FROM ms", vec![])
            .await
            .unwrap();
        assert_eq!(raw[0]["n"], json!(0));

        // a readable row goes through
        let row = client
            .model("M")
            .unwrap()
            .create(json!({ "data": { "id": "2", "value": 5 } }))
            .await
            .unwrap();
        assert_eq!(row["value"], json!(5));
    }

    /// Appends a tag to the `name` column of every intercepted insert.
    struct InsertRewrite {
        tag: &'static str,
        replace_email: Option<(&'static str, &'static str)>,
    }

    impl Plugin for InsertRewrite {
        fn id(&self) -> &str {
            self.tag
        }

        fn on_query_node<'a>(
            &'a self,
            _ctx: &NodeHookContext<'a>,
            mut node: QueryNode,
            next: NextNode<'a, '_>,
        ) -> futures::future::BoxFuture<'a, Result<NodeOutput>> {
            if let QueryNode::Insert(plan) = &mut node {
                if let Some(idx) = plan.fields.iter().position(|f| f == "name") {
                    for row in &mut plan.rows {
                        if let SqlValue::String(s) = &mut row[idx] {
                            s.push_str(self.tag);
                        }
                    }
                }
                if let Some((from, to)) = self.replace_email {
                    if let Some(idx) = plan.fields.iter().position(|f| f == "email") {
                        for row in &mut plan.rows {
                            if let SqlValue::String(s) = &mut row[idx] {
                                if s == from {
                                    *s = to.to_owned();
                                }
                            }
                        }
                    }
                }
            }
            next.proceed(node)
        }
    }

    #[tokio::test]
    async fn test_node_plugins_rewrite_inserts_in_registration_order() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let client = client
            .use_plugin(Arc::new(InsertRewrite {
                tag: "1",
                replace_email: Some(("u1@test.com", "u2@test.com")),
            }))
            .use_plugin(Arc::new(InsertRewrite { tag: "2", replace_email: None }));

        client
            .model("User")
            .unwrap()
            .create(json!({ "data": { "email": "u1@test.com", "name": "Marvin" } }))
            .await
            .unwrap();

        let row = client
            .model("User")
            .unwrap()
            .find_first(json!({}))
            .await
            .unwrap();
        assert_eq!(row["email"], "u2@test.com");
        assert_eq!(row["name"], "Marvin12");
    }

    /// Rewrites the high-level args of every create.
    struct ArgsRewrite;

    impl Plugin for ArgsRewrite {
        fn id(&self) -> &str {
            "args-rewrite"
        }

        fn on_query<'a>(
            &'a self,
            ctx: crate::plugin::QueryHookContext<'a>,
            next: crate::plugin::NextQuery<'a, '_>,
        ) -> futures::future::BoxFuture<'a, Result<serde_json::Value>> {
            let mut args = ctx.args;
            if ctx.operation == "create" {
                if let Some(data) = args.get_mut("data").and_then(|d| d.as_object_mut()) {
                    data.insert("name".to_owned(), json!("Rewritten"));
                }
            }
            next.proceed(args)
        }
    }

    #[tokio::test]
    async fn test_query_plugins_transform_args_and_use_derives() {
        let (base_client, _db) = connect(user_post_schema(), ClientOptions::default()).await;
        let wrapped = base_client.use_plugin(Arc::new(ArgsRewrite));

        // $use does not mutate the parent client's chain
        base_client
            .model("User")
            .unwrap()
            .create(json!({ "data": { "email": "a@test.com", "name": "Plain" } }))
            .await
            .unwrap();
        let row = base_client
            .model("User")
            .unwrap()
            .find_first(json!({ "where": { "email": "a@test.com" } }))
            .await
            .unwrap();
        assert_eq!(row["name"], "Plain");

        let row = wrapped
            .model("User")
            .unwrap()
            .create(json!({ "data": { "email": "b@test.com", "name": "Original" } }))
            .await
            .unwrap();
        assert_eq!(row["name"], "Rewritten");

        // unuse_all strips the chain on the derived client only
        let bare = wrapped.unuse_all();
        let row = bare
            .model("User")
            .unwrap()
            .create(json!({ "data": { "email": "c@test.com", "name": "C" } }))
            .await
            .unwrap();
        assert_eq!(row["name"], "C");
    }

    #[tokio::test]
    async fn test_procedure_rolls_back_on_error() {
        let mut schema = user_post_schema();
        schema.procedures.insert(
            "createTwoAndFail".to_owned(),
            Arc::new(Procedure {
                name: "createTwoAndFail".to_owned(),
                params: vec![],
                returns: None,
                mutates: true,
            }),
        );

        fn create_two_and_fail(
            client: &Client,
            _args: Vec<serde_json::Value>,
        ) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                let users = client.model("User")?;
                users
                    .create(json!({ "data": { "email": "a@test.com", "name": "A" } }))
                    .await?;
                users
                    .create(json!({ "data": { "email": "b@test.com", "name": "B" } }))
                    .await?;
                Err(Error::internal(anyhow::anyhow!("boom")))
            })
        }
        let options =
            ClientOptions::default().procedure("createTwoAndFail", Arc::new(create_two_and_fail));
        let (client, _db) = connect(schema, options).await;

        let err = client.call_procedure("createTwoAndFail", vec![]).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Internal));

        // every side effect rolled back
        let rows = client.model("User").unwrap().find_many(json!({})).await.unwrap();
        assert!(rows.as_array().unwrap().is_empty());

        // arity is checked against the declared signature
        let err = client
            .call_procedure("createTwoAndFail", vec![json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_transaction_commits_and_rolls_back() {
        let (client, _db) = connect(user_post_schema(), ClientOptions::default()).await;

        client
            .transaction(|tx| {
                Box::pin(async move {
                    tx.model("User")?
                        .create(json!({ "data": { "email": "a@test.com", "name": "A" } }))
                        .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let failed: Result<()> = client
            .transaction(|tx| {
                Box::pin(async move {
                    tx.model("User")?
                        .create(json!({ "data": { "email": "b@test.com", "name": "B" } }))
                        .await?;
                    Err(Error::internal(anyhow::anyhow!("abort")))
                })
            })
            .await;
        assert!(failed.is_err());

        let rows = client.model("User").unwrap().find_many(json!({})).await.unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["email"], "a@test.com");
    }

    fn asset_video_schema() -> Schema {
        let mut asset = make_model(
            "Asset",
            vec![id_field(), string_field("type")],
            &["id"],
        );
        asset.delegate = Some(Delegate { discriminator: "type".to_owned() });

        let mut video = make_model(
            "Video",
            vec![id_field(), string_field("url"), int_field("duration")],
            &["id"],
        );
        video.base_model = Some("Asset".into());

        make_schema(vec![asset, video])
    }

    #[tokio::test]
    async fn test_delegate_polymorphism() {
        let (client, _db) = connect(asset_video_schema(), ClientOptions::default()).await;

        // concrete create writes the base row and the concrete row
        let video = client
            .model("Video")
            .unwrap()
            .create(json!({ "data": { "url": "u", "duration": 100 } }))
            .await
            .unwrap();
        assert_eq!(video["duration"], json!(100));
        assert_eq!(video["type"], "Video");

        // reading the base projects base fields plus the discriminator
        let asset = client
            .model("Asset")
            .unwrap()
            .find_first(json!({}))
            .await
            .unwrap();
        assert_eq!(asset["type"], "Video");
        assert_eq!(asset["id"], video["id"]);
        assert!(asset.get("duration").is_none());

        // the delegate base cannot be created directly
        let err = client
            .model("Asset")
            .unwrap()
            .create(json!({ "data": { "id": "x" } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));

        // the discriminator is not client-writable
        let err = client
            .model("Video")
            .unwrap()
            .create(json!({ "data": { "url": "v", "duration": 1, "type": "Hack" } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));

        // deleting the concrete row cascades to the base row
        client
            .model("Video")
            .unwrap()
            .delete(json!({ "where": { "id": video["id"] } }))
            .await
            .unwrap();
        let raw = client
            .query_raw("SELECT COUNT(*) AS n FROM assets", vec![])
            .await
            .unwrap();
        assert_eq!(raw[0]["n"], json!(0));
    }

    fn json_doc_schema() -> Schema {
        let doc = make_model(
            "Doc",
            vec![string_field("id"), {
                let mut f = field("data", TYPE_JSON.clone());
                f.optional = true;
                f
            }],
            &["id"],
        );
        make_schema(vec![doc])
    }

    #[tokio::test]
    async fn test_json_null_sentinels() {
        let (client, _db) = connect(json_doc_schema(), ClientOptions::default()).await;
        let docs = client.model("Doc").unwrap();

        // a literal language-null is an input error for JSON columns
        let err = docs
            .create(json!({ "data": { "id": "a", "data": null } }))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidInput { .. }));

        docs.create(json!({ "data": { "id": "obj", "data": { "x": 1 } } }))
            .await
            .unwrap();
        docs.create(json!({ "data": { "id": "jnull", "data": "JsonNull" } }))
            .await
            .unwrap();
        docs.create(json!({ "data": { "id": "dbnull", "data": "DbNull" } }))
            .await
            .unwrap();

        let ids = |rows: &serde_json::Value| -> Vec<String> {
            let mut ids: Vec<String> = rows
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r["id"].as_str().unwrap().to_owned())
                .collect();
            ids.sort();
            ids
        };

        let rows = docs
            .find_many(json!({ "where": { "data": { "equals": "JsonNull" } } }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["jnull"]);

        let rows = docs
            .find_many(json!({ "where": { "data": { "equals": "DbNull" } } }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["dbnull"]);

        let rows = docs
            .find_many(json!({ "where": { "data": { "equals": "AnyNull" } } }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["dbnull", "jnull"]);

        // structural equality on the stored JSON
        let rows = docs
            .find_many(json!({ "where": { "data": { "equals": { "x": 1 } } } }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["obj"]);

        // path extraction
        let rows = docs
            .find_many(json!({ "where": { "data": { "path": ["x"], "equals": 1 } } }))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["obj"]);
    }

    #[tokio::test]
    async fn test_computed_fields_select_and_filter() {
        let mut schema = user_post_schema();
        {
            let user = Arc::get_mut(schema.models.get_mut(&ModelName::from("User")).unwrap()).unwrap();
            let mut f = int_field("nameLength");
            f.computed = true;
            user.fields.insert("nameLength".to_owned(), Arc::new(f));
        }
        let options = ClientOptions::default().computed_field(
            "User",
            "nameLength",
            Arc::new(|alias: &str| format!("LENGTH(\"{alias}\".\"name\")")),
        );
        let (client, _db) = connect(schema, options).await;
        let users = client.model("User").unwrap();

        seed_user(&client, "a@test.com", "Al", 1).await;
        seed_user(&client, "b@test.com", "Steve", 2).await;

        let row = users
            .find_first(json!({ "where": { "name": "Steve" } }))
            .await
            .unwrap();
        assert_eq!(row["nameLength"], json!(5));

        // filtering on a computed field wraps the query and filters outside
        let rows = users
            .find_many(json!({ "where": { "nameLength": { "gt": 3 } } }))
            .await
            .unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Steve");

        // and ordering by it
        let rows = users
            .find_many(json!({ "orderBy": { "nameLength": "desc" } }))
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], "Steve");
    }

    #[tokio::test]
    async fn test_field_level_read_policy_masks_column() {
        let mut schema = user_post_schema();
        {
            let user = Arc::get_mut(schema.models.get_mut(&ModelName::from("User")).unwrap()).unwrap();
            let email = Arc::get_mut(user.fields.get_mut("email").unwrap()).unwrap();
            email.policies = vec![FieldPolicy {
                kind: PolicyKind::Deny,
                operations: vec![PolicyOp::Read],
                expr: None,
            }];
        }
        let (client, _db) = connect(schema, ClientOptions::default()).await;
        let users = client.model("User").unwrap();
        seed_user(&client, "secret@test.com", "Ada", 1).await;

        // denied fields are omitted from the default projection...
        let row = users.find_first(json!({})).await.unwrap();
        assert!(row.get("email").is_none());

        // ...and projected as null when explicitly selected
        let row = users
            .find_first(json!({ "select": { "name": true, "email": true } }))
            .await
            .unwrap();
        assert_eq!(row["name"], "Ada");
        assert_eq!(row["email"], serde_json::Value::Null);
    }
}
