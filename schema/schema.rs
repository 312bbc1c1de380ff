use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Database schema as produced by the schema compiler.
///
/// This describes the declarative model graph (entities, relations, enums,
/// policies, procedures), not how the engine stores it in the database.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub provider: Provider,
    /// All models, keyed by model name.
    #[serde(with = "schema_models")]
    pub models: HashMap<ModelName, Arc<Model>>,
    /// Enums, keyed by enum name; values keep declaration order.
    #[serde(with = "schema_enums")]
    #[serde(default)]
    pub enums: HashMap<String, Arc<EnumDef>>,
    /// Named structural types (see [`Type::Typedef`]). Used for typed JSON
    /// columns and as field mixins.
    #[serde(with = "schema_typedefs")]
    #[serde(default)]
    pub typedefs: HashMap<String, Arc<TypeDef>>,
    /// Named server-side procedures, keyed by name.
    #[serde(with = "schema_procedures")]
    #[serde(default)]
    pub procedures: HashMap<String, Arc<Procedure>>,
    /// Model whose rows back the `auth()` projection, if any.
    #[serde(default)]
    pub auth_model: Option<ModelName>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Sqlite,
    #[serde(rename = "postgresql")]
    Postgres,
    MySql,
}

impl Provider {
    /// Whether `INSERT ... RETURNING` is available.
    pub fn supports_returning(self) -> bool {
        !matches!(self, Provider::MySql)
    }

    /// Whether `DISTINCT ON (...)` is available.
    pub fn supports_distinct_on(self) -> bool {
        matches!(self, Provider::Postgres)
    }

    /// Whether models may live in a named database schema.
    pub fn supports_multi_schema(self) -> bool {
        matches!(self, Provider::Postgres)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelName(pub String);

impl ModelName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub name: ModelName,
    /// Physical table name (after `@map`).
    pub table_name: String,
    /// Database schema holding the table (`@@schema`, Postgres only).
    #[serde(default)]
    pub schema_name: Option<String>,
    /// All fields in declaration order, including relation fields.
    #[serde(with = "model_fields")]
    pub fields: IndexMap<String, Arc<Field>>,
    /// Names of the fields forming the primary key. Supports compound keys.
    pub id_fields: Vec<String>,
    /// Named `@@unique` tuples.
    #[serde(with = "model_unique_keys")]
    #[serde(default)]
    pub unique_keys: IndexMap<String, Vec<String>>,
    /// Model-level access policies in declaration order.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// Whole-row `@@validate` predicates.
    #[serde(default)]
    pub row_checks: Vec<RowCheck>,
    /// Parent model for `extends`.
    #[serde(default)]
    pub base_model: Option<ModelName>,
    /// Set when the model is an abstract `@@delegate` base.
    #[serde(default)]
    pub delegate: Option<Delegate>,
    /// Type-def mixins contributing fields to this model. The authoring
    /// toolchain merges mixin fields into `fields`; the names are kept for
    /// introspection.
    #[serde(default)]
    pub mixins: Vec<String>,
}

impl Model {
    pub fn field(&self, name: &str) -> Option<&Arc<Field>> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn is_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    /// Fields stored as columns of this model's table.
    pub fn scalar_fields(&self) -> impl Iterator<Item = &Arc<Field>> {
        self.fields.values().filter(|f| f.relation.is_none() && !f.computed)
    }

    /// Relation fields of this model.
    pub fn relation_fields(&self) -> impl Iterator<Item = &Arc<Field>> {
        self.fields.values().filter(|f| f.relation.is_some())
    }

    /// Whether `fields` names exactly one unique selector: the primary key or
    /// a single `@unique` field or a named `@@unique` tuple.
    pub fn is_unique_selector(&self, field_names: &[&str]) -> bool {
        let mut sorted: Vec<&str> = field_names.to_vec();
        sorted.sort_unstable();
        let matches = |key: &[String]| {
            let mut key: Vec<&str> = key.iter().map(|s| s.as_str()).collect();
            key.sort_unstable();
            key == sorted
        };
        if matches(&self.id_fields) {
            return true;
        }
        if let [single] = field_names {
            if self.field(single).map_or(false, |f| f.unique) {
                return true;
            }
        }
        self.unique_keys.values().any(|key| matches(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegate {
    /// Scalar field that stores the concrete model's tag. Never writable by
    /// clients.
    pub discriminator: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: Arc<Type>,
    /// True for nullable fields.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub unique: bool,
    /// Stamped with the current time on every update.
    #[serde(default)]
    pub updated_at: bool,
    /// `@omit`: excluded from default projections.
    #[serde(default)]
    pub omitted: bool,
    /// Computed fields have no column; the SQL expression is registered at
    /// client construction time.
    #[serde(default)]
    pub computed: bool,
    /// Column name when it differs from the field name (`@map`).
    #[serde(default)]
    pub column_name: Option<String>,
    #[serde(default)]
    pub default: Option<DefaultValue>,
    /// Present on relation fields.
    #[serde(default)]
    pub relation: Option<Relation>,
    /// Relation fields this scalar column backs as a foreign key.
    #[serde(default)]
    pub foreign_key_for: Vec<String>,
    /// Field-level validation attributes (`@length`, `@email`, ...).
    #[serde(default)]
    pub validators: Vec<Validator>,
    /// Value transforms applied before persistence (`@trim`, ...).
    #[serde(default)]
    pub transforms: Vec<Transform>,
    /// Field-level access policies (`@allow`/`@deny`).
    #[serde(default)]
    pub policies: Vec<FieldPolicy>,
}

impl Field {
    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    /// True for relation fields declared as lists (to-many side).
    pub fn is_list(&self) -> bool {
        matches!(&*self.type_, Type::Array(_))
    }

    /// The relation target model, if this is a relation field.
    pub fn relation_target(&self) -> Option<&ModelName> {
        fn target(ty: &Type) -> Option<&ModelName> {
            match ty {
                Type::Model(name) => Some(name),
                Type::Array(inner) => target(inner),
                _ => None,
            }
        }
        target(&self.type_)
    }

    /// The column name this field maps to.
    pub fn column(&self) -> &str {
        self.column_name.as_deref().unwrap_or(&self.name)
    }

    /// The scalar type after unwrapping arrays, if the field is scalar.
    pub fn scalar_type(&self) -> Option<PrimitiveType> {
        fn scalar(ty: &Type) -> Option<PrimitiveType> {
            match ty {
                Type::Primitive(p) => Some(*p),
                Type::Array(inner) => scalar(inner),
                _ => None,
            }
        }
        scalar(&self.type_)
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Type {
    /// A builtin scalar.
    Primitive(PrimitiveType),
    /// A reference to an enum defined in [`Schema::enums`].
    Enum(String),
    /// A reference to another model: a relation field.
    Model(ModelName),
    /// A reference to a named type in [`Schema::typedefs`]: a typed JSON
    /// column. Note that typedefs may be recursive.
    Typedef(String),
    /// A list. Scalar lists are stored as JSON; a list of models is the
    /// to-many side of a relation.
    Array(Arc<Type>),
}

impl Type {
    pub fn name(&self) -> String {
        match self {
            Type::Primitive(p) => p.name().to_owned(),
            Type::Enum(name) | Type::Typedef(name) => name.clone(),
            Type::Model(name) => name.0.clone(),
            Type::Array(inner) => format!("{}[]", inner.name()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrimitiveType {
    String,
    Boolean,
    Int,
    BigInt,
    Float,
    Decimal,
    DateTime,
    Json,
    Bytes,
}

impl PrimitiveType {
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Boolean => "Boolean",
            Self::Int => "Int",
            Self::BigInt => "BigInt",
            Self::Float => "Float",
            Self::Decimal => "Decimal",
            Self::DateTime => "DateTime",
            Self::Json => "Json",
            Self::Bytes => "Bytes",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Int | Self::BigInt | Self::Float | Self::Decimal
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum DefaultValue {
    /// A literal default.
    Literal { value: serde_json::Value },
    /// A client-side generated value. `format` is a template where each `%s`
    /// is replaced by a generated id; `\%s` is a literal `%s`.
    Generated {
        generator: Generator,
        #[serde(default)]
        format: Option<String>,
        /// Generator version argument (e.g. uuid version).
        #[serde(default)]
        version: Option<u32>,
    },
    /// A projection of the current auth context, e.g. `auth().id`. When the
    /// projection is absent the default is not applied.
    Auth {
        #[serde(default)]
        names: Vec<String>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Generator {
    Cuid,
    Uuid,
    Ulid,
    Nanoid,
    Now,
    Autoincrement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Name of the opposite relation field on the target model.
    #[serde(default)]
    pub opposite: Option<String>,
    /// Scalar fields on this model backing the relation. Only the owning
    /// side carries `fields`/`references`.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Referenced fields on the target model, column-by-column.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub on_delete: Option<ReferentialAction>,
    #[serde(default)]
    pub on_update: Option<ReferentialAction>,
}

impl Relation {
    /// The owning side declares the foreign key columns.
    pub fn is_owning(&self) -> bool {
        !self.fields.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    NoAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Validator {
    Length {
        #[serde(default)]
        min: Option<u64>,
        #[serde(default)]
        max: Option<u64>,
    },
    Email,
    Url,
    Datetime,
    Regex { pattern: String },
    Contains { value: String },
    StartsWith { value: String },
    EndsWith { value: String },
    Gt { value: serde_json::Number },
    Gte { value: serde_json::Number },
    Lt { value: serde_json::Number },
    Lte { value: serde_json::Number },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transform {
    Trim,
    Lower,
    Upper,
}

/// A model-level `@@allow` / `@@deny` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub kind: PolicyKind,
    pub operations: Vec<PolicyOp>,
    pub expr: PolicyExpr,
}

impl Policy {
    pub fn applies_to(&self, op: PolicyOp) -> bool {
        self.operations
            .iter()
            .any(|o| *o == PolicyOp::All || *o == op)
    }
}

/// A field-level `@allow` / `@deny` rule. `expr` defaults to `true`, which
/// makes a bare `@deny(op)` unconditional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPolicy {
    pub kind: PolicyKind,
    pub operations: Vec<PolicyOp>,
    #[serde(default)]
    pub expr: Option<PolicyExpr>,
}

impl FieldPolicy {
    pub fn applies_to(&self, op: PolicyOp) -> bool {
        self.operations
            .iter()
            .any(|o| *o == PolicyOp::All || *o == op)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyKind {
    Allow,
    Deny,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyOp {
    Create,
    Read,
    Update,
    PostUpdate,
    Delete,
    All,
}

impl PolicyOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::PostUpdate => "post-update",
            Self::Delete => "delete",
            Self::All => "all",
        }
    }
}

/// A `@@validate(expr, msg, path?)` whole-row predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowCheck {
    pub expr: PolicyExpr,
    #[serde(default)]
    pub message: Option<String>,
    /// Error-path override for reporting.
    #[serde(default)]
    pub path: Option<Vec<String>>,
}

/// Boolean expression attached to policies and row checks.
///
/// The engine compiles these into SQL predicates (for read rewriting) or
/// evaluates them in memory (for row checks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "exprType")]
pub enum PolicyExpr {
    /// A literal.
    Literal { value: serde_json::Value },
    /// A field chain rooted at the current row, e.g. `author.id` as
    /// `["author", "id"]`.
    Field { names: Vec<String> },
    /// The whole current row; only meaningful compared against `auth()`.
    This,
    /// A projection of the auth context: `auth()`, `auth().id`, ...
    Auth {
        #[serde(default)]
        names: Vec<String>,
    },
    /// `before().field` — the pre-image in `post-update` policies.
    Before { name: String },
    /// `check(rel, op?)` — reuse the target relation's policies.
    Check {
        relation: String,
        #[serde(default)]
        operation: Option<PolicyOp>,
    },
    /// `currentModel()`.
    CurrentModel,
    /// `currentOperation()`.
    CurrentOperation,
    Binary {
        op: PolicyBinaryOp,
        left: Box<PolicyExpr>,
        right: Box<PolicyExpr>,
    },
    Not { expr: Box<PolicyExpr> },
    /// `expr in [v1, v2, ...]`.
    In {
        expr: Box<PolicyExpr>,
        list: Vec<serde_json::Value>,
    },
}

impl PolicyExpr {
    pub fn literal_bool(value: bool) -> Self {
        PolicyExpr::Literal { value: serde_json::Value::Bool(value) }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyBinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
}

/// A structural ("mixin") type. Not backed by a table; used for typed JSON
/// columns and for contributing fields to models.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDef {
    pub name: String,
    #[serde(with = "typedef_fields")]
    pub fields: IndexMap<String, Arc<TypeDefField>>,
    /// When true, properties outside `fields` are rejected.
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDefField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: Arc<Type>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ProcParam>,
    #[serde(default)]
    pub returns: Option<Arc<Type>>,
    /// Mutating procedures run inside a transaction and roll back on error.
    #[serde(default)]
    pub mutates: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcParam {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: Arc<Type>,
    #[serde(default)]
    pub optional: bool,
}

lazy_static! {
    pub static ref TYPE_STRING: Arc<Type> = Arc::new(Type::Primitive(PrimitiveType::String));
    pub static ref TYPE_BOOLEAN: Arc<Type> = Arc::new(Type::Primitive(PrimitiveType::Boolean));
    pub static ref TYPE_INT: Arc<Type> = Arc::new(Type::Primitive(PrimitiveType::Int));
    pub static ref TYPE_FLOAT: Arc<Type> = Arc::new(Type::Primitive(PrimitiveType::Float));
    pub static ref TYPE_DATE_TIME: Arc<Type> = Arc::new(Type::Primitive(PrimitiveType::DateTime));
    pub static ref TYPE_JSON: Arc<Type> = Arc::new(Type::Primitive(PrimitiveType::Json));
}

serde_keyed_vec!(mod schema_models, HashMap<ModelName, Arc<Model>>, name);
serde_keyed_vec!(mod schema_enums, HashMap<String, Arc<EnumDef>>, name);
serde_keyed_vec!(mod schema_procedures, HashMap<String, Arc<Procedure>>, name);
serde_keyed_vec!(mod model_fields, IndexMap<String, Arc<Field>>, name);
serde_keyed_vec!(mod typedef_fields, IndexMap<String, Arc<TypeDefField>>, name);
serde_pair_vec!(mod schema_typedefs, HashMap<String, Arc<TypeDef>>);
serde_pair_vec!(mod model_unique_keys, IndexMap<String, Vec<String>>);
