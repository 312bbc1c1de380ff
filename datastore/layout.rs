use crate::error::{Error, Result};
use quarry_schema::schema::{
    self, Field, Model, ModelName, PrimitiveType, Provider, Schema, Type,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Concrete representation of a [`schema::Schema`] in the database.
#[derive(Debug)]
pub struct Layout {
    pub model_tables: HashMap<ModelName, Arc<ModelTable>>,
    pub schema: Arc<Schema>,
}

/// An SQL table that stores rows of a given model.
///
/// For a model extending a delegate base, this table holds only the model's
/// own columns plus the primary key; the inherited columns live in the base
/// model's table and the engine joins on the key.
#[derive(Debug)]
pub struct ModelTable {
    pub model_name: ModelName,
    pub table_name: Name,
    /// Database schema qualification (Postgres `@@schema`).
    pub schema_name: Option<Name>,
    /// Columns for the model's own scalar fields, keyed by field name.
    pub field_cols: IndexMap<String, FieldColumn>,
    /// Field names forming the primary key, in declaration order.
    pub id_fields: Vec<String>,
}

impl ModelTable {
    pub fn column(&self, field_name: &str) -> Option<&FieldColumn> {
        self.field_cols.get(field_name)
    }

    /// The table reference as it appears in SQL, e.g. `"public"."users"`.
    pub fn sql_reference(&self, provider: Provider) -> String {
        let quote = |name: &Name| match provider {
            Provider::MySql => format!("`{}`", name.0.replace('`', "``")),
            _ => format!("\"{}\"", name.0.replace('"', "\"\"")),
        };
        match &self.schema_name {
            Some(schema_name) => format!("{}.{}", quote(schema_name), quote(&self.table_name)),
            None => quote(&self.table_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldColumn {
    pub field_name: String,
    pub col_name: Name,
    pub optional: bool,
    pub unique: bool,
    pub repr: ColumnRepr,
}

/// Representation of a model value in an SQL column.
///
/// The `Any` driver narrows the usable SQL types to text, bigint and double,
/// so the richer scalars ride on text with a canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRepr {
    /// A `String` stored as SQL text.
    StringAsText,
    /// An `Int` or `BigInt` stored as an SQL bigint.
    IntAsBigint,
    /// A `Float` stored as an SQL double.
    FloatAsDouble,
    /// A `Boolean` stored as an SQL integer (0/1).
    BooleanAsInt,
    /// A `Decimal` stored as its canonical string form.
    DecimalAsText,
    /// A `DateTime` stored as an RFC 3339 string.
    DateTimeAsText,
    /// A `Json` value (or typed JSON / scalar list) encoded as JSON text.
    JsonAsText,
    /// `Bytes` stored as base64 text.
    BytesAsBase64,
    /// An enum member stored as its name.
    EnumAsText,
}

/// An SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(pub String);

impl Layout {
    /// Computes the physical layout for a schema.
    pub fn from_schema(schema: Arc<Schema>) -> Result<Layout> {
        let mut model_tables = HashMap::new();
        for model in schema.models.values() {
            let table = Self::model_table(&schema, model)?;
            model_tables.insert(model.name.clone(), Arc::new(table));
        }
        Ok(Layout { model_tables, schema })
    }

    fn model_table(schema: &Schema, model: &Model) -> Result<ModelTable> {
        let mut field_cols = IndexMap::new();
        for field in model.scalar_fields() {
            let repr = column_repr(schema, field).map_err(|e| {
                Error::config(e).with_model(model.name.as_str())
            })?;
            field_cols.insert(
                field.name.clone(),
                FieldColumn {
                    field_name: field.name.clone(),
                    col_name: Name(field.column().to_owned()),
                    optional: field.optional,
                    unique: field.unique,
                    repr,
                },
            );
        }
        Ok(ModelTable {
            model_name: model.name.clone(),
            table_name: Name(model.table_name.clone()),
            schema_name: model.schema_name.clone().map(Name),
            field_cols,
            id_fields: model.id_fields.clone(),
        })
    }

    pub fn table(&self, model: &ModelName) -> Result<&Arc<ModelTable>> {
        self.model_tables.get(model).ok_or_else(|| {
            Error::internal(anyhow::anyhow!("no table layout for model `{model}`"))
        })
    }
}

fn column_repr(schema: &Schema, field: &Field) -> anyhow::Result<ColumnRepr> {
    let repr = match &*field.type_ {
        Type::Primitive(p) => match p {
            PrimitiveType::String => ColumnRepr::StringAsText,
            PrimitiveType::Boolean => ColumnRepr::BooleanAsInt,
            PrimitiveType::Int | PrimitiveType::BigInt => ColumnRepr::IntAsBigint,
            PrimitiveType::Float => ColumnRepr::FloatAsDouble,
            PrimitiveType::Decimal => ColumnRepr::DecimalAsText,
            PrimitiveType::DateTime => ColumnRepr::DateTimeAsText,
            PrimitiveType::Json => ColumnRepr::JsonAsText,
            PrimitiveType::Bytes => ColumnRepr::BytesAsBase64,
        },
        Type::Enum(name) => {
            anyhow::ensure!(
                schema.enums.contains_key(name),
                "field `{}` references unknown enum `{name}`",
                field.name
            );
            ColumnRepr::EnumAsText
        }
        // Typed JSON shapes and scalar lists are stored as JSON text.
        Type::Typedef(_) | Type::Array(_) => ColumnRepr::JsonAsText,
        Type::Model(name) => {
            anyhow::bail!(
                "relation field `{}` (-> {name}) has no column",
                field.name
            )
        }
    };
    Ok(repr)
}
