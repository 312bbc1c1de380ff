//! Argument shapes of the CRUD surface.
//!
//! Arguments arrive as JSON (the high-level plugin chain sees and may rewrite
//! them) and are parsed into these types after the chain has run. Nested
//! relation writes are tagged variants rather than free-form maps, so every
//! handler matches on a closed set of operations.

use crate::error::{Error, Result};
use crate::JsonObject;
use serde_json::Value as JsonValue;

/// Option keys where an explicit JSON null means "not given". Inside `data`
/// and `where` payloads null is meaningful and preserved.
const OPTION_KEYS: &[&str] = &[
    "select", "include", "omit", "orderBy", "skip", "take", "cursor", "distinct", "having",
    "limit",
];

/// Strips nulls at option positions, recursively through nested relation
/// payloads. `find(normalize(args))` and `find(args)` are equivalent.
pub fn normalize_args(args: &mut JsonValue) {
    if let JsonValue::Object(obj) = args {
        obj.retain(|key, value| !(value.is_null() && OPTION_KEYS.contains(&key.as_str())));
    }
}

fn get_object<'a>(args: &'a JsonObject, key: &str) -> Result<Option<&'a JsonObject>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Object(obj)) => Ok(Some(obj)),
        Some(_) => Err(Error::invalid_input(vec![format!(
            "`{key}` must be an object"
        )])),
    }
}

fn get_u64(args: &JsonObject, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::invalid_input(vec![format!("`{key}` must be a non-negative integer")])),
    }
}

fn get_i64(args: &JsonObject, key: &str) -> Result<Option<i64>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::invalid_input(vec![format!("`{key}` must be an integer")])),
    }
}

fn as_object_strict(args: JsonValue) -> Result<JsonObject> {
    match args {
        JsonValue::Object(obj) => Ok(obj),
        JsonValue::Null => Ok(JsonObject::new()),
        _ => Err(Error::invalid_input(vec![
            "operation arguments must be an object".to_owned(),
        ])),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindArgs {
    pub where_: Option<JsonValue>,
    pub select: Option<JsonObject>,
    pub include: Option<JsonObject>,
    pub omit: Option<JsonObject>,
    pub order_by: Option<JsonValue>,
    pub skip: Option<u64>,
    /// Signed: a negative take reverses the order.
    pub take: Option<i64>,
    pub cursor: Option<JsonObject>,
    pub distinct: Option<Vec<String>>,
}

impl FindArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let distinct = match obj.get("distinct") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(vec![s.clone()]),
            Some(JsonValue::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| {
                        v.as_str().map(|s| s.to_owned()).ok_or_else(|| {
                            Error::invalid_input(vec![
                                "`distinct` entries must be field names".to_owned()
                            ])
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
            Some(_) => {
                return Err(Error::invalid_input(vec![
                    "`distinct` must be a field name or an array of field names".to_owned(),
                ]))
            }
        };
        Ok(Self {
            where_: obj.get("where").cloned(),
            select: get_object(&obj, "select")?.cloned(),
            include: get_object(&obj, "include")?.cloned(),
            omit: get_object(&obj, "omit")?.cloned(),
            order_by: obj.get("orderBy").cloned(),
            skip: get_u64(&obj, "skip")?,
            take: get_i64(&obj, "take")?,
            cursor: get_object(&obj, "cursor")?.cloned(),
            distinct,
        })
    }

    pub fn selection(&self) -> crate::plan::Selection {
        crate::plan::Selection {
            select: self.select.clone(),
            include: self.include.clone(),
            omit: self.omit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub data: JsonObject,
    pub select: Option<JsonObject>,
    pub include: Option<JsonObject>,
    pub omit: Option<JsonObject>,
}

impl CreateArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let data = get_object(&obj, "data")?
            .cloned()
            .ok_or_else(|| Error::invalid_input(vec!["`data` is required".to_owned()]))?;
        Ok(Self {
            data,
            select: get_object(&obj, "select")?.cloned(),
            include: get_object(&obj, "include")?.cloned(),
            omit: get_object(&obj, "omit")?.cloned(),
        })
    }

    pub fn selection(&self) -> crate::plan::Selection {
        crate::plan::Selection {
            select: self.select.clone(),
            include: self.include.clone(),
            omit: self.omit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateManyArgs {
    pub data: Vec<JsonObject>,
    pub skip_duplicates: bool,
}

impl CreateManyArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let data = match obj.get("data") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_object().cloned().ok_or_else(|| {
                        Error::invalid_input(vec!["`data` rows must be objects".to_owned()])
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(JsonValue::Object(row)) => vec![row.clone()],
            _ => {
                return Err(Error::invalid_input(vec![
                    "`data` must be an array of rows".to_owned(),
                ]))
            }
        };
        let skip_duplicates = obj
            .get("skipDuplicates")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Self { data, skip_duplicates })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateArgs {
    pub where_: JsonObject,
    pub data: JsonObject,
    pub select: Option<JsonObject>,
    pub include: Option<JsonObject>,
    pub omit: Option<JsonObject>,
}

impl UpdateArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let where_ = get_object(&obj, "where")?
            .cloned()
            .ok_or_else(|| Error::invalid_input(vec!["`where` is required".to_owned()]))?;
        let data = get_object(&obj, "data")?
            .cloned()
            .ok_or_else(|| Error::invalid_input(vec!["`data` is required".to_owned()]))?;
        Ok(Self {
            where_,
            data,
            select: get_object(&obj, "select")?.cloned(),
            include: get_object(&obj, "include")?.cloned(),
            omit: get_object(&obj, "omit")?.cloned(),
        })
    }

    pub fn selection(&self) -> crate::plan::Selection {
        crate::plan::Selection {
            select: self.select.clone(),
            include: self.include.clone(),
            omit: self.omit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateManyArgs {
    pub where_: Option<JsonValue>,
    pub data: JsonObject,
    pub limit: Option<u64>,
}

impl UpdateManyArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let data = get_object(&obj, "data")?
            .cloned()
            .ok_or_else(|| Error::invalid_input(vec!["`data` is required".to_owned()]))?;
        Ok(Self {
            where_: obj.get("where").cloned(),
            data,
            limit: get_u64(&obj, "limit")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpsertArgs {
    pub where_: JsonObject,
    pub create: JsonObject,
    pub update: JsonObject,
    pub select: Option<JsonObject>,
    pub include: Option<JsonObject>,
    pub omit: Option<JsonObject>,
}

impl UpsertArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let required = |key: &str| {
            get_object(&obj, key)?.cloned().ok_or_else(|| {
                Error::invalid_input(vec![format!("`{key}` is required")])
            })
        };
        Ok(Self {
            where_: required("where")?,
            create: required("create")?,
            update: required("update")?,
            select: get_object(&obj, "select")?.cloned(),
            include: get_object(&obj, "include")?.cloned(),
            omit: get_object(&obj, "omit")?.cloned(),
        })
    }

    pub fn selection(&self) -> crate::plan::Selection {
        crate::plan::Selection {
            select: self.select.clone(),
            include: self.include.clone(),
            omit: self.omit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteArgs {
    pub where_: JsonObject,
    pub select: Option<JsonObject>,
    pub include: Option<JsonObject>,
    pub omit: Option<JsonObject>,
}

impl DeleteArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let where_ = get_object(&obj, "where")?
            .cloned()
            .ok_or_else(|| Error::invalid_input(vec!["`where` is required".to_owned()]))?;
        Ok(Self {
            where_,
            select: get_object(&obj, "select")?.cloned(),
            include: get_object(&obj, "include")?.cloned(),
            omit: get_object(&obj, "omit")?.cloned(),
        })
    }

    pub fn selection(&self) -> crate::plan::Selection {
        crate::plan::Selection {
            select: self.select.clone(),
            include: self.include.clone(),
            omit: self.omit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteManyArgs {
    pub where_: Option<JsonValue>,
    pub limit: Option<u64>,
}

impl DeleteManyArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        Ok(Self {
            where_: obj.get("where").cloned(),
            limit: get_u64(&obj, "limit")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggregateArgs {
    pub where_: Option<JsonValue>,
    pub order_by: Option<JsonValue>,
    pub skip: Option<u64>,
    pub take: Option<i64>,
    /// `_count` accepts `true` (count rows) or a field selection.
    pub count: Option<JsonValue>,
    pub sum: Option<JsonObject>,
    pub avg: Option<JsonObject>,
    pub min: Option<JsonObject>,
    pub max: Option<JsonObject>,
}

impl AggregateArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        Ok(Self {
            where_: obj.get("where").cloned(),
            order_by: obj.get("orderBy").cloned(),
            skip: get_u64(&obj, "skip")?,
            take: get_i64(&obj, "take")?,
            count: obj.get("_count").cloned(),
            sum: get_object(&obj, "_sum")?.cloned(),
            avg: get_object(&obj, "_avg")?.cloned(),
            min: get_object(&obj, "_min")?.cloned(),
            max: get_object(&obj, "_max")?.cloned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GroupByArgs {
    pub by: Vec<String>,
    pub where_: Option<JsonValue>,
    pub having: Option<JsonObject>,
    pub order_by: Option<JsonValue>,
    pub skip: Option<u64>,
    pub take: Option<i64>,
    pub count: Option<JsonValue>,
    pub sum: Option<JsonObject>,
    pub avg: Option<JsonObject>,
    pub min: Option<JsonObject>,
    pub max: Option<JsonObject>,
}

impl GroupByArgs {
    pub fn parse(args: JsonValue) -> Result<Self> {
        let obj = as_object_strict(args)?;
        let by = match obj.get("by") {
            Some(JsonValue::String(s)) => vec![s.clone()],
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(|s| s.to_owned()).ok_or_else(|| {
                        Error::invalid_input(vec!["`by` entries must be field names".to_owned()])
                    })
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(Error::invalid_input(vec![
                    "`by` is required and must name grouping fields".to_owned(),
                ]))
            }
        };
        Ok(Self {
            by,
            where_: obj.get("where").cloned(),
            having: get_object(&obj, "having")?.cloned(),
            order_by: obj.get("orderBy").cloned(),
            skip: get_u64(&obj, "skip")?,
            take: get_i64(&obj, "take")?,
            count: obj.get("_count").cloned(),
            sum: get_object(&obj, "_sum")?.cloned(),
            avg: get_object(&obj, "_avg")?.cloned(),
            min: get_object(&obj, "_min")?.cloned(),
            max: get_object(&obj, "_max")?.cloned(),
        })
    }
}

/// One nested write on a relation field, tagged by operation.
#[derive(Debug, Clone)]
pub enum NestedWrite {
    Create(Vec<JsonObject>),
    CreateMany { data: Vec<JsonObject>, skip_duplicates: bool },
    Connect(Vec<JsonObject>),
    ConnectOrCreate(Vec<ConnectOrCreate>),
    /// `disconnect: true` on a to-one relation carries an empty selector.
    Disconnect(Vec<JsonObject>),
    Set(Vec<JsonObject>),
    Update(Vec<NestedUpdate>),
    UpdateMany(Vec<NestedUpdate>),
    Upsert(Vec<NestedUpsert>),
    /// `delete: true` on a to-one relation carries an empty selector.
    Delete(Vec<JsonObject>),
    DeleteMany(Vec<JsonValue>),
}

#[derive(Debug, Clone)]
pub struct ConnectOrCreate {
    pub where_: JsonObject,
    pub create: JsonObject,
}

#[derive(Debug, Clone)]
pub struct NestedUpdate {
    /// Absent for to-one updates: the linked row is the target.
    pub where_: Option<JsonValue>,
    pub data: JsonObject,
}

#[derive(Debug, Clone)]
pub struct NestedUpsert {
    pub where_: Option<JsonObject>,
    pub create: JsonObject,
    pub update: JsonObject,
}

/// Parses the value of a relation field inside a `data` payload into its
/// tagged operations.
pub fn parse_nested_writes(field_name: &str, value: &JsonValue) -> Result<Vec<NestedWrite>> {
    let obj = match value {
        JsonValue::Object(obj) => obj,
        _ => {
            return Err(Error::invalid_input(vec![format!(
                "relation `{field_name}` must be written through nested operations"
            )]))
        }
    };

    let one_or_many = |v: &JsonValue| -> Result<Vec<JsonObject>> {
        match v {
            JsonValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_object().cloned().ok_or_else(|| {
                        Error::invalid_input(vec![format!(
                            "nested operations on `{field_name}` must be objects"
                        )])
                    })
                })
                .collect(),
            JsonValue::Object(item) => Ok(vec![item.clone()]),
            JsonValue::Bool(true) => Ok(vec![JsonObject::new()]),
            _ => Err(Error::invalid_input(vec![format!(
                "invalid nested operation payload on `{field_name}`"
            )])),
        }
    };

    let mut out = vec![];
    for (key, v) in obj {
        let write = match key.as_str() {
            "create" => NestedWrite::Create(one_or_many(v)?),
            "createMany" => {
                let nested = v.as_object().ok_or_else(|| {
                    Error::invalid_input(vec![format!(
                        "`createMany` on `{field_name}` must be an object"
                    )])
                })?;
                let data = match nested.get("data") {
                    Some(JsonValue::Array(items)) => items
                        .iter()
                        .map(|item| {
                            item.as_object().cloned().ok_or_else(|| {
                                Error::invalid_input(vec![
                                    "`createMany.data` rows must be objects".to_owned(),
                                ])
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    _ => {
                        return Err(Error::invalid_input(vec![
                            "`createMany.data` must be an array".to_owned(),
                        ]))
                    }
                };
                NestedWrite::CreateMany {
                    data,
                    skip_duplicates: nested
                        .get("skipDuplicates")
                        .and_then(|b| b.as_bool())
                        .unwrap_or(false),
                }
            }
            "connect" => NestedWrite::Connect(one_or_many(v)?),
            "connectOrCreate" => {
                let entries = one_or_many(v)?;
                let mut parsed = vec![];
                for entry in entries {
                    let where_ = entry
                        .get("where")
                        .and_then(|w| w.as_object())
                        .cloned()
                        .ok_or_else(|| {
                            Error::invalid_input(vec![
                                "`connectOrCreate` requires `where`".to_owned(),
                            ])
                        })?;
                    let create = entry
                        .get("create")
                        .and_then(|c| c.as_object())
                        .cloned()
                        .ok_or_else(|| {
                            Error::invalid_input(vec![
                                "`connectOrCreate` requires `create`".to_owned(),
                            ])
                        })?;
                    parsed.push(ConnectOrCreate { where_, create });
                }
                NestedWrite::ConnectOrCreate(parsed)
            }
            "disconnect" => NestedWrite::Disconnect(one_or_many(v)?),
            "set" => match v {
                JsonValue::Array(_) | JsonValue::Object(_) => NestedWrite::Set(one_or_many(v)?),
                JsonValue::Null => NestedWrite::Set(vec![]),
                _ => {
                    return Err(Error::invalid_input(vec![format!(
                        "`set` on `{field_name}` must be a selector or an array of selectors"
                    )]))
                }
            },
            "update" => {
                let entries = one_or_many(v)?;
                let mut parsed = vec![];
                for entry in entries {
                    // to-one: `update: {data...}` without a where
                    if let Some(data) = entry.get("data").and_then(|d| d.as_object()) {
                        parsed.push(NestedUpdate {
                            where_: entry.get("where").cloned(),
                            data: data.clone(),
                        });
                    } else {
                        parsed.push(NestedUpdate { where_: None, data: entry });
                    }
                }
                NestedWrite::Update(parsed)
            }
            "updateMany" => {
                let entries = one_or_many(v)?;
                let mut parsed = vec![];
                for entry in entries {
                    let data = entry
                        .get("data")
                        .and_then(|d| d.as_object())
                        .cloned()
                        .ok_or_else(|| {
                            Error::invalid_input(vec!["`updateMany` requires `data`".to_owned()])
                        })?;
                    parsed.push(NestedUpdate { where_: entry.get("where").cloned(), data });
                }
                NestedWrite::UpdateMany(parsed)
            }
            "upsert" => {
                let entries = one_or_many(v)?;
                let mut parsed = vec![];
                for entry in entries {
                    let create = entry
                        .get("create")
                        .and_then(|c| c.as_object())
                        .cloned()
                        .ok_or_else(|| {
                            Error::invalid_input(vec!["`upsert` requires `create`".to_owned()])
                        })?;
                    let update = entry
                        .get("update")
                        .and_then(|u| u.as_object())
                        .cloned()
                        .ok_or_else(|| {
                            Error::invalid_input(vec!["`upsert` requires `update`".to_owned()])
                        })?;
                    parsed.push(NestedUpsert {
                        where_: entry.get("where").and_then(|w| w.as_object()).cloned(),
                        create,
                        update,
                    });
                }
                NestedWrite::Upsert(parsed)
            }
            "delete" => NestedWrite::Delete(one_or_many(v)?),
            "deleteMany" => match v {
                JsonValue::Array(items) => NestedWrite::DeleteMany(items.clone()),
                other => NestedWrite::DeleteMany(vec![other.clone()]),
            },
            other => {
                return Err(Error::invalid_input(vec![format!(
                    "unknown nested operation `{other}` on relation `{field_name}`"
                )]))
            }
        };
        out.push(write);
    }
    Ok(out)
}
