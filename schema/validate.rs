//! Load-time schema validation.
//!
//! The schema arrives from the authoring toolchain and is trusted to be
//! syntactically well formed; this pass checks the structural invariants the
//! engine relies on. A schema that fails here is rejected before a client is
//! ever constructed.

use crate::schema::{
    Field, Model, PolicyOp, Provider, Schema, Type,
};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("model `{0}` has no id fields")]
    NoIdFields(String),
    #[error("id field `{1}` of model `{0}` must be a required scalar")]
    BadIdField(String, String),
    #[error("model `{0}` references unknown model `{1}`")]
    UnknownModel(String, String),
    #[error("relation `{1}` of model `{0}`: {2}")]
    BadRelation(String, String, String),
    #[error("delegate model `{0}`: {1}")]
    BadDelegate(String, String),
    #[error("model `{0}`: `@@unique` over field `{1}` inherited from delegate base `{2}` is not supported")]
    UniqueOnInheritedField(String, String, String),
    #[error("model `{0}` references unknown type-def `{1}`")]
    UnknownTypedef(String, String),
    #[error("model `{0}` references unknown enum `{1}`")]
    UnknownEnum(String, String),
    #[error("model `{0}`: `@@schema` requires the postgresql provider")]
    SchemaNameUnsupported(String),
    #[error("auth model `{0}` is not defined")]
    UnknownAuthModel(String),
    #[error("policy on model `{0}` uses operation `{1}` which is not valid there")]
    BadPolicyOp(String, String),
}

/// Validates the structural invariants of a schema.
pub fn validate(schema: &Schema) -> Result<(), SchemaError> {
    for model in schema.models.values() {
        validate_ids(model)?;
        validate_fields(schema, model)?;
        validate_relations(schema, model)?;
        validate_delegate(schema, model)?;
        validate_policies(model)?;
    }
    if let Some(auth) = &schema.auth_model {
        if !schema.models.contains_key(auth) {
            return Err(SchemaError::UnknownAuthModel(auth.0.clone()));
        }
    }
    Ok(())
}

fn validate_ids(model: &Model) -> Result<(), SchemaError> {
    if model.id_fields.is_empty() {
        return Err(SchemaError::NoIdFields(model.name.0.clone()));
    }
    for id_field in &model.id_fields {
        let ok = model.field(id_field).map_or(false, |f| {
            !f.optional && f.relation.is_none() && !f.computed && !f.is_list()
        });
        if !ok {
            return Err(SchemaError::BadIdField(
                model.name.0.clone(),
                id_field.clone(),
            ));
        }
    }
    Ok(())
}

fn validate_fields(schema: &Schema, model: &Model) -> Result<(), SchemaError> {
    for field in model.fields.values() {
        check_type(schema, model, &field.type_)?;
    }
    if model.schema_name.is_some() && !schema.provider.supports_multi_schema() {
        return Err(SchemaError::SchemaNameUnsupported(model.name.0.clone()));
    }
    for mixin in &model.mixins {
        if !schema.typedefs.contains_key(mixin) {
            return Err(SchemaError::UnknownTypedef(
                model.name.0.clone(),
                mixin.clone(),
            ));
        }
    }
    Ok(())
}

fn check_type(schema: &Schema, model: &Model, ty: &Arc<Type>) -> Result<(), SchemaError> {
    match &**ty {
        Type::Model(name) => {
            if !schema.models.contains_key(name) {
                return Err(SchemaError::UnknownModel(
                    model.name.0.clone(),
                    name.0.clone(),
                ));
            }
        }
        Type::Typedef(name) => {
            if !schema.typedefs.contains_key(name) {
                return Err(SchemaError::UnknownTypedef(
                    model.name.0.clone(),
                    name.clone(),
                ));
            }
        }
        Type::Enum(name) => {
            if !schema.enums.contains_key(name) {
                return Err(SchemaError::UnknownEnum(
                    model.name.0.clone(),
                    name.clone(),
                ));
            }
        }
        Type::Array(inner) => check_type(schema, model, inner)?,
        Type::Primitive(_) => {}
    }
    Ok(())
}

/// For every relation, exactly one side declares `fields`/`references`, and
/// the arities match column by column.
fn validate_relations(schema: &Schema, model: &Model) -> Result<(), SchemaError> {
    let bad = |field: &Field, msg: &str| {
        Err(SchemaError::BadRelation(
            model.name.0.clone(),
            field.name.clone(),
            msg.to_owned(),
        ))
    };

    for field in model.relation_fields() {
        let relation = field.relation.as_ref().unwrap();
        let target_name = match field.relation_target() {
            Some(name) => name,
            None => return bad(field, "relation field has a non-model type"),
        };
        let target = match schema.models.get(target_name) {
            Some(target) => target,
            None => {
                return Err(SchemaError::UnknownModel(
                    model.name.0.clone(),
                    target_name.0.clone(),
                ))
            }
        };

        if relation.is_owning() {
            if relation.fields.len() != relation.references.len() {
                return bad(field, "`fields` and `references` arities differ");
            }
            for fk in &relation.fields {
                if model.field(fk).map_or(true, |f| f.is_relation()) {
                    return bad(field, "`fields` names a missing or non-scalar field");
                }
            }
            for referenced in &relation.references {
                if target.field(referenced).map_or(true, |f| f.is_relation()) {
                    return bad(field, "`references` names a missing or non-scalar field");
                }
            }
        }

        if let Some(opposite) = &relation.opposite {
            let opp_field = match target.field(opposite) {
                Some(f) => f,
                None => return bad(field, "opposite relation field does not exist"),
            };
            let opp_rel = match &opp_field.relation {
                Some(r) => r,
                None => return bad(field, "opposite field is not a relation"),
            };
            if relation.is_owning() == opp_rel.is_owning() {
                return bad(
                    field,
                    "exactly one side of a relation must declare `fields`/`references`",
                );
            }
        }
    }
    Ok(())
}

fn validate_delegate(schema: &Schema, model: &Model) -> Result<(), SchemaError> {
    if let Some(delegate) = &model.delegate {
        let disc = model.field(&delegate.discriminator);
        let ok = disc.map_or(false, |f| {
            f.relation.is_none() && !f.computed && !f.is_list()
        });
        if !ok {
            return Err(SchemaError::BadDelegate(
                model.name.0.clone(),
                format!(
                    "discriminator `{}` must be a scalar field",
                    delegate.discriminator
                ),
            ));
        }
    }

    // `@@unique` over fields inherited from a delegate base is rejected.
    if let Some(base_name) = &model.base_model {
        let base = schema
            .models
            .get(base_name)
            .ok_or_else(|| {
                SchemaError::UnknownModel(model.name.0.clone(), base_name.0.clone())
            })?;
        if base.is_delegate() {
            let base_fields: HashSet<&str> =
                base.fields.keys().map(|k| k.as_str()).collect();
            for key in model.unique_keys.values() {
                for field_name in key {
                    if base_fields.contains(field_name.as_str()) {
                        return Err(SchemaError::UniqueOnInheritedField(
                            model.name.0.clone(),
                            field_name.clone(),
                            base_name.0.clone(),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_policies(model: &Model) -> Result<(), SchemaError> {
    // `post-update` only makes sense at the model level together with
    // `before()`.
    for field in model.fields.values() {
        for policy in &field.policies {
            if policy.operations.contains(&PolicyOp::PostUpdate) {
                return Err(SchemaError::BadPolicyOp(
                    model.name.0.clone(),
                    PolicyOp::PostUpdate.name().to_owned(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::*;
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn scalar_field(name: &str, ty: &Arc<Type>) -> Arc<Field> {
        Arc::new(Field {
            name: name.to_owned(),
            type_: ty.clone(),
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
        })
    }

    fn model(name: &str, fields: Vec<Arc<Field>>, id_fields: &[&str]) -> Arc<Model> {
        Arc::new(Model {
            name: name.into(),
            table_name: name.to_lowercase(),
            schema_name: None,
            fields: fields
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect::<IndexMap<_, _>>(),
            id_fields: id_fields.iter().map(|s| s.to_string()).collect(),
            unique_keys: IndexMap::new(),
            policies: vec![],
            row_checks: vec![],
            base_model: None,
            delegate: None,
            mixins: vec![],
        })
    }

    fn schema_with(models: Vec<Arc<Model>>) -> Schema {
        Schema {
            provider: Provider::Sqlite,
            models: models
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect::<HashMap<_, _>>(),
            enums: HashMap::new(),
            typedefs: HashMap::new(),
            procedures: HashMap::new(),
            auth_model: None,
        }
    }

    #[test]
    fn missing_id_fields_are_rejected() {
        let m = model("User", vec![scalar_field("name", &TYPE_STRING)], &[]);
        let err = validate(&schema_with(vec![m])).unwrap_err();
        assert!(matches!(err, SchemaError::NoIdFields(_)));
    }

    #[test]
    fn optional_id_field_is_rejected() {
        let mut id = scalar_field("id", &TYPE_STRING);
        Arc::get_mut(&mut id).unwrap().optional = true;
        let m = model("User", vec![id], &["id"]);
        let err = validate(&schema_with(vec![m])).unwrap_err();
        assert!(matches!(err, SchemaError::BadIdField(..)));
    }

    #[test]
    fn unique_on_inherited_delegate_field_is_rejected() {
        let mut base = model(
            "Asset",
            vec![scalar_field("id", &TYPE_STRING), scalar_field("kind", &TYPE_STRING)],
            &["id"],
        );
        Arc::get_mut(&mut base).unwrap().delegate = Some(Delegate {
            discriminator: "kind".to_owned(),
        });

        let mut video = model(
            "Video",
            vec![scalar_field("id", &TYPE_STRING), scalar_field("url", &TYPE_STRING)],
            &["id"],
        );
        {
            let video = Arc::get_mut(&mut video).unwrap();
            video.base_model = Some("Asset".into());
            video
                .unique_keys
                .insert("kind_key".to_owned(), vec!["kind".to_owned()]);
        }

        let err = validate(&schema_with(vec![base, video])).unwrap_err();
        assert!(matches!(err, SchemaError::UniqueOnInheritedField(..)));
    }

    #[test]
    fn compound_unique_selector_matches_regardless_of_order() {
        let mut m = model(
            "Member",
            vec![
                scalar_field("org", &TYPE_STRING),
                scalar_field("user", &TYPE_STRING),
            ],
            &["org", "user"],
        );
        Arc::get_mut(&mut m).unwrap().unique_keys.insert(
            "org_user".to_owned(),
            vec!["org".to_owned(), "user".to_owned()],
        );
        assert!(m.is_unique_selector(&["user", "org"]));
        assert!(!m.is_unique_selector(&["org"]));
    }
}
