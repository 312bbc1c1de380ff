//! Named server-side procedures.
//!
//! The schema declares each procedure's typed signature; the handler bodies
//! are registered at client construction. Mutating procedures run inside a
//! transaction: a thrown error rolls every side effect back.

use crate::client::Client;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use quarry_schema::schema::{PrimitiveType, ProcParam, Type};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// A procedure body. It receives a client bound to the procedure's
/// transaction (when the procedure mutates) and the validated arguments.
pub type ProcHandler = Arc<
    dyn for<'a> Fn(&'a Client, Vec<JsonValue>) -> BoxFuture<'a, Result<JsonValue>>
        + Send
        + Sync,
>;

#[derive(Default, Clone)]
pub struct ProcRegistry {
    handlers: HashMap<String, ProcHandler>,
}

impl ProcRegistry {
    pub fn register(&mut self, name: &str, handler: ProcHandler) {
        self.handlers.insert(name.to_owned(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&ProcHandler> {
        self.handlers.get(name)
    }
}

pub(crate) async fn call(
    client: &Client,
    name: &str,
    args: Vec<JsonValue>,
) -> Result<JsonValue> {
    let core = client.core();
    let decl = core
        .schema
        .procedures
        .get(name)
        .cloned()
        .ok_or_else(|| {
            Error::invalid_input(vec![format!("unknown procedure `{name}`")])
        })?;
    let handler = core
        .procedures
        .get(name)
        .cloned()
        .ok_or_else(|| {
            Error::config(anyhow::anyhow!(
                "procedure `{name}` has no registered handler"
            ))
        })?;

    check_arguments(name, &decl.params, &args)?;

    if decl.mutates {
        client
            .transaction(move |tx_client| handler(tx_client, args))
            .await
    } else {
        handler(client, args).await
    }
}

/// Arity and shallow type checks against the declared signature.
fn check_arguments(name: &str, params: &[ProcParam], args: &[JsonValue]) -> Result<()> {
    let required = params.iter().filter(|p| !p.optional).count();
    if args.len() < required || args.len() > params.len() {
        return Err(Error::invalid_input(vec![format!(
            "procedure `{name}` expects {}..{} arguments, got {}",
            required,
            params.len(),
            args.len()
        )]));
    }
    for (param, arg) in params.iter().zip(args.iter()) {
        if arg.is_null() {
            if !param.optional {
                return Err(Error::invalid_input(vec![format!(
                    "argument `{}` of `{name}` must not be null",
                    param.name
                )]));
            }
            continue;
        }
        if !type_matches(&param.type_, arg) {
            return Err(Error::invalid_input(vec![format!(
                "argument `{}` of `{name}` has the wrong type",
                param.name
            )]));
        }
    }
    Ok(())
}

fn type_matches(ty: &Arc<Type>, value: &JsonValue) -> bool {
    match &**ty {
        Type::Primitive(p) => match p {
            PrimitiveType::String
            | PrimitiveType::DateTime
            | PrimitiveType::Decimal
            | PrimitiveType::Bytes => value.is_string(),
            PrimitiveType::Boolean => value.is_boolean(),
            PrimitiveType::Int | PrimitiveType::BigInt | PrimitiveType::Float => value.is_number(),
            PrimitiveType::Json => true,
        },
        Type::Enum(_) => value.is_string(),
        Type::Array(inner) => match value {
            JsonValue::Array(items) => items.iter().all(|item| type_matches(inner, item)),
            _ => false,
        },
        // model-typed and typedef-typed arguments arrive as objects
        Type::Model(_) | Type::Typedef(_) => value.is_object(),
    }
}
