//! The frozen schema model consumed by the Quarry data engine.
//!
//! This crate defines the in-memory description of models, fields, relations,
//! enums, type-defs, access policies and procedures. The schema is produced by
//! the authoring toolchain, serialized as JSON, and deserialized here. After
//! deserialization it is immutable: the engine only ever reads it.

#[macro_use]
mod serde_with;

pub mod schema;
pub mod validate;

pub use validate::{validate, SchemaError};
