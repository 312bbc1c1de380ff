//! # Quarry data engine
//!
//! ## Requirements
//!
//! - Applications persist and retrieve model rows through a typed CRUD
//!   surface derived from a declarative schema.
//! - Query execution must be efficient, but respect the declarative access
//!   policies set by the user.
//!
//! ## Design
//!
//! The schema (see `quarry-schema`) is compiled into a physical [`layout`],
//! and every operation flows through one pipeline:
//!
//! ```text
//! args -> high-level plugins -> validation -> operation handler
//!      -> query nodes -> low-level plugins -> policy rewrite -> executor
//! ```
//!
//! The operation handlers in [`crud`] translate nested, typed arguments into
//! query plans; [`policy`] rewrites reads to enforce row-level rules and
//! authorizes mutations with in-transaction read-back; [`engine`] owns the
//! driver, the transactions and the error normalization.

#[macro_use]
pub mod error;

pub mod client;
pub mod conn;
pub mod crud;
pub mod engine;
pub mod expr;
pub mod filter;
pub mod layout;
pub mod mutation;
pub mod plan;
pub mod plugin;
pub mod policy;
pub mod procedures;
pub mod sql_writer;
pub mod util;
pub mod validate;
pub mod value;

pub use client::{Client, ClientOptions, ModelHandle};
pub use error::{Error, ErrorKind, RejectReason, Result};
pub use plugin::Plugin;

/// A decoded result row.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;
