//! The interception pipeline.
//!
//! Plugins hook an operation at two planes: `on_query` wraps the high-level
//! verb (model + operation + JSON args), `on_query_node` wraps each built
//! query node just before SQL emission. Both receive a `proceed` continuation
//! to the next plugin (or the core); a plugin may call it zero, one or many
//! times and may transform the arguments and the result.
//!
//! Chains run in derivation order: the plugin registered last (outermost
//! `use_plugin`) runs first. The policy engine is itself the innermost
//! node-level interceptor, so user plugins see nodes before policy
//! predicates are injected.

use crate::error::Result;
use crate::mutation::{NodeOutput, QueryNode};
use crate::plan::RequestContext;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Context handed to `on_query` hooks.
pub struct QueryHookContext<'a> {
    pub model: &'a str,
    pub operation: &'a str,
    pub args: JsonValue,
}

/// Context handed to `on_query_node` hooks.
pub struct NodeHookContext<'a> {
    pub model: &'a str,
    pub operation: &'a str,
    pub rcx: &'a RequestContext<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Context handed to entity-mutation hooks.
pub struct MutationHookContext<'a> {
    pub model: &'a str,
    pub action: MutationAction,
    /// The rows the mutation touches, as far as they are known at the time
    /// of the call: input data before, affected rows after.
    pub entities: &'a [crate::JsonObject],
}

pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> Option<&str> {
        None
    }

    /// High-level interception of one CRUD operation.
    fn on_query<'a>(
        &'a self,
        ctx: QueryHookContext<'a>,
        next: NextQuery<'a, '_>,
    ) -> BoxFuture<'a, Result<JsonValue>> {
        next.proceed(ctx.args)
    }

    /// Low-level interception of one built query node.
    fn on_query_node<'a>(
        &'a self,
        _ctx: &NodeHookContext<'a>,
        node: QueryNode,
        next: NextNode<'a, '_>,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        next.proceed(node)
    }

    fn before_entity_mutation<'a>(
        &'a self,
        _ctx: MutationHookContext<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    fn after_entity_mutation<'a>(
        &'a self,
        _ctx: MutationHookContext<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    /// When true, `after_entity_mutation` runs before the transaction
    /// commits, so its reads see the mutation and its errors roll it back.
    fn run_after_mutation_within_transaction(&self) -> bool {
        false
    }
}

/// Continuation to the rest of the high-level chain.
pub struct NextQuery<'a, 'c> {
    chain: &'a [Arc<dyn Plugin>],
    core: &'c (dyn Fn(JsonValue) -> BoxFuture<'a, Result<JsonValue>> + Sync + 'a),
    model: &'a str,
    operation: &'a str,
}

impl<'a, 'c> NextQuery<'a, 'c> {
    pub fn proceed(&self, args: JsonValue) -> BoxFuture<'a, Result<JsonValue>> {
        match self.chain.split_first() {
            None => (self.core)(args),
            Some((head, rest)) => {
                let next = NextQuery {
                    chain: rest,
                    core: self.core,
                    model: self.model,
                    operation: self.operation,
                };
                head.on_query(
                    QueryHookContext {
                        model: self.model,
                        operation: self.operation,
                        args,
                    },
                    next,
                )
            }
        }
    }
}

/// Runs `args` through the plugin chain down to `core`. `chain` must be in
/// outermost-first order.
pub fn dispatch_query<'a>(
    chain: &'a [Arc<dyn Plugin>],
    model: &'a str,
    operation: &'a str,
    args: JsonValue,
    core: &(dyn Fn(JsonValue) -> BoxFuture<'a, Result<JsonValue>> + Sync + 'a),
) -> BoxFuture<'a, Result<JsonValue>> {
    let next = NextQuery { chain, core, model, operation };
    next.proceed(args)
}

/// Continuation to the rest of the node-level chain.
pub struct NextNode<'a, 'e> {
    chain: &'a [Arc<dyn Plugin>],
    ctx: &'a NodeHookContext<'a>,
    exec: &'e (dyn Fn(QueryNode) -> BoxFuture<'a, Result<NodeOutput>> + Sync + 'a),
}

impl<'a, 'e> NextNode<'a, 'e> {
    pub fn proceed(&self, node: QueryNode) -> BoxFuture<'a, Result<NodeOutput>> {
        match self.chain.split_first() {
            None => (self.exec)(node),
            Some((head, rest)) => {
                let next = NextNode { chain: rest, ctx: self.ctx, exec: self.exec };
                head.on_query_node(self.ctx, node, next)
            }
        }
    }
}

/// Runs a built node through the node-level chain down to the executor.
pub fn dispatch_node<'a>(
    chain: &'a [Arc<dyn Plugin>],
    ctx: &'a NodeHookContext<'a>,
    node: QueryNode,
    exec: &(dyn Fn(QueryNode) -> BoxFuture<'a, Result<NodeOutput>> + Sync + 'a),
) -> BoxFuture<'a, Result<NodeOutput>> {
    let next = NextNode { chain, ctx, exec };
    next.proceed(node)
}
