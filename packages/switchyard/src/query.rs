//! Queries: side-effect-free reads that produce exactly one response.
//!
//! Queries run through the same filter pipeline as message handlers but never
//! publish events and never enlist resources: a root query carries a disabled
//! unit of work.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::{OperationContext, Principal, Services, StackTrace};
use crate::core::{Message, MessageEnvelope};
use crate::engine::Engine;
use crate::error::{DispatchError, HandlerError};
use crate::filter::{InvocationContext, Outcome, Terminal};
use crate::operation::Operation;

/// A read model lookup.
///
/// # Example
///
/// ```ignore
/// struct OrderStatus;
///
/// #[async_trait]
/// impl Query for OrderStatus {
///     type Request = OrderId;
///     type Response = Status;
///
///     async fn execute(&self, id: OrderId, ctx: &QueryContext) -> Result<Status> {
///         let orders = ctx.service::<OrderReadModel>().context("read model not registered")?;
///         orders
///             .status(id)
///             .ok_or_else(|| HandlerError::business_rule(format!("no order {id}")).into())
///     }
/// }
/// ```
#[async_trait]
pub trait Query: Send + Sync + 'static {
    type Request: Message;
    type Response: Message;

    async fn execute(&self, request: Self::Request, ctx: &QueryContext) -> Result<Self::Response>;
}

/// Context passed to queries.
pub struct QueryContext {
    invocation: Arc<InvocationContext>,
    engine: Engine,
}

impl QueryContext {
    pub(crate) fn new(invocation: Arc<InvocationContext>, engine: Engine) -> Self {
        Self { invocation, engine }
    }

    pub fn operation(&self) -> &Operation {
        self.invocation.operation()
    }

    pub fn stack_trace(&self) -> &StackTrace {
        self.invocation.stack_trace()
    }

    pub fn principal(&self) -> &Principal {
        self.invocation.principal()
    }

    pub fn services(&self) -> &Services {
        self.invocation.services()
    }

    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.invocation.service::<T>()
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.invocation.property(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.invocation.is_cancelled()
    }

    /// Fail with [`HandlerError::Cancelled`] if the call has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        Ok(())
    }

    /// Run another query as a branch of this one.
    pub async fn execute_query<N: Query>(&self, query: &N, request: N::Request) -> Result<N::Response, DispatchError> {
        self.engine
            .run_query(self.operation_context(), query, request)
            .await
    }

    fn operation_context(&self) -> &OperationContext {
        self.invocation.operation_context()
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("operation", self.operation())
            .finish_non_exhaustive()
    }
}

/// Bottom of the filter chain for a query invocation.
pub(crate) struct QueryInvoker<'a, Q: Query> {
    pub query: &'a Q,
    pub request: &'a Q::Request,
    pub ctx: &'a QueryContext,
}

#[async_trait]
impl<'a, Q: Query> Terminal for QueryInvoker<'a, Q> {
    async fn call(&self, _ctx: &InvocationContext) -> Result<Outcome> {
        let response = self.query.execute(self.request.clone(), self.ctx).await?;
        Ok(Outcome::Response(MessageEnvelope::response(response)))
    }
}
