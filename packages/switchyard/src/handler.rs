//! Message handlers and the context they run in.
//!
//! A [`MessageHandler`] reacts to one message type. The same trait serves
//! commands and events; the role of the message is decided by the caller.
//!
//! # Key Properties
//!
//! - **Publish, don't dispatch**: events published through
//!   [`MessageHandlerContext::publish`] are dispatched after the handler
//!   returns, depth-first, before the next sibling runs
//! - **Enlist, don't commit**: writes go to resource managers enlisted in the
//!   unit of work; the engine flushes them once the whole call tree succeeds
//! - **Discarded on failure**: a failing handler's published events are dropped

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::EventBus;
use crate::context::{OperationContext, Principal, Services, StackTrace};
use crate::core::{Message, MessageEnvelope};
use crate::engine::Engine;
use crate::error::{DispatchError, EngineError, HandlerError};
use crate::filter::{InvocationContext, Outcome, Terminal};
use crate::operation::Operation;
use crate::query::Query;
use crate::stream::{MessageHandlerResult, MessageStream};
use crate::unit_of_work::{ResourceManager, UnitOfWork, UnitOfWorkError};

/// Handles one message type.
///
/// # Example
///
/// ```ignore
/// struct ReserveStock;
///
/// #[async_trait]
/// impl MessageHandler<OrderPlaced> for ReserveStock {
///     async fn handle(&self, event: OrderPlaced, ctx: &MessageHandlerContext) -> Result<()> {
///         let inventory = ctx.service::<Inventory>().context("inventory not registered")?;
///         ctx.enlist(inventory.writer())?;
///         inventory.reserve(event.sku, event.quantity);
///         ctx.publish(StockReserved { order_id: event.order_id });
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, ctx: &MessageHandlerContext) -> Result<()>;
}

/// Type-erased message handler, as stored in handler tables.
#[async_trait]
pub trait AnyMessageHandler: Send + Sync + 'static {
    /// Type name of the concrete handler.
    fn component(&self) -> &'static str;

    /// `TypeId` of the concrete handler. Component filters are keyed by it.
    fn component_id(&self) -> TypeId;

    /// `TypeId` of the message this handler accepts.
    fn message_type(&self) -> TypeId;

    async fn handle_any(&self, message: &MessageEnvelope, ctx: &MessageHandlerContext) -> Result<()>;
}

/// Adapts a concrete [`MessageHandler`] to [`AnyMessageHandler`].
pub(crate) struct HandlerWrapper<H, M> {
    handler: H,
    _phantom: PhantomData<M>,
}

impl<H, M> HandlerWrapper<H, M>
where
    H: MessageHandler<M>,
    M: Message,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, M> AnyMessageHandler for HandlerWrapper<H, M>
where
    H: MessageHandler<M>,
    M: Message,
{
    fn component(&self) -> &'static str {
        std::any::type_name::<H>()
    }

    fn component_id(&self) -> TypeId {
        TypeId::of::<H>()
    }

    fn message_type(&self) -> TypeId {
        TypeId::of::<M>()
    }

    async fn handle_any(&self, message: &MessageEnvelope, ctx: &MessageHandlerContext) -> Result<()> {
        let typed = message
            .downcast_ref::<M>()
            .cloned()
            .ok_or_else(|| EngineError::MessageTypeMismatch {
                component: std::any::type_name::<H>(),
                expected: std::any::type_name::<M>(),
                actual: message.type_name(),
            })?;
        self.handler.handle(typed, ctx).await
    }
}

/// Erase a handler so it can be stored in a handler table or passed to
/// [`Engine::execute_command_with`].
pub fn into_any_handler<M, H>(handler: H) -> Arc<dyn AnyMessageHandler>
where
    M: Message,
    H: MessageHandler<M>,
{
    Arc::new(HandlerWrapper::<H, M>::new(handler))
}

// =============================================================================
// Handler Context
// =============================================================================

/// Context passed to message handlers.
///
/// Holds the invocation's own [`EventBus`]; everything else (principal,
/// services, unit of work, cancellation) is shared with the rest of the call.
pub struct MessageHandlerContext {
    invocation: Arc<InvocationContext>,
    bus: EventBus,
    engine: Engine,
}

impl MessageHandlerContext {
    pub(crate) fn new(invocation: Arc<InvocationContext>, engine: Engine) -> Self {
        Self {
            invocation,
            bus: EventBus::new(),
            engine,
        }
    }

    /// Publish an event. It is dispatched after this handler returns.
    pub fn publish<E: Message>(&self, event: E) {
        self.bus.publish(event);
    }

    /// Publish an already wrapped event.
    pub fn publish_envelope(&self, envelope: MessageEnvelope) {
        self.bus.publish_envelope(envelope);
    }

    /// Number of events published by this invocation so far.
    pub fn published_count(&self) -> usize {
        self.bus.len()
    }

    pub(crate) fn take_published(&self) -> MessageStream {
        self.bus.drain()
    }

    /// The operation this handler runs as.
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

    /// The invocation as seen by filters, including its property bag.
    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.invocation.property(key)
    }

    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        self.operation_context().unit_of_work()
    }

    /// Enlist a resource manager to be flushed when the root call succeeds.
    pub fn enlist(&self, manager: Arc<dyn ResourceManager>) -> Result<(), UnitOfWorkError> {
        self.unit_of_work().enlist(manager)
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

    /// Dispatch a command as part of this call.
    ///
    /// The command runs as a branch operation and shares this call's unit of
    /// work; nothing is flushed until the root call completes.
    pub async fn execute_command<C: Message>(&self, command: C) -> Result<MessageHandlerResult, DispatchError> {
        self.engine
            .dispatch(self.operation_context(), MessageEnvelope::command(command), None)
            .await
    }

    /// Dispatch an event immediately, as part of this call.
    ///
    /// Prefer [`publish`](Self::publish); this is for handlers that need the
    /// result of the nested dispatch before continuing.
    pub async fn handle_event<E: Message>(&self, event: E) -> Result<MessageHandlerResult, DispatchError> {
        self.engine
            .dispatch(self.operation_context(), MessageEnvelope::event(event), None)
            .await
    }

    /// Run a query as part of this call.
    pub async fn execute_query<Q: Query>(&self, query: &Q, request: Q::Request) -> Result<Q::Response, DispatchError> {
        self.engine
            .run_query(self.operation_context(), query, request)
            .await
    }

    fn operation_context(&self) -> &OperationContext {
        self.invocation.operation_context()
    }
}

impl std::fmt::Debug for MessageHandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandlerContext")
            .field("operation", self.operation())
            .field("published", &self.bus.len())
            .finish_non_exhaustive()
    }
}

/// Bottom of the filter chain for a handler invocation.
pub(crate) struct HandlerInvoker<'a> {
    pub handler: &'a dyn AnyMessageHandler,
    pub ctx: &'a MessageHandlerContext,
}

#[async_trait]
impl<'a> Terminal for HandlerInvoker<'a> {
    async fn call(&self, ctx: &InvocationContext) -> Result<Outcome> {
        self.handler.handle_any(ctx.message(), self.ctx).await?;
        Ok(Outcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct PlaceOrder {
        quantity: u32,
    }

    #[derive(Debug, Clone)]
    struct CancelOrder;

    struct PlaceOrderHandler;

    #[async_trait]
    impl MessageHandler<PlaceOrder> for PlaceOrderHandler {
        async fn handle(&self, _cmd: PlaceOrder, _ctx: &MessageHandlerContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_erased_handler_reports_types() {
        let handler = into_any_handler::<PlaceOrder, _>(PlaceOrderHandler);

        assert_eq!(handler.component_id(), TypeId::of::<PlaceOrderHandler>());
        assert_eq!(handler.message_type(), TypeId::of::<PlaceOrder>());
        assert!(handler.component().ends_with("PlaceOrderHandler"));
    }

    #[test]
    fn test_type_mismatch_error_names_both_types() {
        let err = EngineError::MessageTypeMismatch {
            component: "PlaceOrderHandler",
            expected: std::any::type_name::<PlaceOrder>(),
            actual: std::any::type_name::<CancelOrder>(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PlaceOrder"));
        assert!(msg.contains("CancelOrder"));
    }
}
