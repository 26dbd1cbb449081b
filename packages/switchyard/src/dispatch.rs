//! Handler resolution: which handlers run for a message.
//!
//! The engine never discovers handlers on its own. It asks a
//! [`HandlerResolver`] for the handlers of a message's runtime type and runs
//! them in the order returned. [`HandlerRegistry`] is the built-in resolver: a
//! plain table filled once at startup.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::context::OperationContext;
use crate::core::{Message, MessageEnvelope};
use crate::handler::{into_any_handler, AnyMessageHandler, MessageHandler};

/// Handlers resolved for one message, in invocation order.
pub type HandlerList = SmallVec<[Arc<dyn AnyMessageHandler>; 4]>;

/// Supplies the handlers for a message.
///
/// Implement this to plug in a dependency-injection container. The context is
/// the one the handlers will run under, so a resolver can scope instances to
/// the current call.
pub trait HandlerResolver: Send + Sync + 'static {
    fn resolve(&self, message: &MessageEnvelope, ctx: &OperationContext) -> HandlerList;
}

/// Startup-time table of handlers keyed by message type.
///
/// # Example
///
/// ```ignore
/// let registry = HandlerRegistry::new()
///     .with_handler::<PlaceOrder, _>(PlaceOrderHandler)
///     .with_handler::<OrderPlaced, _>(ReserveStock)
///     .with_handler::<OrderPlaced, _>(SendConfirmation);
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, HandlerList>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for message type `M`.
    ///
    /// Several handlers may be registered for the same type; they run in
    /// registration order.
    pub fn register<M, H>(&mut self, handler: H)
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.register_any(into_any_handler::<M, H>(handler));
    }

    /// Register an already erased handler under its own message type.
    pub fn register_any(&mut self, handler: Arc<dyn AnyMessageHandler>) {
        self.handlers
            .entry(handler.message_type())
            .or_default()
            .push(handler);
    }

    pub fn with_handler<M, H>(mut self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.register::<M, H>(handler);
        self
    }

    /// Handlers registered for `M`, in registration order.
    pub fn handlers_for<M: Message>(&self) -> HandlerList {
        self.lookup(TypeId::of::<M>())
    }

    pub fn contains<M: Message>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<M>())
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.values().map(|list| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn lookup(&self, message_type: TypeId) -> HandlerList {
        self.handlers.get(&message_type).cloned().unwrap_or_default()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, message: &MessageEnvelope, _ctx: &OperationContext) -> HandlerList {
        self.lookup(message.type_id())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.handlers.len())
            .field("handler_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Principal, Services};
    use crate::handler::MessageHandlerContext;
    use crate::unit_of_work::UnitOfWork;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone)]
    struct OrderPlaced;

    #[derive(Debug, Clone)]
    struct OrderCancelled;

    struct ReserveStock;
    struct SendConfirmation;

    #[async_trait]
    impl MessageHandler<OrderPlaced> for ReserveStock {
        async fn handle(&self, _event: OrderPlaced, _ctx: &MessageHandlerContext) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl MessageHandler<OrderPlaced> for SendConfirmation {
        async fn handle(&self, _event: OrderPlaced, _ctx: &MessageHandlerContext) -> Result<()> {
            Ok(())
        }
    }

    fn root_context() -> OperationContext {
        OperationContext::root(
            Principal::anonymous(),
            Arc::new(Services::new()),
            Arc::new(UnitOfWork::disabled()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_resolve_returns_handlers_in_registration_order() {
        let registry = HandlerRegistry::new()
            .with_handler::<OrderPlaced, _>(ReserveStock)
            .with_handler::<OrderPlaced, _>(SendConfirmation);

        let handlers = registry.resolve(&MessageEnvelope::event(OrderPlaced), &root_context());

        assert_eq!(handlers.len(), 2);
        assert!(handlers[0].component().ends_with("ReserveStock"));
        assert!(handlers[1].component().ends_with("SendConfirmation"));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains::<OrderPlaced>());
    }

    #[test]
    fn test_resolve_unknown_type_is_empty() {
        let registry = HandlerRegistry::new().with_handler::<OrderPlaced, _>(ReserveStock);

        let handlers = registry.resolve(&MessageEnvelope::event(OrderCancelled), &root_context());

        assert!(handlers.is_empty());
        assert!(!registry.contains::<OrderCancelled>());
        assert!(registry.handlers_for::<OrderCancelled>().is_empty());
    }

    #[test]
    fn test_resolution_ignores_message_kind() {
        let registry = HandlerRegistry::new().with_handler::<OrderPlaced, _>(ReserveStock);
        let ctx = root_context();

        assert_eq!(registry.resolve(&MessageEnvelope::command(OrderPlaced), &ctx).len(), 1);
        assert_eq!(registry.resolve(&MessageEnvelope::event(OrderPlaced), &ctx).len(), 1);
    }
}
