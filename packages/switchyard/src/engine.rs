//! The dispatch engine: entry point for commands, events and queries.
//!
//! # Call Lifecycle
//!
//! ```text
//! execute_command(PlaceOrder)
//!     │
//!     ▼ root context: principal, services, fresh UnitOfWork, token
//! Dispatch(PlaceOrder) ── resolve handlers
//!     │
//!     ├─► Invoke(PlaceOrderHandler)   [root]    filters ─► handle() ─► publish [A, B]
//!     │       ├─► Dispatch(A) ─► Invoke(..)  [branch]  ─► publish [C]
//!     │       │       └─► Dispatch(C) ─► Invoke(..)  [branch]
//!     │       └─► Dispatch(B) ─► Invoke(..)  [branch]
//!     │
//!     ▼ whole tree succeeded and not cancelled
//! UnitOfWork::flush()  (exactly once)
//! ```
//!
//! Fan-out is driven by an explicit stack of frames instead of recursion, so
//! long event chains do not grow the async call stack. Frames are pushed in
//! reverse so that siblings pop in publish order and every event's sub-tree
//! completes before the next sibling starts.
//!
//! # Failure
//!
//! The first failing handler aborts the call. Its error is classified once
//! (see [`crate::error`]), nothing it published is dispatched, no partial
//! stream is returned and the unit of work is not flushed. Nothing is retried.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::builder()
//!     .with_handler::<PlaceOrder, _>(PlaceOrderHandler)
//!     .with_handler::<OrderPlaced, _>(ReserveStock)
//!     .with_filter(TracingFilter)
//!     .with_service(inventory)
//!     .build();
//!
//! let result = engine.execute_command(PlaceOrder { sku, quantity: 2 }, None).await?;
//! assert_eq!(result.handler_count, 2);
//! ```

use std::any::TypeId;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::config::EngineSettings;
use crate::context::{OperationContext, Principal, PrincipalProvider, Services, StaticPrincipal};
use crate::core::{short_type_name, Message, MessageEnvelope};
use crate::dispatch::{HandlerRegistry, HandlerResolver};
use crate::error::{translate, DispatchError, EngineError, FaultKind};
use crate::filter::{Filter, FilterPipeline, FilterTable, InvocationContext, Outcome};
use crate::handler::{into_any_handler, AnyMessageHandler, HandlerInvoker, MessageHandler, MessageHandlerContext};
use crate::operation::{Operation, OperationKind, OperationType};
use crate::query::{Query, QueryContext, QueryInvoker};
use crate::stream::{MessageHandlerResult, MessageStream};
use crate::unit_of_work::{UnitOfWork, UnitOfWorkMode};

// =============================================================================
// Engine
// =============================================================================

/// Routes commands, events and queries to their components.
///
/// Cheap to clone; clones share handlers, filters and services.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    resolver: Arc<dyn HandlerResolver>,
    pipeline: FilterPipeline,
    principals: Arc<dyn PrincipalProvider>,
    services: Arc<Services>,
    settings: EngineSettings,
}

/// One unit of pending work.
enum Frame {
    /// Resolve the handlers of a message and schedule them.
    Dispatch {
        message: MessageEnvelope,
        parent: OperationContext,
    },
    /// Run one handler for one message.
    Invoke {
        handler: Arc<dyn AnyMessageHandler>,
        message: MessageEnvelope,
        parent: OperationContext,
    },
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Execute a command with every handler registered for its type.
    pub async fn execute_command<C: Message>(
        &self,
        command: C,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerResult, DispatchError> {
        self.root_call(MessageEnvelope::command(command), None, token)
            .await
    }

    /// Execute a command with exactly this handler.
    ///
    /// Events it publishes are still dispatched to their registered handlers.
    pub async fn execute_command_with<C, H>(
        &self,
        handler: H,
        command: C,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerResult, DispatchError>
    where
        C: Message,
        H: MessageHandler<C>,
    {
        let handler = into_any_handler::<C, H>(handler);
        self.root_call(MessageEnvelope::command(command), Some(handler), token)
            .await
    }

    /// Handle an event with every handler registered for its type.
    pub async fn handle_event<E: Message>(
        &self,
        event: E,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerResult, DispatchError> {
        self.root_call(MessageEnvelope::event(event), None, token)
            .await
    }

    /// Handle an event with exactly this handler.
    pub async fn handle_event_with<E, H>(
        &self,
        handler: H,
        event: E,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerResult, DispatchError>
    where
        E: Message,
        H: MessageHandler<E>,
    {
        let handler = into_any_handler::<E, H>(handler);
        self.root_call(MessageEnvelope::event(event), Some(handler), token)
            .await
    }

    /// Run a query and return its response.
    pub async fn execute_query<Q: Query>(
        &self,
        query: &Q,
        request: Q::Request,
        token: Option<CancellationToken>,
    ) -> Result<Q::Response, DispatchError> {
        let span = info_span!("query", query = short_type_name(std::any::type_name::<Q>()));
        let ctx = self.root_context(
            Arc::new(UnitOfWork::disabled()),
            token.unwrap_or_else(CancellationToken::new),
        );
        self.run_query(&ctx, query, request).instrument(span).await
    }

    fn root_context(&self, unit_of_work: Arc<UnitOfWork>, token: CancellationToken) -> OperationContext {
        OperationContext::root(
            self.inner.principals.principal(),
            self.inner.services.clone(),
            unit_of_work,
            token,
        )
    }

    async fn root_call(
        &self,
        message: MessageEnvelope,
        explicit: Option<Arc<dyn AnyMessageHandler>>,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerResult, DispatchError> {
        let span = info_span!(
            "dispatch",
            message_type = message.short_type_name(),
            kind = %message.kind(),
            message_id = %message.id(),
        );

        async move {
            let unit_of_work = Arc::new(UnitOfWork::new(self.inner.settings.unit_of_work_mode));
            let ctx = self.root_context(
                unit_of_work.clone(),
                token.unwrap_or_else(CancellationToken::new),
            );

            let result = self.dispatch(&ctx, message, explicit).await?;

            if ctx.is_cancelled() {
                warn!("call cancelled before flush, unit of work discarded");
                return Err(DispatchError::new(
                    FaultKind::GatewayTimeout,
                    "operation was cancelled before the unit of work was flushed",
                ));
            }

            let summary = unit_of_work.flush().await.map_err(|e| {
                error!(error = %e, "unit of work flush failed");
                DispatchError::from_flush(e, ctx.stack_trace())
            })?;

            debug!(
                handlers = result.handler_count,
                events = result.output.len(),
                groups = summary.groups,
                flushed = summary.flushed,
                "call completed"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Dispatch a message and every event its handlers publish, depth-first.
    ///
    /// Runs under `parent`: a root context for external calls, a handler's
    /// context for nested dispatch. Never flushes.
    pub(crate) fn dispatch<'a>(
        &'a self,
        parent: &'a OperationContext,
        message: MessageEnvelope,
        explicit: Option<Arc<dyn AnyMessageHandler>>,
    ) -> BoxFuture<'a, Result<MessageHandlerResult, DispatchError>> {
        async move {
            let first = match explicit {
                Some(handler) => Frame::Invoke {
                    handler,
                    message,
                    parent: parent.clone(),
                },
                None => Frame::Dispatch {
                    message,
                    parent: parent.clone(),
                },
            };

            let mut pending = vec![first];
            let mut output = MessageStream::empty();
            let mut handler_count = 0;

            while let Some(frame) = pending.pop() {
                match frame {
                    Frame::Dispatch { message, parent } => {
                        let handlers = self.inner.resolver.resolve(&message, &parent);
                        if handlers.is_empty() {
                            if message.kind().is_command() {
                                warn!(message_type = message.short_type_name(), "no handlers registered for command");
                            } else {
                                debug!(message_type = message.short_type_name(), "no handlers registered");
                            }
                            continue;
                        }
                        pending.extend(handlers.into_iter().rev().map(|handler| Frame::Invoke {
                            handler,
                            message: message.clone(),
                            parent: parent.clone(),
                        }));
                    }
                    Frame::Invoke {
                        handler,
                        message,
                        parent,
                    } => {
                        let (published, ctx) = self.invoke_handler(&handler, message, &parent).await?;
                        handler_count += 1;
                        output = output.concat(&published);

                        let children: Vec<Frame> = published
                            .iter()
                            .map(|event| Frame::Dispatch {
                                message: event.clone(),
                                parent: ctx.clone(),
                            })
                            .collect();
                        pending.extend(children.into_iter().rev());
                    }
                }
            }

            Ok(MessageHandlerResult::new(output, handler_count))
        }
        .boxed()
    }

    /// Run one handler through its filter chain.
    ///
    /// Returns the events it published and the context its children run under.
    async fn invoke_handler(
        &self,
        handler: &Arc<dyn AnyMessageHandler>,
        message: MessageEnvelope,
        parent: &OperationContext,
    ) -> Result<(MessageStream, OperationContext), DispatchError> {
        let operation = Operation::new(
            OperationType::MessageHandler,
            position(parent),
            message,
            handler.component(),
            parent.token().clone(),
        );
        let ctx = parent.push(operation.clone());

        if ctx.is_cancelled() {
            debug!(%operation, "cancelled before invocation");
            return Err(DispatchError::cancelled(&operation, ctx.stack_trace()));
        }

        let invocation = Arc::new(InvocationContext::new(operation.clone(), ctx.clone()));
        let handler_ctx = MessageHandlerContext::new(invocation.clone(), self.clone());
        let invoker = HandlerInvoker {
            handler: handler.as_ref(),
            ctx: &handler_ctx,
        };

        // AssertUnwindSafe is required because the handler and its context are not UnwindSafe
        let result = AssertUnwindSafe(self.inner.pipeline.run(handler.component_id(), &invocation, &invoker))
            .catch_unwind()
            .await;
        let result = match result {
            Ok(inner) => inner,
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(%operation, panic = %panic_msg, "handler panicked");
                Err(anyhow!("handler panicked: {}", panic_msg))
            }
        };

        if ctx.is_cancelled() {
            debug!(%operation, "cancelled during invocation");
            return Err(DispatchError::cancelled(&operation, ctx.stack_trace()));
        }

        match result {
            Ok(_) => {
                let published = handler_ctx.take_published();
                debug!(%operation, published = published.len(), "handler completed");
                Ok((published, ctx))
            }
            Err(e) => Err(classify_failure(e, &operation, &ctx)),
        }
    }

    /// Run a query under `parent`. Root when `parent` is a fresh root context.
    pub(crate) async fn run_query<Q: Query>(
        &self,
        parent: &OperationContext,
        query: &Q,
        request: Q::Request,
    ) -> Result<Q::Response, DispatchError> {
        let operation = Operation::new(
            OperationType::Query,
            position(parent),
            MessageEnvelope::request(request.clone()),
            std::any::type_name::<Q>(),
            parent.token().clone(),
        );
        let ctx = parent.push(operation.clone());

        if ctx.is_cancelled() {
            debug!(%operation, "cancelled before query");
            return Err(DispatchError::cancelled(&operation, ctx.stack_trace()));
        }

        let invocation = Arc::new(InvocationContext::new(operation.clone(), ctx.clone()));
        let query_ctx = QueryContext::new(invocation.clone(), self.clone());
        let invoker = QueryInvoker {
            query,
            request: &request,
            ctx: &query_ctx,
        };

        let result = AssertUnwindSafe(self.inner.pipeline.run(TypeId::of::<Q>(), &invocation, &invoker))
            .catch_unwind()
            .await;
        let result = match result {
            Ok(inner) => inner,
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(%operation, panic = %panic_msg, "query panicked");
                Err(anyhow!("query panicked: {}", panic_msg))
            }
        };

        // Checked even when the query failed: cancellation wins.
        if ctx.is_cancelled() {
            debug!(%operation, "cancelled during query");
            return Err(DispatchError::cancelled(&operation, ctx.stack_trace()));
        }

        let response = result
            .and_then(|outcome| match outcome {
                Outcome::Response(envelope) => envelope
                    .downcast_ref::<Q::Response>()
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::ResponseTypeMismatch {
                            query: std::any::type_name::<Q>(),
                            expected: std::any::type_name::<Q::Response>(),
                            actual: envelope.type_name(),
                        }
                        .into()
                    }),
                Outcome::Handled => Err(EngineError::MissingResponse {
                    query: std::any::type_name::<Q>(),
                }
                .into()),
            })
            .map_err(|e| classify_failure(e, &operation, &ctx))?;

        debug!(%operation, "query completed");
        Ok(response)
    }

    #[cfg(test)]
    pub(crate) fn cached_filter_chains(&self) -> usize {
        self.inner.pipeline.cached_chains()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.inner.settings)
            .field("services", &self.inner.services)
            .finish_non_exhaustive()
    }
}

/// Only the outermost frame of an external call is a root.
fn position(parent: &OperationContext) -> OperationKind {
    if parent.stack_trace().is_empty() {
        OperationKind::Root
    } else {
        OperationKind::Branch
    }
}

fn classify_failure(error: anyhow::Error, operation: &Operation, ctx: &OperationContext) -> DispatchError {
    let passthrough = error.is::<DispatchError>();
    let err = translate(error, operation, ctx.stack_trace());
    if passthrough {
        debug!(%operation, kind = %err.kind(), "nested failure propagated");
    } else if err.kind().is_client_fault() {
        warn!(%operation, error = %err, "rejected");
    } else {
        error!(%operation, kind = %err.kind(), error = %err, "failed");
    }
    err
}

/// Extract a message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for constructing an [`Engine`] with handlers, filters and services.
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_settings(EngineSettings::from_env()?)
///     .with_handler::<PlaceOrder, _>(PlaceOrderHandler)
///     .with_filter(TracingFilter)
///     .with_component_filter::<PlaceOrderHandler, _>(RequireAuthenticated)
///     .with_method_filter::<AuditHandler, OrderPlaced, _>(SampleOnly(10))
///     .with_principal(Principal::authenticated("svc-orders"))
///     .with_service(OrderRepository::new(pool))
///     .build();
/// ```
pub struct EngineBuilder {
    registry: HandlerRegistry,
    resolver: Option<Arc<dyn HandlerResolver>>,
    filters: FilterTable,
    principals: Arc<dyn PrincipalProvider>,
    services: Services,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            resolver: None,
            filters: FilterTable::new(),
            principals: Arc::new(StaticPrincipal::default()),
            services: Services::new(),
            settings: EngineSettings::default(),
        }
    }

    /// Register a handler for message type `M`.
    ///
    /// Handlers for the same type run in registration order.
    pub fn with_handler<M, H>(mut self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.registry.register::<M, H>(handler);
        self
    }

    /// Use a prebuilt handler table.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Resolve handlers through a custom resolver instead of the built-in table.
    ///
    /// Handlers registered with [`with_handler`](Self::with_handler) are ignored.
    pub fn with_resolver(mut self, resolver: Arc<dyn HandlerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Register a filter that wraps every invocation.
    ///
    /// The first registered global filter of a stage is the outermost.
    pub fn with_filter<F: Filter>(mut self, filter: F) -> Self {
        self.filters.add_global(Arc::new(filter));
        self
    }

    /// Register a filter for one handler or query type.
    pub fn with_component_filter<C: 'static, F: Filter>(mut self, filter: F) -> Self {
        self.filters.add_component(TypeId::of::<C>(), Arc::new(filter));
        self
    }

    /// Register a filter for one handler type handling one message type.
    ///
    /// For queries, `M` is the query's request type.
    pub fn with_method_filter<C: 'static, M: Message, F: Filter>(mut self, filter: F) -> Self {
        self.filters
            .add_method(TypeId::of::<C>(), TypeId::of::<M>(), Arc::new(filter));
        self
    }

    pub fn with_principal_provider<P: PrincipalProvider>(mut self, provider: P) -> Self {
        self.principals = Arc::new(provider);
        self
    }

    /// Attach the same principal to every call.
    pub fn with_principal(self, principal: Principal) -> Self {
        self.with_principal_provider(StaticPrincipal(principal))
    }

    /// Register a service, replacing any previous one of the same type.
    pub fn with_service<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.services.insert(service);
        self
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_unit_of_work_mode(mut self, mode: UnitOfWorkMode) -> Self {
        self.settings.unit_of_work_mode = mode;
        self
    }

    pub fn build(self) -> Engine {
        let resolver: Arc<dyn HandlerResolver> = match self.resolver {
            Some(resolver) => {
                if !self.registry.is_empty() {
                    warn!(
                        ignored = self.registry.len(),
                        "custom resolver configured, registered handlers are ignored"
                    );
                }
                resolver
            }
            None => Arc::new(self.registry),
        };

        Engine {
            inner: Arc::new(EngineInner {
                resolver,
                pipeline: FilterPipeline::new(self.filters),
                principals: self.principals,
                services: Arc::new(self.services),
                settings: self.settings,
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
