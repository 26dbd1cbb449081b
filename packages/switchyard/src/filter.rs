//! Filter pipeline: cross-cutting behavior wrapped around every invocation.
//!
//! A [`Filter`] sees each handler or query invocation before (and after) the
//! component does. It can observe the [`InvocationContext`], write to its
//! property bag, short-circuit by returning without calling [`Next::run`], or
//! call through and inspect the [`Outcome`].
//!
//! # Ordering
//!
//! Filters come from three sources, registered on the engine builder:
//!
//! 1. **Global** filters apply to every invocation.
//! 2. **Component** filters apply to one handler or query type.
//! 3. **Method** filters apply to one handler type for one message type.
//!
//! The chain is ordered by [`FilterStage`] first, then by source, then by
//! registration order. The first filter in the chain is the outermost:
//!
//! ```text
//! ExceptionHandling: global.. component.. method..
//! Authorization:     global.. component.. method..
//! Validation:        global.. component.. method..
//! Processing:        global.. component.. method..
//!                                                  └─► handler / query
//! ```
//!
//! The declared chain for a (component, message) pair is assembled once and
//! cached for the lifetime of the engine. [`Filter::is_enabled`] is still
//! asked on every invocation.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::{OperationContext, Principal, Services, StackTrace};
use crate::core::{Message, MessageEnvelope};
use crate::operation::Operation;

// =============================================================================
// Stage
// =============================================================================

/// Coarse position of a filter in the chain. Earlier stages wrap later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterStage {
    ExceptionHandling,
    Authorization,
    Validation,
    Processing,
}

impl FilterStage {
    /// Every stage, outermost first.
    pub const ALL: [FilterStage; 4] = [
        FilterStage::ExceptionHandling,
        FilterStage::Authorization,
        FilterStage::Validation,
        FilterStage::Processing,
    ];
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterStage::ExceptionHandling => write!(f, "exception_handling"),
            FilterStage::Authorization => write!(f, "authorization"),
            FilterStage::Validation => write!(f, "validation"),
            FilterStage::Processing => write!(f, "processing"),
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// What an invocation produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A message handler ran, or a filter decided it should not.
    Handled,
    /// A query response, either from the query itself or from a filter.
    Response(MessageEnvelope),
}

impl Outcome {
    /// Serve a query response from a filter.
    pub fn response<M: Message>(response: M) -> Self {
        Outcome::Response(MessageEnvelope::response(response))
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled)
    }

    pub fn as_response(&self) -> Option<&MessageEnvelope> {
        match self {
            Outcome::Response(envelope) => Some(envelope),
            Outcome::Handled => None,
        }
    }
}

// =============================================================================
// Invocation Context
// =============================================================================

/// Everything a filter can see about one invocation.
///
/// The property bag is shared between filters and the component they wrap:
/// a filter can stash a value that the handler or query reads back.
pub struct InvocationContext {
    operation: Operation,
    context: OperationContext,
    properties: Mutex<Map<String, Value>>,
}

impl InvocationContext {
    /// `context` must already have `operation` on top of its stack trace.
    pub(crate) fn new(operation: Operation, context: OperationContext) -> Self {
        Self {
            operation,
            context,
            properties: Mutex::new(Map::new()),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn message(&self) -> &MessageEnvelope {
        self.operation.message()
    }

    /// Type name of the handler or query being invoked.
    pub fn component(&self) -> &'static str {
        self.operation.component()
    }

    pub fn operation_context(&self) -> &OperationContext {
        &self.context
    }

    pub fn stack_trace(&self) -> &StackTrace {
        self.context.stack_trace()
    }

    pub fn principal(&self) -> &Principal {
        self.context.principal()
    }

    pub fn services(&self) -> &Services {
        self.context.services()
    }

    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.context.services().get::<T>()
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.token().is_cancelled()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn remove_property(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    /// Snapshot of every property set so far.
    pub fn properties(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.properties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("operation", &self.operation)
            .field("properties", &*self.lock())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Cross-cutting behavior around handler and query invocations.
///
/// # Example
///
/// ```ignore
/// struct RequireAuthenticated;
///
/// #[async_trait]
/// impl Filter for RequireAuthenticated {
///     fn stage(&self) -> FilterStage {
///         FilterStage::Authorization
///     }
///
///     async fn invoke(&self, ctx: &InvocationContext, next: Next<'_>) -> Result<Outcome> {
///         if !ctx.principal().is_authenticated() {
///             return Err(HandlerError::bad_request("authentication required").into());
///         }
///         next.run(ctx).await
///     }
/// }
/// ```
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    fn stage(&self) -> FilterStage {
        FilterStage::Processing
    }

    /// Skipped for this invocation when false.
    fn is_enabled(&self, _ctx: &InvocationContext) -> bool {
        true
    }

    async fn invoke(&self, ctx: &InvocationContext, next: Next<'_>) -> Result<Outcome>;
}

/// The component at the bottom of a chain.
#[async_trait]
pub(crate) trait Terminal: Send + Sync {
    async fn call(&self, ctx: &InvocationContext) -> Result<Outcome>;
}

/// The rest of the chain below the current filter.
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub(crate) fn new(filters: &'a [Arc<dyn Filter>], terminal: &'a dyn Terminal) -> Self {
        Self { filters, terminal }
    }

    /// Run the remaining filters and then the component.
    pub async fn run(mut self, ctx: &InvocationContext) -> Result<Outcome> {
        while let Some((filter, rest)) = self.filters.split_first() {
            self.filters = rest;
            if filter.is_enabled(ctx) {
                return filter.invoke(ctx, self).await;
            }
        }
        self.terminal.call(ctx).await
    }

    /// Number of declared filters still ahead, enabled or not.
    pub fn remaining(&self) -> usize {
        self.filters.len()
    }
}

// =============================================================================
// Registration Table
// =============================================================================

/// Startup-time filter declarations, keyed by component and message type.
#[derive(Default, Clone)]
pub struct FilterTable {
    global: Vec<Arc<dyn Filter>>,
    component: HashMap<TypeId, Vec<Arc<dyn Filter>>>,
    method: HashMap<(TypeId, TypeId), Vec<Arc<dyn Filter>>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(&mut self, filter: Arc<dyn Filter>) {
        self.global.push(filter);
    }

    pub fn add_component(&mut self, component: TypeId, filter: Arc<dyn Filter>) {
        self.component.entry(component).or_default().push(filter);
    }

    pub fn add_method(&mut self, component: TypeId, message: TypeId, filter: Arc<dyn Filter>) {
        self.method
            .entry((component, message))
            .or_default()
            .push(filter);
    }

    pub fn len(&self) -> usize {
        self.global.len()
            + self.component.values().map(Vec::len).sum::<usize>()
            + self.method.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ordered chain declared for one component handling one message type.
    fn declared(&self, component: TypeId, message: TypeId) -> Vec<Arc<dyn Filter>> {
        let none = Vec::new();
        let component_filters = self.component.get(&component).unwrap_or(&none);
        let method_filters = self.method.get(&(component, message)).unwrap_or(&none);

        let mut chain = Vec::new();
        for stage in FilterStage::ALL {
            for source in [&self.global, component_filters, method_filters] {
                chain.extend(source.iter().filter(|f| f.stage() == stage).cloned());
            }
        }
        chain
    }
}

impl fmt::Debug for FilterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterTable")
            .field("global", &self.global.len())
            .field("component", &self.component.len())
            .field("method", &self.method.len())
            .finish()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

type Chain = Arc<[Arc<dyn Filter>]>;

/// Runs invocations through their cached filter chains.
pub(crate) struct FilterPipeline {
    table: FilterTable,
    cache: DashMap<(TypeId, TypeId), Chain>,
}

impl FilterPipeline {
    pub(crate) fn new(table: FilterTable) -> Self {
        Self {
            table,
            cache: DashMap::new(),
        }
    }

    fn chain(&self, component: TypeId, message: TypeId) -> Chain {
        let key = (component, message);
        if let Some(chain) = self.cache.get(&key) {
            return chain.clone();
        }
        let chain: Chain = self.table.declared(component, message).into();
        self.cache.entry(key).or_insert(chain).clone()
    }

    pub(crate) async fn run(
        &self,
        component: TypeId,
        ctx: &InvocationContext,
        terminal: &dyn Terminal,
    ) -> Result<Outcome> {
        let chain = self.chain(component, ctx.message().type_id());
        Next::new(&chain, terminal).run(ctx).await
    }

    /// Number of (component, message) chains assembled so far.
    pub(crate) fn cached_chains(&self) -> usize {
        self.cache.len()
    }
}

// =============================================================================
// Built-in Filters
// =============================================================================

/// Logs every invocation with its outcome and duration.
///
/// Runs in the `ExceptionHandling` stage so it observes failures raised by
/// every other filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFilter;

#[async_trait]
impl Filter for TracingFilter {
    fn stage(&self) -> FilterStage {
        FilterStage::ExceptionHandling
    }

    async fn invoke(&self, ctx: &InvocationContext, next: Next<'_>) -> Result<Outcome> {
        let started = Instant::now();
        let operation = ctx.operation();
        debug!(%operation, depth = ctx.stack_trace().len(), "invocation started");

        let result = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(%operation, elapsed_ms, "invocation completed"),
            Err(e) => warn!(%operation, elapsed_ms, error = %e, "invocation failed"),
        }
        result
    }
}
