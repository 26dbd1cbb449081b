//! Operation context: the immutable call tree of an in-flight request.
//!
//! # Persistence
//!
//! [`StackTrace`] is a cons list. Pushing a frame returns a new trace that
//! shares its parent; the parent is never touched. A caller that holds an
//! ancestor context keeps seeing the call path as of its own frame, no matter
//! how deep the dispatch below it goes.
//!
//! ```text
//! root ── PlaceOrderHandler(PlaceOrder)
//!             ├── ReserveStock(OrderPlaced)      <- sees 2 frames
//!             │       └── Notify(StockReserved)  <- sees 3 frames
//!             └── Invoice(OrderPlaced)           <- sees 2 frames
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::operation::Operation;
use crate::unit_of_work::UnitOfWork;

// =============================================================================
// Stack Trace
// =============================================================================

struct Frame {
    operation: Operation,
    parent: StackTrace,
    depth: usize,
}

/// Immutable, append-only chain of the operations currently in flight.
#[derive(Clone, Default)]
pub struct StackTrace {
    top: Option<Arc<Frame>>,
}

impl StackTrace {
    /// An empty trace (no operation in flight).
    pub fn empty() -> Self {
        Self { top: None }
    }

    /// Return a new trace with `operation` on top. `self` is unchanged.
    pub fn push(&self, operation: Operation) -> Self {
        Self {
            top: Some(Arc::new(Frame {
                operation,
                parent: self.clone(),
                depth: self.len() + 1,
            })),
        }
    }

    /// The operation on top of the stack.
    pub fn current(&self) -> Option<&Operation> {
        self.top.as_ref().map(|frame| &frame.operation)
    }

    /// The outermost operation of the call.
    pub fn root(&self) -> Option<&Operation> {
        self.iter_from_current().last()
    }

    /// The trace without its top frame.
    pub fn parent(&self) -> Option<&StackTrace> {
        self.top.as_ref().map(|frame| &frame.parent)
    }

    pub fn len(&self) -> usize {
        self.top.as_ref().map_or(0, |frame| frame.depth)
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    /// Iterate from the current operation down to the root.
    pub fn iter_from_current(&self) -> impl Iterator<Item = &Operation> {
        let mut next = self.top.as_deref();
        std::iter::from_fn(move || {
            let frame = next?;
            next = frame.parent.top.as_deref();
            Some(&frame.operation)
        })
    }

    /// Iterate from the root to the current operation.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Operation> {
        let mut frames: Vec<&Operation> = self.iter_from_current().collect();
        frames.reverse();
        frames.into_iter()
    }
}

// Unlink uniquely owned frames one at a time so that dropping a very deep
// trace does not recurse once per frame.
impl Drop for StackTrace {
    fn drop(&mut self) {
        let mut next = self.top.take();
        while let Some(frame) = next {
            match Arc::try_unwrap(frame) {
                Ok(mut frame) => next = frame.parent.top.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        for (i, operation) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{operation}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// =============================================================================
// Principal
// =============================================================================

/// A single claim about the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Claim {
    pub kind: String,
    pub value: String,
}

/// Security context of the caller.
///
/// The engine never interprets claims. It only carries them so that filters
/// and handlers can.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Principal {
    pub identity: Option<String>,
    pub claims: Vec<Claim>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            claims: Vec::new(),
        }
    }

    pub fn with_claim(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.push(Claim {
            kind: kind.into(),
            value: value.into(),
        });
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn has_claim(&self, kind: &str, value: &str) -> bool {
        self.claims
            .iter()
            .any(|claim| claim.kind == kind && claim.value == value)
    }

    /// All values of the given claim kind.
    pub fn claim_values<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.claims
            .iter()
            .filter(move |claim| claim.kind == kind)
            .map(|claim| claim.value.as_str())
    }
}

/// Supplies the principal attached to each root call.
pub trait PrincipalProvider: Send + Sync + 'static {
    fn principal(&self) -> Principal;
}

/// A provider that always returns the same principal.
#[derive(Debug, Clone, Default)]
pub struct StaticPrincipal(pub Principal);

impl PrincipalProvider for StaticPrincipal {
    fn principal(&self) -> Principal {
        self.0.clone()
    }
}

// =============================================================================
// Services
// =============================================================================

/// Read-only, typed service scope shared by every operation of an engine.
///
/// Built once at startup; handlers look dependencies up by type.
#[derive(Default, Clone)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(service));
    }

    pub fn with<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("count", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Operation Context
// =============================================================================

/// The in-flight call tree of one external call.
///
/// Cheap to clone. Child contexts created by [`push`](Self::push) share the
/// principal, services, token and unit of work of their parent.
#[derive(Clone)]
pub struct OperationContext {
    stack_trace: StackTrace,
    principal: Arc<Principal>,
    services: Arc<Services>,
    unit_of_work: Arc<UnitOfWork>,
    token: CancellationToken,
}

impl OperationContext {
    /// Create the context for a new external call.
    pub fn root(
        principal: Principal,
        services: Arc<Services>,
        unit_of_work: Arc<UnitOfWork>,
        token: CancellationToken,
    ) -> Self {
        Self {
            stack_trace: StackTrace::empty(),
            principal: Arc::new(principal),
            services,
            unit_of_work,
            token,
        }
    }

    /// Return a child context with `operation` on top of the stack trace.
    pub fn push(&self, operation: Operation) -> Self {
        Self {
            stack_trace: self.stack_trace.push(operation),
            ..self.clone()
        }
    }

    pub fn stack_trace(&self) -> &StackTrace {
        &self.stack_trace
    }

    /// The operation currently executing, if any.
    pub fn operation(&self) -> Option<&Operation> {
        self.stack_trace.current()
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.unit_of_work
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("stack_trace", &self.stack_trace)
            .field("principal", &self.principal.identity)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageEnvelope;
    use crate::operation::{OperationKind, OperationType};
    use crate::unit_of_work::UnitOfWorkMode;

    #[derive(Debug, Clone)]
    struct OrderPlaced;

    fn op(kind: OperationKind, component: &'static str) -> Operation {
        Operation::new(
            OperationType::MessageHandler,
            kind,
            MessageEnvelope::event(OrderPlaced),
            component,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_push_does_not_mutate_parent() {
        let empty = StackTrace::empty();
        let root = empty.push(op(OperationKind::Root, "Root"));
        let left = root.push(op(OperationKind::Branch, "Left"));
        let right = root.push(op(OperationKind::Branch, "Right"));

        assert!(empty.is_empty());
        assert_eq!(root.len(), 1);
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 2);
        assert_eq!(left.current().unwrap().component(), "Left");
        assert_eq!(right.current().unwrap().component(), "Right");
        assert_eq!(root.current().unwrap().component(), "Root");
    }

    #[test]
    fn test_iter_runs_root_to_current() {
        let trace = StackTrace::empty()
            .push(op(OperationKind::Root, "A"))
            .push(op(OperationKind::Branch, "B"))
            .push(op(OperationKind::Branch, "C"));

        let names: Vec<_> = trace.iter().map(|op| op.component()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);

        let names: Vec<_> = trace.iter_from_current().map(|op| op.component()).collect();
        assert_eq!(names, vec!["C", "B", "A"]);

        assert_eq!(trace.root().unwrap().component(), "A");
        assert_eq!(trace.parent().unwrap().len(), 2);
    }

    #[test]
    fn test_display_renders_call_path() {
        let trace = StackTrace::empty()
            .push(op(OperationKind::Root, "A"))
            .push(op(OperationKind::Branch, "B"));

        assert_eq!(
            trace.to_string(),
            "A(OrderPlaced) [event root] -> B(OrderPlaced) [event branch]"
        );
        assert_eq!(StackTrace::empty().to_string(), "<empty>");
    }

    #[test]
    fn test_deep_trace_does_not_overflow() {
        let mut trace = StackTrace::empty().push(op(OperationKind::Root, "Root"));
        for _ in 0..10_000 {
            trace = trace.push(op(OperationKind::Branch, "Deep"));
        }
        assert_eq!(trace.len(), 10_001);
        assert_eq!(trace.iter().count(), 10_001);
    }

    #[test]
    fn test_principal_claims() {
        let principal = Principal::authenticated("alice")
            .with_claim("role", "admin")
            .with_claim("role", "ops");

        assert!(principal.is_authenticated());
        assert!(principal.has_claim("role", "admin"));
        assert!(!principal.has_claim("role", "billing"));
        assert_eq!(
            principal.claim_values("role").collect::<Vec<_>>(),
            vec!["admin", "ops"]
        );
        assert!(!Principal::anonymous().is_authenticated());
    }

    #[test]
    fn test_services_lookup_by_type() {
        #[derive(Debug, PartialEq)]
        struct Clock(u64);

        let services = Services::new().with(Clock(7)).with(String::from("db"));

        assert_eq!(services.len(), 2);
        assert_eq!(*services.get::<Clock>().unwrap(), Clock(7));
        assert_eq!(services.get::<String>().unwrap().as_str(), "db");
        assert!(services.get::<u32>().is_none());
    }

    #[test]
    fn test_context_push_shares_unit_of_work() {
        let uow = Arc::new(UnitOfWork::new(UnitOfWorkMode::Concurrent));
        let root = OperationContext::root(
            Principal::anonymous(),
            Arc::new(Services::new()),
            uow.clone(),
            CancellationToken::new(),
        );
        let child = root.push(op(OperationKind::Root, "A"));

        assert!(root.operation().is_none());
        assert_eq!(child.operation().unwrap().component(), "A");
        assert!(Arc::ptr_eq(child.unit_of_work(), &uow));
    }
}
