//! Fault taxonomy: how handler failures reach the caller.
//!
//! Handler and query bodies return `anyhow::Result`, exactly like any other
//! async code. When a body fails, the engine classifies the error **once**, at
//! the invocation boundary where the operation's position (root/branch) and
//! message kind (command/event/query) are known. The result is a
//! [`DispatchError`] tagged with a [`FaultKind`]; from then on the tag travels
//! with the error and enclosing frames pass it through untouched.
//!
//! # Translation Rules
//!
//! | Raised by user code            | Root command / root query | Event, nested command, nested query |
//! |--------------------------------|---------------------------|-------------------------------------|
//! | `HandlerError::BusinessRule`   | `BadRequest`              | `InternalServerError`               |
//! | `HandlerError::BadRequest`     | `BadRequest`              | `InternalServerError`               |
//! | `HandlerError::InternalServerError` | `InternalServerError` | `InternalServerError`            |
//! | `HandlerError::Cancelled`, own token cancelled | `GatewayTimeout` | `GatewayTimeout`            |
//! | `HandlerError::Cancelled`, own token live      | `InternalServerError` | `InternalServerError`  |
//! | anything else                  | `InternalServerError`     | `InternalServerError`               |
//! | `DispatchError`                | unchanged                 | unchanged                           |
//!
//! # Example
//!
//! ```ignore
//! use switchyard::{FaultKind, HandlerError};
//!
//! #[async_trait]
//! impl MessageHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, cmd: PlaceOrder, ctx: &MessageHandlerContext) -> Result<()> {
//!         if cmd.quantity == 0 {
//!             return Err(HandlerError::business_rule("quantity must be positive").into());
//!         }
//!         ctx.publish(OrderPlaced { id: cmd.id });
//!         Ok(())
//!     }
//! }
//!
//! match engine.execute_command(PlaceOrder { id, quantity: 0 }, None).await {
//!     Err(e) if e.kind() == FaultKind::BadRequest => { /* tell the caller to fix the request */ }
//!     Err(e) if e.kind() == FaultKind::GatewayTimeout => { /* caller gave up */ }
//!     Err(e) => { /* retry later */ }
//!     Ok(result) => { /* result.output, result.handler_count */ }
//! }
//! ```

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::context::StackTrace;
use crate::operation::{Operation, OperationType};
use crate::unit_of_work::FlushError;

// =============================================================================
// Fault Kind
// =============================================================================

/// Outcome category of a failed call.
///
/// # Caller Guidance
///
/// - `BadRequest`: the caller is at fault and should fix the request
/// - `InternalServerError`: the server is at fault; retrying later may help
/// - `GatewayTimeout`: the caller cancelled; treat the call as abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Client fault: malformed command or explicit business-rule rejection.
    BadRequest,
    /// Server fault: infrastructure failure or a failure while handling an event.
    InternalServerError,
    /// The operation was cancelled through the caller's own token.
    GatewayTimeout,
}

impl FaultKind {
    /// HTTP status code a hosting layer should map this fault to.
    pub fn status_code(&self) -> u16 {
        match self {
            FaultKind::BadRequest => 400,
            FaultKind::InternalServerError => 500,
            FaultKind::GatewayTimeout => 504,
        }
    }

    pub fn is_client_fault(&self) -> bool {
        matches!(self, FaultKind::BadRequest)
    }

    pub fn is_server_fault(&self) -> bool {
        matches!(self, FaultKind::InternalServerError)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FaultKind::GatewayTimeout)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::BadRequest => write!(f, "bad_request"),
            FaultKind::InternalServerError => write!(f, "internal_server_error"),
            FaultKind::GatewayTimeout => write!(f, "gateway_timeout"),
        }
    }
}

// =============================================================================
// Handler Error
// =============================================================================

/// Errors that handler and query code raise on purpose.
///
/// Return them through `anyhow` (`Err(HandlerError::business_rule(..).into())`
/// or `anyhow::bail!`-style with `?`). Their final [`FaultKind`] depends on
/// where they are raised; see the module docs.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A domain rule rejected the message.
    #[error("{message}")]
    BusinessRule { message: String },

    /// The message itself is malformed.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// The handler hit a failure the caller cannot fix.
    #[error("internal server error: {message}")]
    InternalServerError { message: String },

    /// The handler observed a cancellation.
    #[error("operation was cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn business_rule(message: impl Into<String>) -> Self {
        HandlerError::BusinessRule {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        HandlerError::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::InternalServerError {
            message: message.into(),
        }
    }
}

// =============================================================================
// Engine Error
// =============================================================================

/// Failures of the engine itself (as opposed to handler code).
///
/// These always surface as `InternalServerError`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A handler was invoked with a message of the wrong type (internal error).
    #[error("message type mismatch: {component} expects {expected}, got {actual}")]
    MessageTypeMismatch {
        component: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// A filter short-circuited a query without supplying a response.
    #[error("query {query} completed without a response")]
    MissingResponse { query: &'static str },

    /// A filter supplied a response of the wrong type.
    #[error("response type mismatch for {query}: expected {expected}, got {actual}")]
    ResponseTypeMismatch {
        query: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
}

// =============================================================================
// Dispatch Error
// =============================================================================

/// The single error type callers of the engine receive.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    kind: FaultKind,
    message: String,
    stack_trace: String,
    #[source]
    cause: Option<anyhow::Error>,
}

impl DispatchError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack_trace: String::new(),
            cause: None,
        }
    }

    fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    fn with_stack_trace(mut self, trace: &StackTrace) -> Self {
        self.stack_trace = trace.to_string();
        self
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Full error message. May contain internal details.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message safe to return to a client.
    ///
    /// Only client faults expose their details; everything else is generic.
    pub fn safe_message(&self) -> Cow<'_, str> {
        match self.kind {
            FaultKind::BadRequest => Cow::Borrowed(&self.message),
            FaultKind::InternalServerError => "An internal error occurred".into(),
            FaultKind::GatewayTimeout => "Operation timed out".into(),
        }
    }

    /// The call path that was active when the error was classified.
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    /// The original error raised by user code, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// The original error, if it was a [`HandlerError`].
    pub fn handler_error(&self) -> Option<&HandlerError> {
        self.cause.as_ref()?.downcast_ref::<HandlerError>()
    }

    pub(crate) fn cancelled(operation: &Operation, trace: &StackTrace) -> Self {
        translate(HandlerError::Cancelled.into(), operation, trace)
    }

    pub(crate) fn from_flush(error: FlushError, trace: &StackTrace) -> Self {
        DispatchError::new(FaultKind::InternalServerError, error.to_string())
            .with_stack_trace(trace)
            .with_cause(error.into())
    }
}

// =============================================================================
// Translation
// =============================================================================

/// Classify an error raised by the operation on top of `trace`.
///
/// Errors that are already a [`DispatchError`] were classified by a nested
/// operation and pass through unchanged.
pub(crate) fn translate(error: anyhow::Error, operation: &Operation, trace: &StackTrace) -> DispatchError {
    let error = match error.downcast::<DispatchError>() {
        Ok(classified) => return classified,
        Err(error) => error,
    };

    let kind = classify(&error, operation);
    DispatchError::new(kind, error.to_string())
        .with_stack_trace(trace)
        .with_cause(error)
}

fn classify(error: &anyhow::Error, operation: &Operation) -> FaultKind {
    match error.downcast_ref::<HandlerError>() {
        Some(HandlerError::BusinessRule { .. }) | Some(HandlerError::BadRequest { .. })
            if is_client_boundary(operation) =>
        {
            FaultKind::BadRequest
        }
        Some(HandlerError::Cancelled) if operation.token().is_cancelled() => FaultKind::GatewayTimeout,
        _ => FaultKind::InternalServerError,
    }
}

/// Whether a client fault raised here is attributable to the external caller.
///
/// Only root commands and root queries carry the caller's own message. Events
/// are facts the caller never sent, and nested operations are the server's
/// own doing.
fn is_client_boundary(operation: &Operation) -> bool {
    if !operation.kind().is_root() {
        return false;
    }
    match operation.operation_type() {
        OperationType::MessageHandler => operation.message().kind().is_command(),
        OperationType::Query => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageEnvelope;
    use crate::operation::OperationKind;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone)]
    struct PlaceOrder;

    fn handler_op(envelope: MessageEnvelope, kind: OperationKind, token: CancellationToken) -> Operation {
        Operation::new(OperationType::MessageHandler, kind, envelope, "PlaceOrderHandler", token)
    }

    fn query_op(kind: OperationKind) -> Operation {
        Operation::new(
            OperationType::Query,
            kind,
            MessageEnvelope::request(()),
            "OrderQuery",
            CancellationToken::new(),
        )
    }

    fn translate_with(error: HandlerError, op: &Operation) -> DispatchError {
        let trace = StackTrace::empty().push(op.clone());
        translate(error.into(), op, &trace)
    }

    #[test]
    fn test_business_rule_in_root_command_is_bad_request() {
        let op = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Root, CancellationToken::new());
        let err = translate_with(HandlerError::business_rule("out of stock"), &op);

        assert_eq!(err.kind(), FaultKind::BadRequest);
        assert_eq!(err.message(), "out of stock");
        assert_eq!(err.safe_message(), "out of stock");
        assert!(matches!(err.handler_error(), Some(HandlerError::BusinessRule { .. })));
    }

    #[test]
    fn test_business_rule_in_event_is_internal() {
        for kind in [OperationKind::Root, OperationKind::Branch] {
            let op = handler_op(MessageEnvelope::event(PlaceOrder), kind, CancellationToken::new());
            let err = translate_with(HandlerError::business_rule("out of stock"), &op);

            assert_eq!(err.kind(), FaultKind::InternalServerError);
            assert_eq!(err.safe_message(), "An internal error occurred");
        }
    }

    #[test]
    fn test_bad_request_in_root_event_is_promoted() {
        let op = handler_op(MessageEnvelope::event(PlaceOrder), OperationKind::Root, CancellationToken::new());
        let err = translate_with(HandlerError::bad_request("missing field"), &op);

        assert_eq!(err.kind(), FaultKind::InternalServerError);
    }

    #[test]
    fn test_nested_command_is_never_client_fault() {
        let op = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Branch, CancellationToken::new());
        let err = translate_with(HandlerError::bad_request("missing field"), &op);

        assert_eq!(err.kind(), FaultKind::InternalServerError);
    }

    #[test]
    fn test_explicit_internal_error_stays_internal() {
        let op = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Root, CancellationToken::new());
        let err = translate_with(HandlerError::internal("db down"), &op);

        assert_eq!(err.kind(), FaultKind::InternalServerError);
    }

    #[test]
    fn test_cancellation_with_own_token_is_timeout() {
        let token = CancellationToken::new();
        token.cancel();
        let op = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Root, token);
        let err = translate_with(HandlerError::Cancelled, &op);

        assert_eq!(err.kind(), FaultKind::GatewayTimeout);
        assert_eq!(err.kind().status_code(), 504);
        assert_eq!(err.safe_message(), "Operation timed out");
    }

    #[test]
    fn test_cancellation_with_other_token_is_internal() {
        let op = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Root, CancellationToken::new());
        let err = translate_with(HandlerError::Cancelled, &op);

        assert_eq!(err.kind(), FaultKind::InternalServerError);
    }

    #[test]
    fn test_cause_keeps_original_error_type() {
        let err = DispatchError::new(FaultKind::BadRequest, "rejected")
            .with_cause(HandlerError::business_rule("order limit exceeded").into());

        assert!(matches!(
            err.handler_error(),
            Some(HandlerError::BusinessRule { message }) if message == "order limit exceeded"
        ));
        assert!(err.cause().unwrap().downcast_ref::<HandlerError>().is_some());
        assert_eq!(
            StdError::source(&err).map(|e| e.to_string()).as_deref(),
            Some("order limit exceeded")
        );
    }

    #[test]
    fn test_unknown_error_is_internal_and_keeps_cause() {
        let op = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Root, CancellationToken::new());
        let trace = StackTrace::empty().push(op.clone());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = translate(io.into(), &op, &trace);

        assert_eq!(err.kind(), FaultKind::InternalServerError);
        assert!(err.cause().unwrap().downcast_ref::<std::io::Error>().is_some());
        assert!(err.stack_trace().contains("PlaceOrderHandler(PlaceOrder)"));
    }

    #[test]
    fn test_classified_error_passes_through() {
        let root = handler_op(MessageEnvelope::command(PlaceOrder), OperationKind::Root, CancellationToken::new());
        let inner = DispatchError::new(FaultKind::GatewayTimeout, "nested timeout");
        let trace = StackTrace::empty().push(root.clone());

        let err = translate(inner.into(), &root, &trace);
        assert_eq!(err.kind(), FaultKind::GatewayTimeout);
        assert_eq!(err.message(), "nested timeout");
    }

    #[test]
    fn test_query_root_vs_branch() {
        let root = translate_with(HandlerError::business_rule("no such order"), &query_op(OperationKind::Root));
        let branch = translate_with(HandlerError::business_rule("no such order"), &query_op(OperationKind::Branch));

        assert_eq!(root.kind(), FaultKind::BadRequest);
        assert_eq!(branch.kind(), FaultKind::InternalServerError);
    }

    #[test]
    fn test_fault_kind_display() {
        assert_eq!(FaultKind::BadRequest.to_string(), "bad_request");
        assert_eq!(FaultKind::InternalServerError.status_code(), 500);
        assert!(FaultKind::BadRequest.is_client_fault());
        assert!(FaultKind::InternalServerError.is_server_fault());
        assert!(FaultKind::GatewayTimeout.is_timeout());

        let err = DispatchError::new(FaultKind::BadRequest, "nope");
        assert_eq!(err.to_string(), "bad_request: nope");
    }
}
