//! Operations: a single handler or query invocation and its position in the call tree.

use std::fmt;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{short_type_name, MessageEnvelope};

/// What kind of component an operation invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// A message handler invoked for a command or event.
    MessageHandler,
    /// A side-effect-free query.
    Query,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::MessageHandler => write!(f, "handler"),
            OperationType::Query => write!(f, "query"),
        }
    }
}

/// Position of an operation in the call tree.
///
/// Only the outermost frame of an external call is `Root`. Everything the
/// engine dispatches on behalf of another operation is a `Branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Root,
    Branch,
}

impl OperationKind {
    pub fn is_root(&self) -> bool {
        matches!(self, OperationKind::Root)
    }
}

/// A single handler or query invocation.
///
/// Operations are created per invocation, pushed onto the
/// [`StackTrace`](crate::StackTrace) and never mutated afterwards.
#[derive(Clone)]
pub struct Operation {
    id: Uuid,
    operation_type: OperationType,
    kind: OperationKind,
    message: MessageEnvelope,
    component: &'static str,
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Operation {
    pub(crate) fn new(
        operation_type: OperationType,
        kind: OperationKind,
        message: MessageEnvelope,
        component: &'static str,
        token: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type,
            kind,
            message,
            component,
            token,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The message handled by this operation (the request, for queries).
    pub fn message(&self) -> &MessageEnvelope {
        &self.message
    }

    /// Type name of the handler or query being invoked.
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// The cancellation token this operation observes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation_type {
            OperationType::MessageHandler => write!(
                f,
                "{}({}) [{} {}]",
                short_type_name(self.component),
                self.message.short_type_name(),
                self.message.kind(),
                if self.kind.is_root() { "root" } else { "branch" },
            ),
            OperationType::Query => write!(
                f,
                "{}({}) [query {}]",
                short_type_name(self.component),
                self.message.short_type_name(),
                if self.kind.is_root() { "root" } else { "branch" },
            ),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("operation_type", &self.operation_type)
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}
