//! Core message types for the switchyard dispatch engine.
//!
//! # Overview
//!
//! Every value that flows through the engine is a [`Message`]. The role a
//! message plays is not part of its type; it is assigned at the call boundary:
//! - [`MessageKind::Command`] - intent submitted by a caller
//! - [`MessageKind::Event`] - a fact published while handling another message
//! - [`MessageKind::Request`] - the input of a query
//! - [`MessageKind::Response`] - the output of a query
//!
//! Messages are type-erased into a [`MessageEnvelope`] so that handler tables,
//! streams and stack traces can hold them without generics.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Any in-memory value that can be dispatched.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Clone + Debug + Send + Sync + 'static`. You don't need to implement it manually.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct PlaceOrder {
///     order_id: Uuid,
///     quantity: u32,
/// }
/// // Message is automatically implemented!
/// ```
pub trait Message: Any + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Any + Clone + fmt::Debug + Send + Sync + 'static> Message for T {}

/// The role a message plays in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A caller's request to change state. Failures are attributable to the caller.
    Command,
    /// Something that already happened, published by a handler.
    Event,
    /// The input of a query.
    Request,
    /// The output of a query.
    Response,
}

impl MessageKind {
    /// Returns true if this is a command.
    pub fn is_command(&self) -> bool {
        matches!(self, MessageKind::Command)
    }

    /// Returns true if this is an event.
    pub fn is_event(&self) -> bool {
        matches!(self, MessageKind::Event)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
        }
    }
}

/// Unique identity of a single message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message together with the role it plays in the current call.
///
/// Envelopes are immutable and cheap to clone: the payload is shared.
#[derive(Clone)]
pub struct MessageEnvelope {
    id: MessageId,
    kind: MessageKind,
    type_id: TypeId,
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl MessageEnvelope {
    /// Wrap a message with the given role.
    pub fn new<M: Message>(kind: MessageKind, message: M) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            payload: Arc::new(message),
        }
    }

    /// Wrap a command.
    pub fn command<M: Message>(message: M) -> Self {
        Self::new(MessageKind::Command, message)
    }

    /// Wrap an event.
    pub fn event<M: Message>(message: M) -> Self {
        Self::new(MessageKind::Event, message)
    }

    /// Wrap a query request.
    pub fn request<M: Message>(message: M) -> Self {
        Self::new(MessageKind::Request, message)
    }

    /// Wrap a query response.
    pub fn response<M: Message>(message: M) -> Self {
        Self::new(MessageKind::Response, message)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Runtime type of the payload. Handlers are resolved by this key.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Short type name without the module path, used in stack traces.
    pub fn short_type_name(&self) -> &'static str {
        short_type_name(self.type_name)
    }

    /// Downcast the payload to a concrete message type.
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.payload.downcast_ref()
    }

    /// Returns true if the payload is of type `M`.
    pub fn is<M: Any>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Strip the module path from a type name, keeping generic arguments intact.
pub(crate) fn short_type_name(name: &'static str) -> &'static str {
    let head = name.split('<').next().unwrap_or(name);
    match head.rfind("::") {
        Some(idx) => &name[idx + 2..],
        None => name,
    }
}
