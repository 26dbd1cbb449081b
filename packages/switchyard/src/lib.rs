//! # Switchyard
//!
//! An in-process CQRS dispatch engine: commands and events are routed to their
//! handlers, published events fan out depth-first, and every call commits its
//! side effects through one unit of work.
//!
//! ## Core Concepts
//!
//! Switchyard separates **intent** from **facts** and **questions**:
//! - Commands = Intent (the caller asks for something to happen)
//! - Events = Facts (a handler reports what happened)
//! - Queries = Questions (read-only, answered with a response)
//!
//! Any `Clone + Debug + Send + Sync + 'static` type is a [`Message`]. Whether
//! it travels as a command or an event is decided by how it is sent, and is
//! recorded on its [`MessageEnvelope`].
//!
//! ## Architecture
//!
//! ```text
//! Engine::execute_command(cmd)
//!     │
//!     ▼ new OperationContext + UnitOfWork
//! dispatch ◄──────────────────────────────────────┐
//!     │                                           │
//!     ├─► resolve handlers for the message type   │
//!     │                                           │
//!     └─► for each handler, in order:             │
//!             │                                   │
//!             ▼                                   │
//!         FilterPipeline (stage-ordered)          │
//!             │                                   │
//!             ▼                                   │
//!         MessageHandler::handle()                │
//!             │                                   │
//!             └─► ctx.publish(event) ─────────────┘
//!                 (sub-tree runs before the next sibling)
//!     │
//!     ▼ whole tree succeeded
//! UnitOfWork::flush()   (once per call)
//! ```
//!
//! ## Guarantees
//!
//! 1. **Depth-first** - an event's whole sub-tree is handled before the next
//!    sibling event or handler runs
//! 2. **One flush per call** - resource managers are flushed once, after the
//!    entire call tree succeeded; a failed or cancelled call flushes nothing
//! 3. **Ordered within a group** - managers sharing a resource id flush in
//!    enlistment order
//! 4. **Classified failures** - every error reaching the caller is a
//!    [`DispatchError`] with a [`FaultKind`] and the call path that raised it
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{async_trait, Engine, MessageHandler, MessageHandlerContext};
//!
//! #[derive(Debug, Clone)]
//! struct PlaceOrder { order_id: u64 }
//!
//! #[derive(Debug, Clone)]
//! struct OrderPlaced { order_id: u64 }
//!
//! struct PlaceOrderHandler { orders: Arc<OrderRepository> }
//!
//! #[async_trait]
//! impl MessageHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, cmd: PlaceOrder, ctx: &MessageHandlerContext) -> anyhow::Result<()> {
//!         self.orders.stage(cmd.order_id);
//!         ctx.enlist(self.orders.clone())?;
//!         ctx.publish(OrderPlaced { order_id: cmd.order_id });
//!         Ok(())
//!     }
//! }
//!
//! let engine = Engine::builder()
//!     .with_handler::<PlaceOrder, _>(PlaceOrderHandler { orders })
//!     .with_handler::<OrderPlaced, _>(ReserveStock)
//!     .with_filter(TracingFilter)
//!     .build();
//!
//! let result = engine.execute_command(PlaceOrder { order_id: 7 }, None).await?;
//! assert_eq!(result.handler_count, 2);
//! ```
//!
//! ## What This Is Not
//!
//! Switchyard is **not**:
//! - A message broker or a durable queue
//! - A saga engine
//! - A distributed transaction coordinator

// Core modules
mod bus;
mod config;
mod context;
mod core;
mod dispatch;
mod engine;
mod error;
mod filter;
mod handler;
mod operation;
mod query;
mod stream;
mod unit_of_work;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export message types
pub use crate::core::{Message, MessageEnvelope, MessageId, MessageKind};

// Re-export operation and context types
pub use context::{Claim, OperationContext, Principal, PrincipalProvider, Services, StackTrace, StaticPrincipal};
pub use operation::{Operation, OperationKind, OperationType};

// Re-export handler types
pub use handler::{into_any_handler, AnyMessageHandler, MessageHandler, MessageHandlerContext};
pub use query::{Query, QueryContext};

// Re-export resolution types
pub use dispatch::{HandlerList, HandlerRegistry, HandlerResolver};

// Re-export filter types
pub use filter::{Filter, FilterStage, FilterTable, InvocationContext, Next, Outcome, TracingFilter};

// Re-export result types
pub use bus::EventBus;
pub use stream::{MessageHandlerResult, MessageStream};

// Re-export unit of work types
pub use unit_of_work::{
    FlushError, FlushSummary, GroupFlushFailure, ResourceId, ResourceManager, UnitOfWork,
    UnitOfWorkError, UnitOfWorkMode,
};

// Re-export error types
pub use crate::error::{DispatchError, EngineError, FaultKind, HandlerError};

// Re-export configuration
pub use config::{ConfigError, EngineSettings, UNIT_OF_WORK_MODE_VAR};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
