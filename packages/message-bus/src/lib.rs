//! # Message Bus
//!
//! In-process command/event dispatch with a transactional outbox.
//!
//! ## Core Concepts
//!
//! - [`Command`] = Intent. Routed to exactly one [`CommandHandler`], whose
//!   output is returned to the caller.
//! - [`Event`] = Fact. Fanned out to zero or more [`EventHandler`]s in
//!   registration order.
//! - Handlers never dispatch inline. They *emit* through [`HandlerContext`]
//!   and the bus drains the emissions breadth-first after the handler returns.
//! - The outbox stages messages in the caller's own database transaction
//!   ([`MessageBus::register`]) and later hands them to [`OutboxHandler`]s
//!   ([`MessageBus::process_outbox`]), so a message exists if and only if the
//!   business write committed.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► MessageBus::handle(msg, ctx)
//!                 │
//!                 ▼
//!           queue [msg] ◄────────────── ctx.emit(..)
//!                 │                         ▲
//!                 ├─► Command ─► handler ───┤
//!                 │                         │
//!                 └─► Event ──► handler 1 ──┤
//!                               handler 2 ──┘
//!
//! caller tx ──► MessageBus::register(repo, msg) ──► repo.add (no commit)
//!
//! poller ──► MessageBus::process_outbox(repo, ctx)
//!                 │
//!                 ├─► repo.list_unprocessed()   (locking read)
//!                 ├─► outbox handler 1..n
//!                 └─► repo.update_processed()   (or repo.release())
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One handler per command** - registering again replaces it
//! 2. **Unhandled events are no-ops** - unhandled commands are errors
//! 3. **Breadth-first drain** - everything one handler emitted runs before
//!    anything those messages emit
//! 4. **Failing event handlers are isolated** - siblings still run
//! 5. **Outbox rows are processed once** - `processed_at` is set-once and the
//!    locking read keeps concurrent drains apart
//!
//! ## Example
//!
//! ```ignore
//! use message_bus::{async_trait, AnyMessage, Command, CommandHandler, Context,
//!     Event, HandlerContext, Message, MessageBus};
//! use serde::Serialize;
//!
//! #[derive(Debug, Serialize)]
//! struct PlaceOrder { sku: String }
//! impl Message for PlaceOrder {}
//! impl Command for PlaceOrder { type Output = u64; }
//!
//! #[derive(Debug, Serialize)]
//! struct OrderPlaced { order_id: u64 }
//! impl Message for OrderPlaced {}
//! impl Event for OrderPlaced {}
//!
//! struct PlaceOrderHandler;
//!
//! #[async_trait]
//! impl CommandHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, cmd: PlaceOrder, ctx: &mut HandlerContext<'_>) -> anyhow::Result<u64> {
//!         let order_id = 7;
//!         ctx.emit_event(OrderPlaced { order_id });
//!         Ok(order_id)
//!     }
//! }
//!
//! let bus = MessageBus::new().with_command_handler(PlaceOrderHandler);
//! let order_id = bus.execute(PlaceOrder { sku: "abc".into() }, &mut Context::new()).await?;
//! ```
//!
//! ## Modules
//!
//! - [`blocking`]: the same bus for synchronous hosts, closures as handlers
//! - [`outbox`]: records, repositories, the in-memory store and the poller
//! - [`codec`]: type-tag based deserialization of outbox payloads
//! - [`config`]: environment-driven configuration

pub mod blocking;
mod bus;
pub mod codec;
pub mod config;
mod context;
mod core;
mod dispatch;
mod error;
mod handler;
pub mod outbox;
mod registry;

pub use bus::MessageBus;
pub use codec::MessageCodec;
pub use config::{BatchPolicy, BusConfig, EmissionPolicy, PollerConfig};
pub use context::{Context, HandlerContext};
pub use crate::core::{AnyMessage, Command, Event, Message, MessageKind};
pub use dispatch::{DispatchRecord, Dispatched};
pub use error::{BusError, HandlerFailure};
pub use handler::{CommandHandler, EventHandler, OutboxHandler};
pub use outbox::memory::{InMemoryOutbox, InMemoryOutboxSession};
pub use outbox::poller::{OutboxPoller, PollerStats};
pub use outbox::{
    EnvelopeType, OutboxModel, OutboxRecord, OutboxReport, OutboxRepository, RecordOutcome,
};

#[cfg(feature = "postgres")]
pub use outbox::postgres::PgOutboxRepository;

// Re-export for handler implementations
pub use async_trait::async_trait;
