//! Handler traits for the async bus.
//!
//! Handlers are the IO layer. A [`CommandHandler`] performs exactly one action
//! and returns the command's output. An [`EventHandler`] reacts to a fact; many
//! may be registered for one event and they run in registration order. An
//! [`OutboxHandler`] receives every record drained from the outbox.
//!
//! Every handler trait carries two lifecycle hooks, `before_handle` and
//! `after_handle`. They default to no-ops. If `before_handle` fails, the
//! handler is not invoked and `after_handle` is skipped. Once `handle` has been
//! entered, `after_handle` always runs, whether `handle` succeeded, failed or
//! panicked.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, warn};

use crate::context::{Context, HandlerContext};
use crate::core::{AnyMessage, Command, Event};
use crate::error::{panic_message, BusError};
use crate::outbox::OutboxRecord;

/// Handler for a single command type.
///
/// Exactly one handler is registered per command type. The command is moved
/// into the handler; the returned value becomes the result of the top-level
/// `handle` call (or is discarded if the command was emitted by another
/// handler).
///
/// # Example
///
/// ```ignore
/// struct PlaceOrderHandler { db: PgPool }
///
/// #[async_trait]
/// impl CommandHandler<PlaceOrder> for PlaceOrderHandler {
///     async fn handle(&self, cmd: PlaceOrder, ctx: &mut HandlerContext<'_>) -> Result<Uuid> {
///         let order_id = Order::create(&cmd, &self.db).await?;
///         ctx.emit_event(OrderPlaced { order_id });
///         Ok(order_id)
///     }
/// }
/// ```
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Perform the command.
    async fn handle(&self, command: C, ctx: &mut HandlerContext<'_>) -> Result<C::Output>;

    /// Runs before `handle`. An error skips both `handle` and `after_handle`.
    async fn before_handle(&self, _context: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Runs after `handle`, even if it failed.
    async fn after_handle(&self, _context: &mut Context) {}

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Handler for one event type.
///
/// The event is lent by shared reference so every registered handler sees
/// the same value. Return values are discarded; an error is isolated to this
/// handler and does not stop its siblings.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    /// React to the event.
    async fn handle(&self, event: &E, ctx: &mut HandlerContext<'_>) -> Result<()>;

    /// Runs before `handle`. An error skips both `handle` and `after_handle`.
    async fn before_handle(&self, _context: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Runs after `handle`, even if it failed.
    async fn after_handle(&self, _context: &mut Context) {}

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E> + ?Sized> EventHandler<E> for Box<H> {
    async fn handle(&self, event: &E, ctx: &mut HandlerContext<'_>) -> Result<()> {
        (**self).handle(event, ctx).await
    }

    async fn before_handle(&self, context: &mut Context) -> Result<()> {
        (**self).before_handle(context).await
    }

    async fn after_handle(&self, context: &mut Context) {
        (**self).after_handle(context).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Handler invoked for every record drained from the outbox.
///
/// Outbox handlers typically deliver the record to an external transport.
/// A record is marked processed only when every outbox handler succeeded.
///
/// # Example
///
/// ```ignore
/// struct Publish { client: KafkaProducer }
///
/// #[async_trait]
/// impl OutboxHandler for Publish {
///     async fn handle(&self, record: &OutboxRecord, _ctx: &mut Context) -> Result<()> {
///         self.client.send(record.message_type(), record.message()).await
///     }
/// }
/// ```
#[async_trait]
pub trait OutboxHandler: Send + Sync + 'static {
    /// Process one record.
    async fn handle(&self, record: &OutboxRecord, context: &mut Context) -> Result<()>;

    /// Runs before `handle`. An error skips both `handle` and `after_handle`.
    async fn before_handle(&self, _context: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Runs after `handle`, even if it failed.
    async fn after_handle(&self, _context: &mut Context) {}

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Await a handler future, converting a panic into an error.
///
/// `AssertUnwindSafe` is required because handlers hold `&mut` state.
pub(crate) async fn guarded<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "handler panicked");
            Err(anyhow!("handler panicked: {}", message))
        }
    }
}

/// Run `after_handle` so that a panicking hook cannot take the engine down.
async fn guarded_after<F: Future<Output = ()>>(handler: &'static str, fut: F) {
    if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
        warn!(
            handler,
            panic = %panic_message(payload.as_ref()),
            "after_handle panicked"
        );
    }
}

/// Type-erased command handler.
#[async_trait]
pub(crate) trait ErasedCommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the hooks and the handler. The output is boxed for `Dispatched`.
    async fn handle_any(
        &self,
        message: AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<Box<dyn Any + Send>, BusError>;
}

/// Wrapper to make a concrete command handler implement [`ErasedCommandHandler`].
pub(crate) struct CommandHandlerWrapper<H, C> {
    handler: H,
    _phantom: PhantomData<fn(C)>,
}

impl<H, C> CommandHandlerWrapper<H, C>
where
    H: CommandHandler<C>,
    C: Command,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, C> ErasedCommandHandler for CommandHandlerWrapper<H, C>
where
    H: CommandHandler<C>,
    C: Command,
{
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    async fn handle_any(
        &self,
        message: AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<Box<dyn Any + Send>, BusError> {
        let actual = message.message_type();
        let command = message
            .into_message::<C>()
            .ok_or(BusError::MessageTypeMismatch {
                expected: C::message_type(),
                actual,
            })?;
        let name = self.handler.name();

        guarded(self.handler.before_handle(context))
            .await
            .map_err(|e| BusError::handler_failed(C::message_type(), name, e))?;

        let result = {
            let mut ctx = HandlerContext::new(context, emitted);
            guarded(self.handler.handle(command, &mut ctx)).await
        };

        guarded_after(name, self.handler.after_handle(context)).await;

        match result {
            Ok(output) => Ok(Box::new(output) as Box<dyn Any + Send>),
            Err(e) => Err(BusError::handler_failed(C::message_type(), name, e)),
        }
    }
}

/// Type-erased event handler.
#[async_trait]
pub(crate) trait ErasedEventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_any(
        &self,
        message: &AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<()>;
}

/// Wrapper to make a concrete event handler implement [`ErasedEventHandler`].
pub(crate) struct EventHandlerWrapper<H, E> {
    handler: H,
    _phantom: PhantomData<fn(E)>,
}

impl<H, E> EventHandlerWrapper<H, E>
where
    H: EventHandler<E>,
    E: Event,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, E> ErasedEventHandler for EventHandlerWrapper<H, E>
where
    H: EventHandler<E>,
    E: Event,
{
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    async fn handle_any(
        &self,
        message: &AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<()> {
        let event = message.downcast_ref::<E>().ok_or(BusError::MessageTypeMismatch {
            expected: E::message_type(),
            actual: message.message_type(),
        })?;

        guarded(self.handler.before_handle(context)).await?;

        let result = {
            let mut ctx = HandlerContext::new(context, emitted);
            guarded(self.handler.handle(event, &mut ctx)).await
        };

        guarded_after(self.handler.name(), self.handler.after_handle(context)).await;
        result
    }
}

/// Run one outbox handler with its hooks and panic capture.
pub(crate) async fn run_outbox_handler(
    handler: &dyn OutboxHandler,
    record: &OutboxRecord,
    context: &mut Context,
) -> Result<()> {
    guarded(handler.before_handle(context)).await?;
    let result = guarded(handler.handle(record, context)).await;
    guarded_after(handler.name(), handler.after_handle(context)).await;
    result
}
