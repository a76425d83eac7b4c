//! The async dispatch engine.
//!
//! `MessageBus` owns a handler registry and routes messages:
//! 1. Commands go to their single registered handler
//! 2. Events fan out to every registered handler in registration order
//! 3. Whatever handlers emit is queued and drained breadth-first
//!
//! # Drain Order
//!
//! If `A` emits `B` and `C`, and `B` emits `D`, the dispatch order is
//! `A, B, C, D`. Everything one handler emits runs before anything those
//! messages emit in turn.
//!
//! # Failure Semantics
//!
//! - A failing command is fatal to the `handle` call. With
//!   [`EmissionPolicy::Drain`](crate::EmissionPolicy::Drain) the queue still
//!   drains and the first failure is returned at the end; with
//!   [`EmissionPolicy::Discard`](crate::EmissionPolicy::Discard) the failing
//!   handler's emissions are dropped and `handle` returns immediately.
//! - A failing event handler is isolated: logged, recorded in
//!   [`Dispatched::failures`], and its siblings still run.
//! - Panics are caught and reported as [`BusError::HandlerFailed`].

use std::any::TypeId;
use std::fmt;

use tracing::{debug, error, instrument};

use crate::config::{BatchPolicy, BusConfig};
use crate::context::Context;
use crate::core::{AnyMessage, Command, Event};
use crate::dispatch::{Dispatched, Drain};
use crate::error::{BusError, HandlerFailure};
use crate::handler::{
    CommandHandler, CommandHandlerWrapper, ErasedCommandHandler, ErasedEventHandler,
    EventHandler, EventHandlerWrapper, OutboxHandler,
};
use crate::registry::{HandlerRegistry, Resolved};

pub(crate) type AsyncRegistry =
    HandlerRegistry<dyn ErasedCommandHandler, dyn ErasedEventHandler, dyn OutboxHandler>;

/// In-process command/event bus.
///
/// # Example
///
/// ```ignore
/// let bus = MessageBus::new()
///     .with_command_handler(PlaceOrderHandler::new(pool.clone()))
///     .with_event_handler(SendReceipt::new(mailer))
///     .with_event_handler(UpdateStock::new(pool));
///
/// let mut ctx = Context::new();
/// let order_id = bus.execute(PlaceOrder { sku, quantity }, &mut ctx).await?;
/// ```
pub struct MessageBus {
    pub(crate) registry: AsyncRegistry,
    config: BusConfig,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Create an empty bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register the handler for command `C`.
    ///
    /// Registering a second handler for the same command replaces the first
    /// (last write wins).
    pub fn set_command_handler<C, H>(&mut self, handler: H)
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.registry.set_command_handler(
            TypeId::of::<C>(),
            C::message_type(),
            Box::new(CommandHandlerWrapper::new(handler)),
        );
    }

    /// Builder-style [`set_command_handler`](Self::set_command_handler).
    pub fn with_command_handler<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.set_command_handler::<C, H>(handler);
        self
    }

    /// Replace the handler list for event `E`. Order is invocation order.
    pub fn set_event_handlers<E: Event>(&mut self, handlers: Vec<Box<dyn EventHandler<E>>>) {
        let handlers = handlers
            .into_iter()
            .map(|handler| {
                Box::new(EventHandlerWrapper::new(handler)) as Box<dyn ErasedEventHandler>
            })
            .collect();
        self.registry
            .set_event_handlers(TypeId::of::<E>(), E::message_type(), handlers);
    }

    /// Append one handler for event `E`.
    pub fn add_event_handler<E, H>(&mut self, handler: H)
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.registry.add_event_handler(
            TypeId::of::<E>(),
            E::message_type(),
            Box::new(EventHandlerWrapper::new(handler)),
        );
    }

    /// Builder-style [`add_event_handler`](Self::add_event_handler).
    pub fn with_event_handler<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.add_event_handler::<E, H>(handler);
        self
    }

    /// Replace the outbox handler list.
    pub fn set_outbox_handlers(&mut self, handlers: Vec<Box<dyn OutboxHandler>>) {
        self.registry.set_outbox_handlers(handlers);
    }

    /// Append one outbox handler.
    pub fn add_outbox_handler<H: OutboxHandler>(&mut self, handler: H) {
        self.registry.add_outbox_handler(Box::new(handler));
    }

    /// Builder-style [`add_outbox_handler`](Self::add_outbox_handler).
    pub fn with_outbox_handler<H: OutboxHandler>(mut self, handler: H) -> Self {
        self.add_outbox_handler(handler);
        self
    }

    pub fn has_command_handler<C: Command>(&self) -> bool {
        self.registry.has_command_handler(TypeId::of::<C>())
    }

    pub fn command_handler_count(&self) -> usize {
        self.registry.command_handler_count()
    }

    pub fn event_handler_count<E: Event>(&self) -> usize {
        self.registry.event_handler_count(TypeId::of::<E>())
    }

    pub fn outbox_handler_count(&self) -> usize {
        self.registry.outbox_handler_count()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatch a message and drain everything it emits.
    ///
    /// Returns the root command's output (if any), the dispatch trace and the
    /// isolated event handler failures. An unregistered event is a no-op
    /// success; an unregistered command is [`BusError::NoHandlerRegistered`].
    #[instrument(skip_all, fields(kind = %message.kind(), message_type = message.message_type()))]
    pub async fn handle(
        &self,
        message: AnyMessage,
        context: &mut Context,
    ) -> Result<Dispatched, BusError> {
        let mut drain = Drain::new(message, self.config.emission_policy);

        while let Some((message, root)) = drain.next_message() {
            let message_type = message.message_type();
            debug!(kind = %message.kind(), message_type, "dispatching");

            let resolved = match self.registry.resolve(&message) {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!(message_type, "no handler registered for command");
                    drain.command_failed(e, Vec::new())?;
                    continue;
                }
            };

            match resolved {
                Resolved::Command(handler) => {
                    let mut emitted = Vec::new();
                    match handler.handle_any(message, context, &mut emitted).await {
                        Ok(output) => drain.command_succeeded(root, output, emitted),
                        Err(e) => {
                            error!(message_type, handler = handler.name(), error = %e, "command failed");
                            drain.command_failed(e, emitted)?;
                        }
                    }
                }
                Resolved::Events(handlers) => {
                    if handlers.is_empty() {
                        debug!(message_type, "no handlers registered for event");
                    }
                    for handler in handlers {
                        let mut emitted = Vec::new();
                        match handler.handle_any(&message, context, &mut emitted).await {
                            Ok(()) => drain.event_handled(emitted),
                            Err(e) => {
                                error!(message_type, handler = handler.name(), error = ?e, "event handler failed");
                                drain.event_failed(
                                    HandlerFailure {
                                        message_type,
                                        handler: handler.name(),
                                        error: e,
                                    },
                                    emitted,
                                );
                            }
                        }
                    }
                }
            }
        }

        drain.finish()
    }

    /// Dispatch a command and return its handler's output.
    pub async fn execute<C: Command>(
        &self,
        command: C,
        context: &mut Context,
    ) -> Result<C::Output, BusError> {
        let mut dispatched = self.handle(AnyMessage::command(command), context).await?;
        dispatched
            .take_output::<C::Output>()
            .ok_or(BusError::MessageTypeMismatch {
                expected: std::any::type_name::<C::Output>(),
                actual: C::message_type(),
            })
    }

    /// Dispatch an event to its handlers.
    pub async fn publish<E: Event>(
        &self,
        event: E,
        context: &mut Context,
    ) -> Result<Dispatched, BusError> {
        self.handle(AnyMessage::event(event), context).await
    }

    /// Handle each message in order with one shared context.
    ///
    /// Always returns exactly one outcome per input, in input order. With
    /// [`BatchPolicy::StopOnFailure`] every message after the first failure is
    /// reported as [`BusError::NotAttempted`].
    #[instrument(skip_all, fields(count = messages.len()))]
    pub async fn batch_handle(
        &self,
        messages: Vec<AnyMessage>,
        context: &mut Context,
    ) -> Vec<Result<Dispatched, BusError>> {
        let mut outcomes = Vec::with_capacity(messages.len());
        let mut stopped = false;

        for message in messages {
            if stopped {
                outcomes.push(Err(BusError::NotAttempted {
                    message_type: message.message_type().to_string(),
                }));
                continue;
            }

            let outcome = self.handle(message, context).await;
            if outcome.is_err() && self.config.batch_policy == BatchPolicy::StopOnFailure {
                debug!("batch stopped after failure");
                stopped = true;
            }
            outcomes.push(outcome);
        }

        outcomes
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .field("command_handlers", &self.registry.command_handler_count())
            .field("outbox_handlers", &self.registry.outbox_handler_count())
            .finish_non_exhaustive()
    }
}
