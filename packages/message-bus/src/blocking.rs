//! Sequential variant of the bus.
//!
//! Same routing, drain order, failure semantics and outbox coordination as the
//! async [`MessageBus`](crate::MessageBus), for hosts without a runtime.
//! Handlers are plain `fn`s and closures are accepted through
//! [`command_fn`], [`event_fn`] and [`outbox_fn`].
//!
//! # Example
//!
//! ```ignore
//! use message_bus::blocking::{self, command_fn, event_fn};
//!
//! let bus = blocking::MessageBus::new()
//!     .with_command_handler(command_fn(|cmd: PlaceOrder, ctx| {
//!         ctx.emit_event(OrderPlaced { sku: cmd.sku.clone() });
//!         Ok(cmd.quantity)
//!     }))
//!     .with_event_handler(event_fn(|event: &OrderPlaced, _ctx| {
//!         println!("placed {}", event.sku);
//!         Ok(())
//!     }));
//!
//! let quantity = bus.execute(PlaceOrder { sku, quantity: 2 }, &mut Context::new())?;
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BatchPolicy, BusConfig};
use crate::context::{Context, HandlerContext};
use crate::core::{AnyMessage, Command, Event};
use crate::dispatch::{Dispatched, Drain};
use crate::error::{panic_message, BusError, HandlerFailure};
use crate::outbox::{OutboxModel, OutboxRecord, OutboxReport, RecordOutcome};
use crate::registry::{HandlerRegistry, Resolved};

// =============================================================================
// Handler traits
// =============================================================================

/// Synchronous handler for a single command type.
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    fn handle(&self, command: C, ctx: &mut HandlerContext<'_>) -> Result<C::Output>;

    /// Runs before `handle`. An error skips both `handle` and `after_handle`.
    fn before_handle(&self, _context: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Runs after `handle`, even if it failed.
    fn after_handle(&self, _context: &mut Context) {}

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Synchronous handler for one event type.
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    fn handle(&self, event: &E, ctx: &mut HandlerContext<'_>) -> Result<()>;

    /// Runs before `handle`. An error skips both `handle` and `after_handle`.
    fn before_handle(&self, _context: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Runs after `handle`, even if it failed.
    fn after_handle(&self, _context: &mut Context) {}

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<E: Event, H: EventHandler<E> + ?Sized> EventHandler<E> for Box<H> {
    fn handle(&self, event: &E, ctx: &mut HandlerContext<'_>) -> Result<()> {
        (**self).handle(event, ctx)
    }

    fn before_handle(&self, context: &mut Context) -> Result<()> {
        (**self).before_handle(context)
    }

    fn after_handle(&self, context: &mut Context) {
        (**self).after_handle(context)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Synchronous handler invoked for every record drained from the outbox.
pub trait OutboxHandler: Send + Sync + 'static {
    fn handle(&self, record: &OutboxRecord, context: &mut Context) -> Result<()>;

    /// Runs before `handle`. An error skips both `handle` and `after_handle`.
    fn before_handle(&self, _context: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Runs after `handle`, even if it failed.
    fn after_handle(&self, _context: &mut Context) {}

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// =============================================================================
// Closure adapters
// =============================================================================

/// A closure used as a [`CommandHandler`]. Built with [`command_fn`].
pub struct FnCommandHandler<C, F> {
    f: F,
    name: &'static str,
    _phantom: PhantomData<fn(C)>,
}

/// Use a closure as the handler for command `C`.
pub fn command_fn<C, F>(f: F) -> FnCommandHandler<C, F>
where
    C: Command,
    F: Fn(C, &mut HandlerContext<'_>) -> Result<C::Output> + Send + Sync + 'static,
{
    FnCommandHandler {
        f,
        name: std::any::type_name::<F>(),
        _phantom: PhantomData,
    }
}

impl<C, F> FnCommandHandler<C, F> {
    /// Name used in logs and errors instead of the closure's type name.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<C, F> CommandHandler<C> for FnCommandHandler<C, F>
where
    C: Command,
    F: Fn(C, &mut HandlerContext<'_>) -> Result<C::Output> + Send + Sync + 'static,
{
    fn handle(&self, command: C, ctx: &mut HandlerContext<'_>) -> Result<C::Output> {
        (self.f)(command, ctx)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A closure used as an [`EventHandler`]. Built with [`event_fn`].
pub struct FnEventHandler<E, F> {
    f: F,
    name: &'static str,
    _phantom: PhantomData<fn(E)>,
}

/// Use a closure as a handler for event `E`.
pub fn event_fn<E, F>(f: F) -> FnEventHandler<E, F>
where
    E: Event,
    F: Fn(&E, &mut HandlerContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    FnEventHandler {
        f,
        name: std::any::type_name::<F>(),
        _phantom: PhantomData,
    }
}

impl<E, F> FnEventHandler<E, F> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<E, F> EventHandler<E> for FnEventHandler<E, F>
where
    E: Event,
    F: Fn(&E, &mut HandlerContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, event: &E, ctx: &mut HandlerContext<'_>) -> Result<()> {
        (self.f)(event, ctx)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A closure used as an [`OutboxHandler`]. Built with [`outbox_fn`].
pub struct FnOutboxHandler<F> {
    f: F,
    name: &'static str,
}

/// Use a closure as an outbox handler.
pub fn outbox_fn<F>(f: F) -> FnOutboxHandler<F>
where
    F: Fn(&OutboxRecord, &mut Context) -> Result<()> + Send + Sync + 'static,
{
    FnOutboxHandler {
        f,
        name: std::any::type_name::<F>(),
    }
}

impl<F> FnOutboxHandler<F> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<F> OutboxHandler for FnOutboxHandler<F>
where
    F: Fn(&OutboxRecord, &mut Context) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, record: &OutboxRecord, context: &mut Context) -> Result<()> {
        (self.f)(record, context)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Synchronous storage for outbox records.
///
/// Same contract as the async [`OutboxRepository`](crate::OutboxRepository):
/// `add` writes inside the caller's transaction, `list_unprocessed` is a
/// locking read and `update_processed` persists immediately.
pub trait OutboxRepository: Send + Sync {
    fn add(&self, record: OutboxRecord) -> Result<()>;

    fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>>;

    fn update_processed(&self, record: &OutboxRecord, processed_at: DateTime<Utc>) -> Result<()>;

    /// End this caller's claim on a record without processing it.
    fn release(&self, _record: &OutboxRecord) -> Result<()> {
        Ok(())
    }

    fn model(&self) -> OutboxModel {
        OutboxModel::default()
    }
}

impl<R: OutboxRepository + ?Sized> OutboxRepository for Arc<R> {
    fn add(&self, record: OutboxRecord) -> Result<()> {
        (**self).add(record)
    }

    fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
        (**self).list_unprocessed()
    }

    fn update_processed(&self, record: &OutboxRecord, processed_at: DateTime<Utc>) -> Result<()> {
        (**self).update_processed(record, processed_at)
    }

    fn release(&self, record: &OutboxRecord) -> Result<()> {
        (**self).release(record)
    }

    fn model(&self) -> OutboxModel {
        (**self).model()
    }
}

// =============================================================================
// Type erasure
// =============================================================================

fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "handler panicked");
            Err(anyhow!("handler panicked: {}", message))
        }
    }
}

fn guarded_after(handler: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            handler,
            panic = %panic_message(payload.as_ref()),
            "after_handle panicked"
        );
    }
}

trait ErasedCommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle_any(
        &self,
        message: AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<Box<dyn Any + Send>, BusError>;
}

struct CommandHandlerWrapper<H, C> {
    handler: H,
    _phantom: PhantomData<fn(C)>,
}

impl<H, C> ErasedCommandHandler for CommandHandlerWrapper<H, C>
where
    H: CommandHandler<C>,
    C: Command,
{
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    fn handle_any(
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

        guarded(|| self.handler.before_handle(context))
            .map_err(|e| BusError::handler_failed(C::message_type(), name, e))?;

        let result = {
            let mut ctx = HandlerContext::new(context, emitted);
            guarded(|| self.handler.handle(command, &mut ctx))
        };

        guarded_after(name, || self.handler.after_handle(context));

        match result {
            Ok(output) => Ok(Box::new(output) as Box<dyn Any + Send>),
            Err(e) => Err(BusError::handler_failed(C::message_type(), name, e)),
        }
    }
}

trait ErasedEventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle_any(
        &self,
        message: &AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<()>;
}

struct EventHandlerWrapper<H, E> {
    handler: H,
    _phantom: PhantomData<fn(E)>,
}

impl<H, E> ErasedEventHandler for EventHandlerWrapper<H, E>
where
    H: EventHandler<E>,
    E: Event,
{
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    fn handle_any(
        &self,
        message: &AnyMessage,
        context: &mut Context,
        emitted: &mut Vec<AnyMessage>,
    ) -> Result<()> {
        let event = message.downcast_ref::<E>().ok_or(BusError::MessageTypeMismatch {
            expected: E::message_type(),
            actual: message.message_type(),
        })?;

        guarded(|| self.handler.before_handle(context))?;

        let result = {
            let mut ctx = HandlerContext::new(context, emitted);
            guarded(|| self.handler.handle(event, &mut ctx))
        };

        guarded_after(self.handler.name(), || self.handler.after_handle(context));
        result
    }
}

fn run_outbox_handler(
    handler: &dyn OutboxHandler,
    record: &OutboxRecord,
    context: &mut Context,
) -> Result<()> {
    guarded(|| handler.before_handle(context))?;
    let result = guarded(|| handler.handle(record, context));
    guarded_after(handler.name(), || handler.after_handle(context));
    result
}

type BlockingRegistry =
    HandlerRegistry<dyn ErasedCommandHandler, dyn ErasedEventHandler, dyn OutboxHandler>;

// =============================================================================
// MessageBus
// =============================================================================

/// Sequential command/event bus.
pub struct MessageBus {
    registry: BlockingRegistry,
    config: BusConfig,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
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

    /// Register the handler for command `C`, replacing any previous one.
    pub fn set_command_handler<C, H>(&mut self, handler: H)
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.registry.set_command_handler(
            TypeId::of::<C>(),
            C::message_type(),
            Box::new(CommandHandlerWrapper {
                handler,
                _phantom: PhantomData,
            }),
        );
    }

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
                Box::new(EventHandlerWrapper {
                    handler,
                    _phantom: PhantomData,
                }) as Box<dyn ErasedEventHandler>
            })
            .collect();
        self.registry
            .set_event_handlers(TypeId::of::<E>(), E::message_type(), handlers);
    }

    pub fn add_event_handler<E, H>(&mut self, handler: H)
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.registry.add_event_handler(
            TypeId::of::<E>(),
            E::message_type(),
            Box::new(EventHandlerWrapper {
                handler,
                _phantom: PhantomData,
            }),
        );
    }

    pub fn with_event_handler<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.add_event_handler::<E, H>(handler);
        self
    }

    pub fn set_outbox_handlers(&mut self, handlers: Vec<Box<dyn OutboxHandler>>) {
        self.registry.set_outbox_handlers(handlers);
    }

    pub fn add_outbox_handler<H: OutboxHandler>(&mut self, handler: H) {
        self.registry.add_outbox_handler(Box::new(handler));
    }

    pub fn with_outbox_handler<H: OutboxHandler>(mut self, handler: H) -> Self {
        self.add_outbox_handler(handler);
        self
    }

    pub fn has_command_handler<C: Command>(&self) -> bool {
        self.registry.has_command_handler(TypeId::of::<C>())
    }

    pub fn event_handler_count<E: Event>(&self) -> usize {
        self.registry.event_handler_count(TypeId::of::<E>())
    }

    pub fn outbox_handler_count(&self) -> usize {
        self.registry.outbox_handler_count()
    }

    /// Dispatch a message and drain everything it emits, breadth-first.
    #[instrument(skip_all, fields(kind = %message.kind(), message_type = message.message_type()))]
    pub fn handle(&self, message: AnyMessage, context: &mut Context) -> Result<Dispatched, BusError> {
        let mut drain = Drain::new(message, self.config.emission_policy);

        while let Some((message, root)) = drain.next_message() {
            let message_type = message.message_type();
            debug!(kind = %message.kind(), message_type, "dispatching");

            match self.registry.resolve(&message) {
                Err(e) => {
                    error!(message_type, "no handler registered for command");
                    drain.command_failed(e, Vec::new())?;
                }
                Ok(Resolved::Command(handler)) => {
                    let mut emitted = Vec::new();
                    match handler.handle_any(message, context, &mut emitted) {
                        Ok(output) => drain.command_succeeded(root, output, emitted),
                        Err(e) => {
                            error!(message_type, handler = handler.name(), error = %e, "command failed");
                            drain.command_failed(e, emitted)?;
                        }
                    }
                }
                Ok(Resolved::Events(handlers)) => {
                    for handler in handlers {
                        let mut emitted = Vec::new();
                        match handler.handle_any(&message, context, &mut emitted) {
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
    pub fn execute<C: Command>(&self, command: C, context: &mut Context) -> Result<C::Output, BusError> {
        let mut dispatched = self.handle(AnyMessage::command(command), context)?;
        dispatched
            .take_output::<C::Output>()
            .ok_or(BusError::MessageTypeMismatch {
                expected: std::any::type_name::<C::Output>(),
                actual: C::message_type(),
            })
    }

    pub fn publish<E: Event>(&self, event: E, context: &mut Context) -> Result<Dispatched, BusError> {
        self.handle(AnyMessage::event(event), context)
    }

    /// Handle each message in order; one outcome per input.
    pub fn batch_handle(
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

            let outcome = self.handle(message, context);
            stopped = outcome.is_err() && self.config.batch_policy == BatchPolicy::StopOnFailure;
            outcomes.push(outcome);
        }

        outcomes
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Stage a message in the caller's open transaction. Never commits.
    pub fn register<R>(&self, repo: &R, message: &AnyMessage) -> Result<OutboxRecord, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        let record = OutboxRecord::from_message(message)?;
        self.stage(repo, record)
    }

    /// [`register`](Self::register) with free-form metadata stored alongside the message.
    pub fn register_with_metadata<R>(
        &self,
        repo: &R,
        message: &AnyMessage,
        metadata: serde_json::Value,
    ) -> Result<OutboxRecord, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        let record = OutboxRecord::from_message(message)?.with_metadata(metadata);
        self.stage(repo, record)
    }

    fn stage<R>(&self, repo: &R, record: OutboxRecord) -> Result<OutboxRecord, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        repo.add(record.clone()).map_err(BusError::Persistence)?;
        debug!(record_id = %record.id(), "outbox record staged");
        Ok(record)
    }

    /// Drain unprocessed outbox records through the outbox handlers.
    ///
    /// Same contract as [`crate::MessageBus::process_outbox`].
    #[instrument(skip_all)]
    pub fn process_outbox<R>(&self, repo: &R, context: &mut Context) -> Result<OutboxReport, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        let handlers = self.registry.outbox_handlers();
        if handlers.is_empty() {
            debug!("no outbox handlers registered, skipping");
            return Ok(OutboxReport::default());
        }

        let records = repo.list_unprocessed().map_err(BusError::Persistence)?;
        let mut outcomes = Vec::with_capacity(records.len());
        for mut record in records {
            let result = process_record(repo, handlers, &mut record, context);
            outcomes.push(RecordOutcome {
                record_id: record.id(),
                message_type: record.message_type().to_string(),
                result,
            });
        }

        let report = OutboxReport::new(outcomes);
        if !report.is_empty() {
            info!(
                processed = report.processed(),
                failed = report.failed(),
                "outbox pass complete"
            );
        }
        Ok(report)
    }
}

fn process_record<R>(
    repo: &R,
    handlers: &[Box<dyn OutboxHandler>],
    record: &mut OutboxRecord,
    context: &mut Context,
) -> Result<DateTime<Utc>, BusError>
where
    R: OutboxRepository + ?Sized,
{
    for handler in handlers {
        if let Err(e) = run_outbox_handler(handler.as_ref(), record, context) {
            error!(record_id = %record.id(), handler = handler.name(), error = ?e, "outbox handler failed");
            release(repo, record);
            return Err(BusError::handler_failed(record.message_type(), handler.name(), e));
        }
    }

    let processed_at = Utc::now();
    if let Err(e) = repo.update_processed(record, processed_at) {
        error!(record_id = %record.id(), error = ?e, "failed to persist processed_at");
        release(repo, record);
        return Err(BusError::Persistence(e));
    }
    record.mark_processed(processed_at)?;
    Ok(processed_at)
}

fn release<R: OutboxRepository + ?Sized>(repo: &R, record: &OutboxRecord) {
    if let Err(e) = repo.release(record) {
        warn!(record_id = %record.id(), error = ?e, "failed to release outbox record");
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("blocking::MessageBus")
            .field("config", &self.config)
            .field("command_handlers", &self.registry.command_handler_count())
            .field("outbox_handlers", &self.registry.outbox_handler_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmissionPolicy;
    use crate::core::Message;
    use crate::outbox::memory::InMemoryOutbox;
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize)]
    struct Step(&'static str);
    impl Message for Step {}
    impl Event for Step {}

    #[derive(Debug, Serialize)]
    struct Double(i64);
    impl Message for Double {}
    impl Command for Double {
        type Output = i64;
    }

    fn trail(ctx: &mut Context, entry: &str) {
        if !ctx.contains_key("trail") {
            ctx.insert("trail", Vec::<String>::new());
        }
        if let Some(trail) = ctx.get_mut::<Vec<String>>("trail") {
            trail.push(entry.to_string());
        }
    }

    fn trail_of(ctx: &Context) -> Vec<String> {
        ctx.get::<Vec<String>>("trail").cloned().unwrap_or_default()
    }

    #[test]
    fn test_closure_command_handler() {
        let bus = MessageBus::new()
            .with_command_handler(command_fn(|cmd: Double, _ctx| Ok(cmd.0 * 2)));

        let output = bus.execute(Double(21), &mut Context::new()).unwrap();

        assert_eq!(output, 42);
        assert!(bus.has_command_handler::<Double>());
    }

    #[test]
    fn test_breadth_first_order() {
        let bus = MessageBus::new().with_event_handler(event_fn(|step: &Step, ctx| {
            trail(ctx, step.0);
            match step.0 {
                "A" => {
                    ctx.emit_event(Step("B"));
                    ctx.emit_event(Step("C"));
                }
                "B" => ctx.emit_event(Step("D")),
                _ => {}
            }
            Ok(())
        }));
        let mut ctx = Context::new();

        let dispatched = bus.publish(Step("A"), &mut ctx).unwrap();

        assert_eq!(trail_of(&ctx), vec!["A", "B", "C", "D"]);
        assert_eq!(dispatched.trace().len(), 4);
    }

    #[test]
    fn test_panic_is_reported_as_handler_failure() {
        let bus = MessageBus::new().with_command_handler(
            command_fn(|_cmd: Double, _ctx| -> Result<i64> { panic!("boom") }).named("doubler"),
        );

        let err = bus.execute(Double(1), &mut Context::new()).unwrap_err();

        match err {
            BusError::HandlerFailed { handler, source, .. } => {
                assert_eq!(handler, "doubler");
                assert!(source.to_string().contains("handler panicked: boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct Hooked;

    impl EventHandler<Step> for Hooked {
        fn before_handle(&self, context: &mut Context) -> Result<()> {
            trail(context, "before");
            Ok(())
        }

        fn handle(&self, _event: &Step, _ctx: &mut HandlerContext<'_>) -> Result<()> {
            anyhow::bail!("hooked failed")
        }

        fn after_handle(&self, context: &mut Context) {
            trail(context, "after");
        }
    }

    #[test]
    fn test_hooks_run_around_failing_handler() {
        let mut bus = MessageBus::new();
        bus.set_event_handlers::<Step>(vec![
            Box::new(Hooked),
            Box::new(event_fn(|_: &Step, ctx| {
                trail(ctx, "sibling");
                Ok(())
            })),
        ]);
        let mut ctx = Context::new();

        let dispatched = bus.publish(Step("A"), &mut ctx).unwrap();

        assert_eq!(trail_of(&ctx), vec!["before", "after", "sibling"]);
        assert_eq!(dispatched.failures().len(), 1);
        assert_eq!(bus.event_handler_count::<Step>(), 2);
    }

    #[test]
    fn test_discard_policy_returns_first_failure() {
        let config = BusConfig::default().with_emission_policy(EmissionPolicy::Discard);
        let bus = MessageBus::with_config(config)
            .with_command_handler(command_fn(|_: Double, ctx| -> Result<i64> {
                ctx.emit_event(Step("lost"));
                anyhow::bail!("nope")
            }))
            .with_event_handler(event_fn(|step: &Step, ctx| {
                trail(ctx, step.0);
                Ok(())
            }));
        let mut ctx = Context::new();

        assert!(bus.execute(Double(1), &mut ctx).unwrap_err().is_handler_failure());
        assert!(trail_of(&ctx).is_empty());
    }

    #[test]
    fn test_batch_handle_runs_every_message() {
        let bus = MessageBus::new()
            .with_command_handler(command_fn(|cmd: Double, _ctx| {
                anyhow::ensure!(cmd.0 >= 0, "negative input");
                Ok(cmd.0 * 2)
            }));

        let outcomes = bus.batch_handle(
            vec![
                AnyMessage::command(Double(1)),
                AnyMessage::command(Double(-1)),
                AnyMessage::command(Double(3)),
            ],
            &mut Context::new(),
        );

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].as_ref().unwrap().output::<i64>(), Some(&2));
        assert!(outcomes[1].is_err());
        assert_eq!(outcomes[2].as_ref().unwrap().output::<i64>(), Some(&6));
    }

    #[test]
    fn test_outbox_round_trip() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let bus = MessageBus::new().with_outbox_handler(outbox_fn(move |_record, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let store = InMemoryOutbox::new();

        let session = store.session();
        let staged = bus
            .register_with_metadata(
                &session,
                &AnyMessage::event(Step("A")),
                serde_json::json!({ "trace_id": "t-1" }),
            )
            .unwrap();
        session.commit();

        let report = bus.process_outbox(&store.session(), &mut Context::new()).unwrap();

        assert_eq!(report.processed(), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let stored = store.get(staged.id()).unwrap();
        assert!(stored.is_processed());
        assert_eq!(stored.metadata(), Some(&serde_json::json!({ "trace_id": "t-1" })));
    }

    struct ReadOnly;

    impl OutboxRepository for ReadOnly {
        fn add(&self, _record: OutboxRecord) -> Result<()> {
            anyhow::bail!("outbox is read-only")
        }

        fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
            Ok(Vec::new())
        }

        fn update_processed(&self, _record: &OutboxRecord, _processed_at: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_variants_report_persistence_failure() {
        let bus = MessageBus::new();
        let message = AnyMessage::event(Step("A"));

        let plain = bus.register(&ReadOnly, &message).unwrap_err();
        let with_metadata = bus
            .register_with_metadata(&ReadOnly, &message, serde_json::json!({ "source": "test" }))
            .unwrap_err();

        for err in [plain, with_metadata] {
            assert!(err.is_persistence());
            assert!(format!("{:#}", err).contains("read-only"));
        }
    }

    #[test]
    fn test_failed_outbox_record_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let bus = MessageBus::new().with_outbox_handler(outbox_fn(move |_record, _ctx| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transport down");
            }
            Ok(())
        }));
        let store = InMemoryOutbox::new();
        let session = store.session();
        bus.register(&session, &AnyMessage::event(Step("A"))).unwrap();
        session.commit();

        let first = bus.process_outbox(&store.session(), &mut Context::new()).unwrap();
        assert_eq!(first.failed(), 1);
        assert_eq!(store.unprocessed_count(), 1);

        let second = bus.process_outbox(&store.session(), &mut Context::new()).unwrap();
        assert_eq!(second.processed(), 1);
        assert_eq!(store.unprocessed_count(), 0);
    }

    #[test]
    fn test_process_outbox_without_handlers_is_empty() {
        let bus = MessageBus::new();
        let store = InMemoryOutbox::new();
        let session = store.session();
        bus.register(&session, &AnyMessage::event(Step("A"))).unwrap();
        session.commit();

        let report = bus.process_outbox(&store.session(), &mut Context::new()).unwrap();

        assert!(report.is_empty());
        assert_eq!(store.unprocessed_count(), 1);
    }
}
