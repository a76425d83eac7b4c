//! Per-call shared state and the emission capability handed to handlers.
//!
//! A [`Context`] lives for one top-level call (`handle`, `batch_handle` or
//! `process_outbox`). Every handler invoked during that call receives the same
//! `Context` by mutable reference, so it is the place to put things like a
//! database session or the current actor. It is never persisted.
//!
//! Handlers do not dispatch follow-up messages inline. They receive a
//! [`HandlerContext`] and call [`HandlerContext::emit`]; the engine queues the
//! emitted messages and dispatches them only after the emitting handler has
//! returned.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use tracing::trace;

use crate::core::{AnyMessage, Command, Event};

/// Shared, mutable key/value map for one top-level call.
///
/// Values are stored type-erased and read back with a type parameter. A read
/// with the wrong type returns `None`.
///
/// # Example
///
/// ```ignore
/// let mut ctx = Context::new().with("tenant", TenantId(7));
///
/// bus.handle(AnyMessage::command(cmd), &mut ctx).await?;
///
/// // Handlers may have written to it
/// let audit: Option<&Vec<String>> = ctx.get("audit");
/// ```
#[derive(Default)]
pub struct Context {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or overwrite a value. Last write wins.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Borrow a value as `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref())
    }

    /// Mutably borrow a value as `T`.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|value| value.downcast_mut())
    }

    /// Remove a value and return it as `T`.
    ///
    /// If the stored value is not a `T` it is left in place and `None` is
    /// returned.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key).is_some_and(|value| value.is::<T>()) {
            return None;
        }
        self.values
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// Returns true if a value is stored under `key`, whatever its type.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What a handler sees while it runs: the shared [`Context`] plus the ability
/// to emit follow-up messages.
///
/// Derefs to [`Context`], so `ctx.get::<T>("key")` works directly.
///
/// Emitted messages are buffered for this invocation and appended to the
/// engine's queue after the handler returns. They are dispatched breadth-first:
/// everything one handler emits runs, in emission order, before anything those
/// messages emit in turn.
pub struct HandlerContext<'a> {
    context: &'a mut Context,
    emitted: &'a mut Vec<AnyMessage>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(context: &'a mut Context, emitted: &'a mut Vec<AnyMessage>) -> Self {
        Self { context, emitted }
    }

    /// Queue a message for dispatch after the current handler returns.
    pub fn emit(&mut self, message: AnyMessage) {
        trace!(
            kind = %message.kind(),
            message_type = message.message_type(),
            "message emitted"
        );
        self.emitted.push(message);
    }

    /// Queue a command.
    pub fn emit_command<C: Command>(&mut self, command: C) {
        self.emit(AnyMessage::command(command));
    }

    /// Queue an event.
    pub fn emit_event<E: Event>(&mut self, event: E) {
        self.emit(AnyMessage::event(event));
    }

    /// Number of messages emitted so far by this invocation.
    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }

    /// The shared context.
    pub fn context(&self) -> &Context {
        &*self.context
    }

    /// The shared context, mutably.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut *self.context
    }
}

impl Deref for HandlerContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        &*self.context
    }
}

impl DerefMut for HandlerContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        &mut *self.context
    }
}

impl fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("context", &self.context)
            .field("emitted", &self.emitted.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Message, MessageKind};
    use serde::Serialize;

    #[derive(Debug, Serialize)]
    struct Ping;
    impl Message for Ping {}
    impl Event for Ping {}

    #[derive(Debug, Serialize)]
    struct Pong;
    impl Message for Pong {}
    impl Command for Pong {
        type Output = ();
    }

    #[test]
    fn test_context_insert_and_get() {
        let mut ctx = Context::new();
        ctx.insert("count", 3usize);

        assert_eq!(ctx.get::<usize>("count"), Some(&3));
        assert_eq!(ctx.get::<String>("count"), None);
        assert_eq!(ctx.get::<usize>("missing"), None);
    }

    #[test]
    fn test_context_last_write_wins() {
        let mut ctx = Context::new().with("session", "first".to_string());
        ctx.insert("session", "second".to_string());

        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get::<String>("session").map(String::as_str), Some("second"));
    }

    #[test]
    fn test_context_overwrite_can_change_type() {
        let mut ctx = Context::new().with("value", 1u8);
        ctx.insert("value", "text");

        assert_eq!(ctx.get::<u8>("value"), None);
        assert_eq!(ctx.get::<&str>("value"), Some(&"text"));
    }

    #[test]
    fn test_context_get_mut() {
        let mut ctx = Context::new().with("log", Vec::<String>::new());
        ctx.get_mut::<Vec<String>>("log").unwrap().push("a".into());

        assert_eq!(ctx.get::<Vec<String>>("log").unwrap().len(), 1);
    }

    #[test]
    fn test_context_remove_wrong_type_keeps_value() {
        let mut ctx = Context::new().with("n", 5i64);

        assert_eq!(ctx.remove::<u32>("n"), None);
        assert!(ctx.contains_key("n"));
        assert_eq!(ctx.remove::<i64>("n"), Some(5));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_handler_context_emit_preserves_order() {
        let mut ctx = Context::new();
        let mut emitted = Vec::new();

        {
            let mut hctx = HandlerContext::new(&mut ctx, &mut emitted);
            hctx.emit_event(Ping);
            hctx.emit_command(Pong);
            hctx.emit(AnyMessage::event(Ping));
            assert_eq!(hctx.emitted_count(), 3);
        }

        let kinds: Vec<_> = emitted.iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::Event, MessageKind::Command, MessageKind::Event]
        );
    }

    #[test]
    fn test_handler_context_derefs_to_context() {
        let mut ctx = Context::new();
        let mut emitted = Vec::new();

        {
            let mut hctx = HandlerContext::new(&mut ctx, &mut emitted);
            hctx.insert("seen", true);
            assert_eq!(hctx.get::<bool>("seen"), Some(&true));
        }

        assert_eq!(ctx.get::<bool>("seen"), Some(&true));
    }

    #[test]
    fn test_context_debug_lists_keys() {
        let ctx = Context::new().with("db", 1u8);
        assert!(format!("{:?}", ctx).contains("db"));
    }
}
