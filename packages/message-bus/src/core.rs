//! Core message traits.
//!
//! # Overview
//!
//! The bus separates **intent** from **facts**:
//! - [`Command`] = Intent (a request for exactly one handler to act)
//! - [`Event`] = Facts (something that already happened, zero or more handlers)
//!
//! Both are plain data. Every message carries a stable type identifier
//! ([`Message::message_type`]) used as the serialization tag when the message is
//! written to the outbox. Dispatch itself is keyed by the Rust `TypeId`.
//!
//! Heterogeneous messages travel through the engine as [`AnyMessage`], a
//! type-erased envelope that remembers the message kind and can still be
//! serialized.

use std::any::{Any, TypeId};
use std::fmt;

use serde::Serialize;

/// The two kinds of message the bus routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Routed to exactly one handler; the handler's output is returned to the caller.
    Command,
    /// Routed to every registered handler in registration order.
    Event,
}

impl MessageKind {
    /// Returns true for commands.
    pub fn is_command(&self) -> bool {
        matches!(self, MessageKind::Command)
    }

    /// Returns true for events.
    pub fn is_event(&self) -> bool {
        matches!(self, MessageKind::Event)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Base trait for everything that flows through the bus.
///
/// Messages must be serializable so that any message can be staged in the
/// outbox. Deserialization is only required for types registered with a
/// [`MessageCodec`](crate::MessageCodec).
///
/// # Message Type Identifier
///
/// `message_type()` defaults to the unqualified Rust type name. Override it
/// for messages that are persisted, so renaming or moving the Rust type does
/// not orphan rows already in the outbox:
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderShipped { order_id: Uuid }
///
/// impl Message for OrderShipped {
///     fn message_type() -> &'static str {
///         "order.shipped.v1"
///     }
/// }
/// impl Event for OrderShipped {}
/// ```
pub trait Message: Serialize + fmt::Debug + Send + Sync + 'static {
    /// Stable identifier for this message type.
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

/// A request for exactly one handler to perform an action.
///
/// The associated `Output` is what the handler returns and what
/// [`MessageBus::execute`](crate::MessageBus::execute) hands back to the caller.
/// Commands emitted from inside other handlers have their output discarded.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct PlaceOrder { sku: String, quantity: u32 }
///
/// impl Message for PlaceOrder {}
/// impl Command for PlaceOrder {
///     type Output = Uuid;
/// }
/// ```
pub trait Command: Message {
    /// Value produced by the command's handler.
    type Output: Send + 'static;
}

/// A fact that already happened.
///
/// Events may have zero, one or many handlers. Handler return values are
/// discarded; only commands produce a caller-visible result.
pub trait Event: Message {}

/// Unqualified type name, with generic parameters stripped.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Object-safe view of a message: serializable, debuggable, downcastable.
pub(crate) trait ErasedMessage: erased_serde::Serialize + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

erased_serde::serialize_trait_object!(ErasedMessage);

impl<M: Message> ErasedMessage for M {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Type-erased message envelope.
///
/// `AnyMessage` is the unit the engine queues, dispatches and stages in the
/// outbox. It carries:
/// - the [`MessageKind`] (decides single-handler vs fan-out routing)
/// - the `TypeId` (registry lookup key)
/// - the stable message type identifier (serialization tag)
/// - the message itself
pub struct AnyMessage {
    kind: MessageKind,
    type_id: TypeId,
    message_type: &'static str,
    payload: Box<dyn ErasedMessage>,
}

impl AnyMessage {
    /// Wrap a command.
    pub fn command<C: Command>(command: C) -> Self {
        Self::new(MessageKind::Command, command)
    }

    /// Wrap an event.
    pub fn event<E: Event>(event: E) -> Self {
        Self::new(MessageKind::Event, event)
    }

    fn new<M: Message>(kind: MessageKind, message: M) -> Self {
        Self {
            kind,
            type_id: TypeId::of::<M>(),
            message_type: M::message_type(),
            payload: Box::new(message),
        }
    }

    /// Command or event.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Stable message type identifier.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// `TypeId` of the wrapped message.
    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns true if the wrapped message is an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Borrow the wrapped message as an `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.payload.as_any().downcast_ref()
    }

    /// Take the wrapped message out as an `M`.
    ///
    /// Returns `None` if the message is not an `M`.
    pub fn into_message<M: Message>(self) -> Option<M> {
        if !self.is::<M>() {
            return None;
        }
        self.payload.into_any().downcast::<M>().ok().map(|boxed| *boxed)
    }

    /// Serialize the wrapped message to JSON.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&*self.payload)
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("kind", &self.kind)
            .field("message_type", &self.message_type)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlaceOrder {
        sku: String,
        quantity: u32,
    }
    impl Message for PlaceOrder {}
    impl Command for PlaceOrder {
        type Output = u32;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: u64,
    }
    impl Message for OrderShipped {
        fn message_type() -> &'static str {
            "order.shipped.v1"
        }
    }
    impl Event for OrderShipped {}

    #[derive(Debug, Serialize)]
    struct Wrapper<T> {
        inner: T,
    }

    #[test]
    fn test_default_message_type_is_unqualified_name() {
        assert_eq!(PlaceOrder::message_type(), "PlaceOrder");
    }

    #[test]
    fn test_message_type_override() {
        assert_eq!(OrderShipped::message_type(), "order.shipped.v1");
        let msg = AnyMessage::event(OrderShipped { order_id: 7 });
        assert_eq!(msg.message_type(), "order.shipped.v1");
    }

    #[test]
    fn test_short_type_name_strips_generics() {
        assert_eq!(short_type_name::<Wrapper<PlaceOrder>>(), "Wrapper");
    }

    #[test]
    fn test_any_message_kind() {
        let cmd = AnyMessage::command(PlaceOrder {
            sku: "A-1".into(),
            quantity: 2,
        });
        assert_eq!(cmd.kind(), MessageKind::Command);
        assert!(cmd.kind().is_command());

        let event = AnyMessage::event(OrderShipped { order_id: 1 });
        assert_eq!(event.kind(), MessageKind::Event);
        assert!(event.kind().is_event());
    }

    #[test]
    fn test_any_message_downcast() {
        let msg = AnyMessage::command(PlaceOrder {
            sku: "A-1".into(),
            quantity: 2,
        });

        assert!(msg.is::<PlaceOrder>());
        assert!(!msg.is::<OrderShipped>());
        assert!(msg.downcast_ref::<OrderShipped>().is_none());
        assert_eq!(msg.downcast_ref::<PlaceOrder>().map(|c| c.quantity), Some(2));
        assert_eq!(msg.message_type_id(), TypeId::of::<PlaceOrder>());

        let cmd: PlaceOrder = msg.into_message().unwrap();
        assert_eq!(cmd.sku, "A-1");
    }

    #[test]
    fn test_into_message_wrong_type() {
        let msg = AnyMessage::event(OrderShipped { order_id: 1 });
        assert!(msg.into_message::<PlaceOrder>().is_none());
    }

    #[test]
    fn test_any_message_to_json() {
        let msg = AnyMessage::event(OrderShipped { order_id: 42 });
        assert_eq!(msg.to_json().unwrap(), serde_json::json!({ "order_id": 42 }));
    }

    #[test]
    fn test_any_message_debug() {
        let msg = AnyMessage::event(OrderShipped { order_id: 42 });
        let debug = format!("{:?}", msg);
        assert!(debug.contains("AnyMessage"));
        assert!(debug.contains("order.shipped.v1"));
        assert!(debug.contains("42"));
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::Command.to_string(), "command");
        assert_eq!(MessageKind::Event.to_string(), "event");
    }
}
