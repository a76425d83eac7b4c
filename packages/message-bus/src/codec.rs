//! Serialization boundary between messages and outbox payloads.
//!
//! Serialization needs no registration: every [`Message`] is `Serialize`.
//! Deserialization maps a message type identifier back to a concrete Rust type,
//! so every type that has to come back out of the outbox is registered here.
//!
//! # Schema Evolution
//!
//! Override [`Message::message_type`] with a versioned identifier
//! (`"order.shipped.v1"`). A new payload shape is a new type with a new
//! identifier; register both and old rows still decode.
//!
//! # Example
//!
//! ```ignore
//! let mut codec = MessageCodec::new();
//! codec.register_event::<OrderShipped>();
//! codec.register_command::<SendReceipt>();
//!
//! // In an outbox handler:
//! let message = codec.decode(record)?;
//! bus.handle(message, ctx).await?;
//! ```
//!
//! [`Message`]: crate::Message
//! [`Message::message_type`]: crate::Message::message_type

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::core::{AnyMessage, Command, Event, MessageKind};
use crate::error::BusError;
use crate::outbox::OutboxRecord;

type DecodeFn = Box<dyn Fn(&serde_json::Value) -> Result<AnyMessage, serde_json::Error> + Send + Sync>;

struct Decoder {
    kind: MessageKind,
    decode: DecodeFn,
}

/// Maps message type identifiers to deserializers.
#[derive(Default)]
pub struct MessageCodec {
    decoders: HashMap<&'static str, Decoder>,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command type under its [`message_type`](crate::Message::message_type).
    ///
    /// # Panics
    ///
    /// Panics if a type is already registered under the same identifier.
    pub fn register_command<C>(&mut self) -> &mut Self
    where
        C: Command + DeserializeOwned,
    {
        let decode: DecodeFn = Box::new(|payload: &serde_json::Value| {
            serde_json::from_value::<C>(payload.clone()).map(AnyMessage::command)
        });
        self.insert(C::message_type(), MessageKind::Command, decode)
    }

    /// Register an event type under its [`message_type`](crate::Message::message_type).
    ///
    /// # Panics
    ///
    /// Panics if a type is already registered under the same identifier.
    pub fn register_event<E>(&mut self) -> &mut Self
    where
        E: Event + DeserializeOwned,
    {
        let decode: DecodeFn = Box::new(|payload: &serde_json::Value| {
            serde_json::from_value::<E>(payload.clone()).map(AnyMessage::event)
        });
        self.insert(E::message_type(), MessageKind::Event, decode)
    }

    fn insert(&mut self, message_type: &'static str, kind: MessageKind, decode: DecodeFn) -> &mut Self {
        if self.decoders.contains_key(message_type) {
            panic!("deserializer already registered for message type: {}", message_type);
        }
        self.decoders.insert(message_type, Decoder { kind, decode });
        self
    }

    /// Serialize a message to its JSON payload.
    pub fn serialize(&self, message: &AnyMessage) -> Result<serde_json::Value, BusError> {
        Ok(message.to_json()?)
    }

    /// Rebuild a message from its type identifier and payload.
    ///
    /// # Errors
    ///
    /// - `UnknownMessageType` if nothing is registered under `message_type`
    /// - `Serialization` if the payload does not match the registered type
    pub fn deserialize(
        &self,
        message_type: &str,
        payload: &serde_json::Value,
    ) -> Result<AnyMessage, BusError> {
        let decoder = self
            .decoders
            .get(message_type)
            .ok_or_else(|| BusError::UnknownMessageType(message_type.to_string()))?;
        Ok((decoder.decode)(payload)?)
    }

    /// Rebuild the message stored in an outbox record.
    ///
    /// The record's envelope type must match the registered kind, otherwise
    /// this fails with `EnvelopeMismatch`.
    pub fn decode(&self, record: &OutboxRecord) -> Result<AnyMessage, BusError> {
        let stored = MessageKind::from(record.envelope_type());
        if let Some(registered) = self.kind_of(record.message_type()).filter(|kind| *kind != stored) {
            return Err(BusError::EnvelopeMismatch {
                message_type: record.message_type().to_string(),
                registered,
                stored,
            });
        }
        self.deserialize(record.message_type(), record.message())
    }

    /// The registered kind for an identifier.
    pub fn kind_of(&self, message_type: &str) -> Option<MessageKind> {
        self.decoders.get(message_type).map(|decoder| decoder.kind)
    }

    pub fn has(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("registered_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
