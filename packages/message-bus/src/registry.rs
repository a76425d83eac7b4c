//! Handler registration table.
//!
//! Maps a message's `TypeId` to its handler(s). The registry is generic over
//! the erased handler types so that the async bus and the blocking bus share
//! one routing implementation.

use std::any::TypeId;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::core::{AnyMessage, MessageKind};
use crate::error::BusError;

/// What `resolve` found for a message.
pub(crate) enum Resolved<'a, C: ?Sized, E: ?Sized> {
    /// The single handler for a command.
    Command(&'a C),
    /// The ordered handler list for an event. May be empty.
    Events(&'a [Box<E>]),
}

/// Per-engine registration table. There is no global registry.
pub(crate) struct HandlerRegistry<C: ?Sized, E: ?Sized, O: ?Sized> {
    commands: HashMap<TypeId, Box<C>>,
    events: HashMap<TypeId, Vec<Box<E>>>,
    outbox: Vec<Box<O>>,
}

impl<C: ?Sized, E: ?Sized, O: ?Sized> Default for HandlerRegistry<C, E, O> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            events: HashMap::new(),
            outbox: Vec::new(),
        }
    }
}

impl<C: ?Sized, E: ?Sized, O: ?Sized> HandlerRegistry<C, E, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for a command type. Last write wins.
    pub fn set_command_handler(&mut self, type_id: TypeId, message_type: &str, handler: Box<C>) {
        if self.commands.insert(type_id, handler).is_some() {
            warn!(message_type, "command handler replaced");
        } else {
            debug!(message_type, "command handler registered");
        }
    }

    /// Replace the handler list for an event type.
    pub fn set_event_handlers(&mut self, type_id: TypeId, message_type: &str, handlers: Vec<Box<E>>) {
        debug!(message_type, count = handlers.len(), "event handlers set");
        self.events.insert(type_id, handlers);
    }

    /// Append one handler to an event type's list.
    pub fn add_event_handler(&mut self, type_id: TypeId, message_type: &str, handler: Box<E>) {
        let handlers = self.events.entry(type_id).or_default();
        handlers.push(handler);
        debug!(message_type, count = handlers.len(), "event handler added");
    }

    /// Replace the outbox handler list.
    pub fn set_outbox_handlers(&mut self, handlers: Vec<Box<O>>) {
        debug!(count = handlers.len(), "outbox handlers set");
        self.outbox = handlers;
    }

    /// Append one outbox handler.
    pub fn add_outbox_handler(&mut self, handler: Box<O>) {
        self.outbox.push(handler);
    }

    /// Find the handler(s) for a message.
    ///
    /// Unregistered events resolve to an empty list. Unregistered commands
    /// are an error.
    pub fn resolve(&self, message: &AnyMessage) -> Result<Resolved<'_, C, E>, BusError> {
        let type_id = message.message_type_id();
        match message.kind() {
            MessageKind::Command => self
                .commands
                .get(&type_id)
                .map(|handler| Resolved::Command(&**handler))
                .ok_or_else(|| BusError::NoHandlerRegistered {
                    message_type: message.message_type().to_string(),
                }),
            MessageKind::Event => Ok(Resolved::Events(
                self.events
                    .get(&type_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
            )),
        }
    }

    pub fn outbox_handlers(&self) -> &[Box<O>] {
        &self.outbox
    }

    pub fn has_command_handler(&self, type_id: TypeId) -> bool {
        self.commands.contains_key(&type_id)
    }

    pub fn command_handler_count(&self) -> usize {
        self.commands.len()
    }

    pub fn event_handler_count(&self, type_id: TypeId) -> usize {
        self.events.get(&type_id).map_or(0, Vec::len)
    }

    pub fn outbox_handler_count(&self) -> usize {
        self.outbox.len()
    }
}
