//! Breadth-first drain state and the result of one top-level `handle` call.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use crate::config::EmissionPolicy;
use crate::core::{AnyMessage, MessageKind};
use crate::error::{BusError, HandlerFailure};

/// One message dispatched during a `handle` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kind: MessageKind,
    pub message_type: &'static str,
}

/// What a successful `handle` call produced.
///
/// - `output`: the root command's handler output (none for events)
/// - `trace`: every message dispatched, in breadth-first order, root first
/// - `failures`: event handler errors that were isolated from their siblings
#[derive(Default)]
pub struct Dispatched {
    output: Option<Box<dyn Any + Send>>,
    trace: Vec<DispatchRecord>,
    failures: Vec<HandlerFailure>,
}

impl Dispatched {
    pub(crate) fn new(
        output: Option<Box<dyn Any + Send>>,
        trace: Vec<DispatchRecord>,
        failures: Vec<HandlerFailure>,
    ) -> Self {
        Self {
            output,
            trace,
            failures,
        }
    }

    /// Borrow the root command's output as `T`.
    pub fn output<T: Any>(&self) -> Option<&T> {
        self.output.as_ref().and_then(|output| output.downcast_ref())
    }

    /// Take the root command's output as `T`.
    ///
    /// Returns `None` (and keeps the output) if it is not a `T`.
    pub fn take_output<T: Any>(&mut self) -> Option<T> {
        if !self.output.as_ref().is_some_and(|output| output.is::<T>()) {
            return None;
        }
        self.output
            .take()
            .and_then(|output| output.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// Returns true if the root message produced an output.
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Every message dispatched during the call, in dispatch order.
    pub fn trace(&self) -> &[DispatchRecord] {
        &self.trace
    }

    /// Message type identifiers in dispatch order.
    pub fn dispatched_types(&self) -> Vec<&'static str> {
        self.trace.iter().map(|record| record.message_type).collect()
    }

    /// Isolated event handler failures.
    pub fn failures(&self) -> &[HandlerFailure] {
        &self.failures
    }

    /// Returns true if no event handler failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("has_output", &self.output.is_some())
            .field("trace", &self.trace)
            .field("failures", &self.failures)
            .finish()
    }
}

/// Emission queue for one `handle` call, shared by the async and blocking engines.
///
/// The engine pops a message, invokes its handler(s) and reports back what
/// happened; the drain decides what to queue and whether to keep going.
pub(crate) struct Drain {
    policy: EmissionPolicy,
    queue: VecDeque<AnyMessage>,
    output: Option<Box<dyn Any + Send>>,
    trace: Vec<DispatchRecord>,
    failures: Vec<HandlerFailure>,
    first_error: Option<BusError>,
}

impl Drain {
    pub fn new(root: AnyMessage, policy: EmissionPolicy) -> Self {
        Self {
            policy,
            queue: VecDeque::from([root]),
            output: None,
            trace: Vec::new(),
            failures: Vec::new(),
            first_error: None,
        }
    }

    /// Pop the next message and record it in the trace. `true` marks the root.
    pub fn next_message(&mut self) -> Option<(AnyMessage, bool)> {
        let message = self.queue.pop_front()?;
        let root = self.trace.is_empty();
        self.trace.push(DispatchRecord {
            kind: message.kind(),
            message_type: message.message_type(),
        });
        Some((message, root))
    }

    /// Only the root command's output is kept.
    pub fn command_succeeded(
        &mut self,
        root: bool,
        output: Box<dyn Any + Send>,
        emitted: Vec<AnyMessage>,
    ) {
        if root {
            self.output = Some(output);
        }
        self.queue.extend(emitted);
    }

    /// Returns `Err` when draining must stop immediately.
    pub fn command_failed(
        &mut self,
        error: BusError,
        emitted: Vec<AnyMessage>,
    ) -> Result<(), BusError> {
        match self.policy {
            EmissionPolicy::Drain => {
                self.queue.extend(emitted);
                self.first_error.get_or_insert(error);
                Ok(())
            }
            EmissionPolicy::Discard => Err(error),
        }
    }

    pub fn event_handled(&mut self, emitted: Vec<AnyMessage>) {
        self.queue.extend(emitted);
    }

    pub fn event_failed(&mut self, failure: HandlerFailure, emitted: Vec<AnyMessage>) {
        if self.policy == EmissionPolicy::Drain {
            self.queue.extend(emitted);
        }
        self.failures.push(failure);
    }

    /// The first command failure, or everything the call produced.
    pub fn finish(self) -> Result<Dispatched, BusError> {
        match self.first_error {
            Some(error) => Err(error),
            None => Ok(Dispatched::new(self.output, self.trace, self.failures)),
        }
    }
}
