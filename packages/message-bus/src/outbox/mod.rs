//! Transactional outbox for reliable asynchronous delivery.
//!
//! The outbox pattern ensures messages are persisted in the same database
//! transaction as the business data that produced them, without distributed
//! transactions.
//!
//! # Overview
//!
//! 1. A handler writes business data AND calls [`MessageBus::register`] on the
//!    same open transaction
//! 2. The caller commits (or rolls back, discarding the record with the data)
//! 3. [`MessageBus::process_outbox`] claims unprocessed records with a locking
//!    read, replays each through the outbox handlers and marks it processed
//!
//! # Guarantees
//!
//! - **Persisted exactly once**: the record commits or rolls back with the data
//! - **Processed at-least-once**: a crash after delivery but before the
//!   `processed_at` update redelivers the record
//! - **Multi-instance safe**: concurrent drains never process the same record
//!   at the same time (`FOR UPDATE SKIP LOCKED` or equivalent)
//!
//! Retry and backoff are left to whatever schedules `process_outbox`; a failed
//! record is released and returned again by the next pass.
//!
//! [`MessageBus::register`]: crate::MessageBus::register
//! [`MessageBus::process_outbox`]: crate::MessageBus::process_outbox

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{AnyMessage, MessageKind};
use crate::error::BusError;

mod coordinator;
pub mod memory;
pub mod poller;
#[cfg(feature = "postgres")]
pub mod postgres;

// =============================================================================
// EnvelopeType
// =============================================================================

/// Whether a record wraps a command or an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    Command,
    Event,
}

impl EnvelopeType {
    /// Storage representation: `"COMMAND"` or `"EVENT"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Command => "COMMAND",
            EnvelopeType::Event => "EVENT",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "COMMAND" => Ok(EnvelopeType::Command),
            "EVENT" => Ok(EnvelopeType::Event),
            other => Err(anyhow!("unknown envelope type: {}", other)),
        }
    }
}

impl From<MessageKind> for EnvelopeType {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Command => EnvelopeType::Command,
            MessageKind::Event => EnvelopeType::Event,
        }
    }
}

impl From<EnvelopeType> for MessageKind {
    fn from(envelope: EnvelopeType) -> Self {
        match envelope {
            EnvelopeType::Command => MessageKind::Command,
            EnvelopeType::Event => MessageKind::Event,
        }
    }
}

// =============================================================================
// OutboxRecord
// =============================================================================

/// A durable envelope staging one message for later processing.
///
/// `processed_at` is `None` until processing succeeds and is set at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    id: Uuid,
    envelope_type: EnvelopeType,
    message_type: String,
    message: serde_json::Value,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build an unprocessed record for a message, with a fresh v4 id.
    pub fn from_message(message: &AnyMessage) -> Result<Self, BusError> {
        Ok(Self {
            id: Uuid::new_v4(),
            envelope_type: message.kind().into(),
            message_type: message.message_type().to_string(),
            message: message.to_json()?,
            metadata: None,
            created_at: Utc::now(),
            processed_at: None,
        })
    }

    /// Attach free-form metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Rebuild a record from storage.
    pub fn restore(
        id: Uuid,
        envelope_type: EnvelopeType,
        message_type: String,
        message: serde_json::Value,
        metadata: Option<serde_json::Value>,
        created_at: DateTime<Utc>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            envelope_type,
            message_type,
            message,
            metadata,
            created_at,
            processed_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn envelope_type(&self) -> EnvelopeType {
        self.envelope_type
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The serialized message payload.
    pub fn message(&self) -> &serde_json::Value {
        &self.message
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Set `processed_at`. Fails if it was already set.
    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> Result<(), BusError> {
        if self.processed_at.is_some() {
            return Err(BusError::AlreadyProcessed { id: self.id });
        }
        self.processed_at = Some(at);
        Ok(())
    }
}

// =============================================================================
// OutboxModel
// =============================================================================

/// Describes where a repository stores records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxModel {
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

impl OutboxModel {
    pub const TABLE: &'static str = "message_outbox";

    pub const COLUMNS: &'static [&'static str] = &[
        "id",
        "envelope_type",
        "message_type",
        "message",
        "metadata",
        "created_at",
        "processed_at",
    ];
}

impl Default for OutboxModel {
    fn default() -> Self {
        Self {
            table: Self::TABLE,
            columns: Self::COLUMNS,
        }
    }
}

// =============================================================================
// OutboxRepository
// =============================================================================

/// Storage for outbox records.
///
/// # Implementer Notes
///
/// - `add` must write inside the caller's open transaction and never commit
/// - `list_unprocessed` must be a locking read: rows returned to one caller are
///   skipped by concurrent callers until updated or released
/// - `update_processed` must persist immediately, one record at a time
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Stage a record in the current transaction.
    async fn add(&self, record: OutboxRecord) -> Result<()>;

    /// Claim and return unprocessed records, oldest first.
    async fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>>;

    /// Persist `processed_at` for one record.
    async fn update_processed(&self, record: &OutboxRecord, processed_at: DateTime<Utc>)
        -> Result<()>;

    /// End this caller's claim on a record without processing it.
    async fn release(&self, _record: &OutboxRecord) -> Result<()> {
        Ok(())
    }

    fn model(&self) -> OutboxModel {
        OutboxModel::default()
    }
}

#[async_trait]
impl<R: OutboxRepository + ?Sized> OutboxRepository for Arc<R> {
    async fn add(&self, record: OutboxRecord) -> Result<()> {
        (**self).add(record).await
    }

    async fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
        (**self).list_unprocessed().await
    }

    async fn update_processed(
        &self,
        record: &OutboxRecord,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        (**self).update_processed(record, processed_at).await
    }

    async fn release(&self, record: &OutboxRecord) -> Result<()> {
        (**self).release(record).await
    }

    fn model(&self) -> OutboxModel {
        (**self).model()
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome for one record of a `process_outbox` pass.
#[derive(Debug)]
pub struct RecordOutcome {
    pub record_id: Uuid,
    pub message_type: String,
    /// The `processed_at` timestamp, or why the record was left unprocessed.
    pub result: Result<DateTime<Utc>, BusError>,
}

impl RecordOutcome {
    pub fn is_processed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-record outcomes of one `process_outbox` pass, in processing order.
#[derive(Debug, Default)]
pub struct OutboxReport {
    outcomes: Vec<RecordOutcome>,
}

impl OutboxReport {
    pub(crate) fn new(outcomes: Vec<RecordOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[RecordOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<RecordOutcome> {
        self.outcomes
    }

    /// Number of records marked processed.
    pub fn processed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_processed()).count()
    }

    /// Number of records left unprocessed.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.processed()
    }

    /// Returns true if no records were touched.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Returns true if every record was processed.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}
