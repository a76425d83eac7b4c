//! In-memory outbox store.
//!
//! [`InMemoryOutbox`] is the shared "table". Each [`InMemoryOutboxSession`]
//! behaves like one database transaction against it:
//!
//! - `add` stages records that only become visible on [`commit`]
//! - [`rollback`] or dropping the session discards staged records
//! - `list_unprocessed` claims rows for the session; rows claimed by another
//!   live session are skipped, like `FOR UPDATE SKIP LOCKED`
//! - a claim ends on `update_processed`, `release`, commit, rollback or drop
//!
//! Used by the test suite and by embedders that want outbox semantics without
//! a database.
//!
//! [`commit`]: InMemoryOutboxSession::commit
//! [`rollback`]: InMemoryOutboxSession::rollback

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{OutboxModel, OutboxRecord, OutboxRepository};
use crate::blocking;
use crate::error::BusError;

struct StoredRecord {
    record: OutboxRecord,
    claimed_by: Option<Uuid>,
}

/// Shared in-memory outbox table. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    rows: Arc<Mutex<Vec<StoredRecord>>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session (one "transaction").
    pub fn session(&self) -> InMemoryOutboxSession {
        InMemoryOutboxSession {
            store: self.clone(),
            id: Uuid::new_v4(),
            staged: Mutex::new(Vec::new()),
        }
    }

    fn rows(&self) -> MutexGuard<'_, Vec<StoredRecord>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all committed records in insertion order.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.rows().iter().map(|row| row.record.clone()).collect()
    }

    /// Look up one committed record.
    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.rows()
            .iter()
            .find(|row| row.record.id() == id)
            .map(|row| row.record.clone())
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.rows()
            .iter()
            .filter(|row| !row.record.is_processed())
            .count()
    }

    /// Delete processed records older than `cutoff`. Returns how many were removed.
    pub fn purge_processed(&self, cutoff: DateTime<Utc>) -> usize {
        let mut rows = self.rows();
        let before = rows.len();
        rows.retain(|row| !row.record.processed_at().is_some_and(|at| at < cutoff));
        before - rows.len()
    }
}

impl std::fmt::Debug for InMemoryOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutbox")
            .field("len", &self.len())
            .field("unprocessed", &self.unprocessed_count())
            .finish()
    }
}

/// One "transaction" against an [`InMemoryOutbox`].
pub struct InMemoryOutboxSession {
    store: InMemoryOutbox,
    id: Uuid,
    staged: Mutex<Vec<OutboxRecord>>,
}

impl InMemoryOutboxSession {
    /// Identifies this session's claims.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of records added but not yet committed.
    pub fn staged_count(&self) -> usize {
        self.staged().len()
    }

    /// Publish staged records and end every claim held by this session.
    pub fn commit(self) {
        let staged = std::mem::take(&mut *self.staged());
        debug!(session = %self.id, count = staged.len(), "outbox session committed");
        self.store
            .rows()
            .extend(staged.into_iter().map(|record| StoredRecord {
                record,
                claimed_by: None,
            }));
    }

    /// Discard staged records and end every claim held by this session.
    pub fn rollback(self) {
        debug!(session = %self.id, count = self.staged_count(), "outbox session rolled back");
    }

    fn staged(&self) -> MutexGuard<'_, Vec<OutboxRecord>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, record: OutboxRecord) {
        self.staged().push(record);
    }

    fn claim_unprocessed(&self) -> Vec<OutboxRecord> {
        let mut rows = self.store.rows();
        let mut claimed: Vec<OutboxRecord> = rows
            .iter_mut()
            .filter(|row| !row.record.is_processed())
            .filter(|row| !matches!(row.claimed_by, Some(owner) if owner != self.id))
            .map(|row| {
                row.claimed_by = Some(self.id);
                row.record.clone()
            })
            .collect();
        claimed.sort_by_key(|record| record.created_at());
        claimed
    }

    fn persist_processed(&self, record: &OutboxRecord, processed_at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.store.rows();
        let row = rows
            .iter_mut()
            .find(|row| row.record.id() == record.id())
            .ok_or_else(|| anyhow!("outbox record {} not found", record.id()))?;

        if let Some(owner) = row.claimed_by.filter(|owner| *owner != self.id) {
            return Err(anyhow!(
                "outbox record {} is claimed by session {}",
                record.id(),
                owner
            ));
        }

        row.record.mark_processed(processed_at)?;
        row.claimed_by = None;
        Ok(())
    }

    fn release_claim(&self, record: &OutboxRecord) {
        if let Some(row) = self
            .store
            .rows()
            .iter_mut()
            .find(|row| row.record.id() == record.id() && row.claimed_by == Some(self.id))
        {
            row.claimed_by = None;
        }
    }
}

impl Drop for InMemoryOutboxSession {
    fn drop(&mut self) {
        for row in self.store.rows().iter_mut() {
            if row.claimed_by == Some(self.id) {
                row.claimed_by = None;
            }
        }
    }
}

impl std::fmt::Debug for InMemoryOutboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxSession")
            .field("id", &self.id)
            .field("staged", &self.staged_count())
            .finish()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxSession {
    async fn add(&self, record: OutboxRecord) -> Result<()> {
        self.stage(record);
        Ok(())
    }

    async fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
        Ok(self.claim_unprocessed())
    }

    async fn update_processed(
        &self,
        record: &OutboxRecord,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.persist_processed(record, processed_at)
    }

    async fn release(&self, record: &OutboxRecord) -> Result<()> {
        self.release_claim(record);
        Ok(())
    }

    fn model(&self) -> OutboxModel {
        OutboxModel::default()
    }
}

impl blocking::OutboxRepository for InMemoryOutboxSession {
    fn add(&self, record: OutboxRecord) -> Result<()> {
        self.stage(record);
        Ok(())
    }

    fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
        Ok(self.claim_unprocessed())
    }

    fn update_processed(&self, record: &OutboxRecord, processed_at: DateTime<Utc>) -> Result<()> {
        self.persist_processed(record, processed_at)
    }

    fn release(&self, record: &OutboxRecord) -> Result<()> {
        self.release_claim(record);
        Ok(())
    }
}

/// Returns true if `err` is the set-once violation raised by `update_processed`.
pub fn is_already_processed(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BusError>(),
        Some(BusError::AlreadyProcessed { .. })
    )
}
