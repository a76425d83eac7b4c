use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::{OutboxRecord, OutboxReport, OutboxRepository, RecordOutcome};
use crate::bus::MessageBus;
use crate::context::Context;
use crate::core::AnyMessage;
use crate::error::BusError;
use crate::handler::{run_outbox_handler, OutboxHandler};

impl MessageBus {
    /// Stage a message in the caller's open transaction.
    ///
    /// Builds the record (fresh id, creation timestamp, envelope and message
    /// type, JSON payload) and hands it to `repo.add`. Never commits: the
    /// record becomes visible when the caller commits, and disappears if the
    /// caller rolls back.
    #[instrument(skip_all, fields(message_type = message.message_type()))]
    pub async fn register<R>(&self, repo: &R, message: &AnyMessage) -> Result<OutboxRecord, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        let record = OutboxRecord::from_message(message)?;
        self.stage(repo, record).await
    }

    /// [`register`](Self::register) with free-form metadata stored alongside the message.
    #[instrument(skip_all, fields(message_type = message.message_type()))]
    pub async fn register_with_metadata<R>(
        &self,
        repo: &R,
        message: &AnyMessage,
        metadata: serde_json::Value,
    ) -> Result<OutboxRecord, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        let record = OutboxRecord::from_message(message)?.with_metadata(metadata);
        self.stage(repo, record).await
    }

    async fn stage<R>(&self, repo: &R, record: OutboxRecord) -> Result<OutboxRecord, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        repo.add(record.clone()).await.map_err(BusError::Persistence)?;
        debug!(record_id = %record.id(), "outbox record staged");
        Ok(record)
    }

    /// Drain unprocessed outbox records through the outbox handlers.
    ///
    /// With no outbox handlers registered this returns an empty report
    /// without touching the repository, so no rows are locked. Otherwise each
    /// claimed record runs through every handler in order, stopping at the
    /// first failure. A processed record gets `processed_at` persisted
    /// immediately; a failed one is released and left for the next pass. One
    /// record's failure never stops the pass.
    #[instrument(skip_all)]
    pub async fn process_outbox<R>(
        &self,
        repo: &R,
        context: &mut Context,
    ) -> Result<OutboxReport, BusError>
    where
        R: OutboxRepository + ?Sized,
    {
        let handlers = self.registry.outbox_handlers();
        if handlers.is_empty() {
            debug!("no outbox handlers registered, skipping");
            return Ok(OutboxReport::default());
        }

        let records = repo
            .list_unprocessed()
            .await
            .map_err(BusError::Persistence)?;
        if records.is_empty() {
            return Ok(OutboxReport::default());
        }
        debug!(count = records.len(), "processing outbox records");

        let mut outcomes = Vec::with_capacity(records.len());
        for mut record in records {
            let result = process_record(repo, handlers, &mut record, context).await;
            outcomes.push(RecordOutcome {
                record_id: record.id(),
                message_type: record.message_type().to_string(),
                result,
            });
        }

        let report = OutboxReport::new(outcomes);
        info!(
            processed = report.processed(),
            failed = report.failed(),
            "outbox pass complete"
        );
        Ok(report)
    }
}

async fn process_record<R>(
    repo: &R,
    handlers: &[Box<dyn OutboxHandler>],
    record: &mut OutboxRecord,
    context: &mut Context,
) -> Result<DateTime<Utc>, BusError>
where
    R: OutboxRepository + ?Sized,
{
    for handler in handlers {
        if let Err(e) = run_outbox_handler(handler.as_ref(), record, context).await {
            error!(
                record_id = %record.id(),
                handler = handler.name(),
                error = ?e,
                "outbox handler failed"
            );
            release(repo, record).await;
            return Err(BusError::handler_failed(
                record.message_type(),
                handler.name(),
                e,
            ));
        }
    }

    let processed_at = Utc::now();
    if let Err(e) = repo.update_processed(record, processed_at).await {
        error!(record_id = %record.id(), error = ?e, "failed to persist processed_at");
        release(repo, record).await;
        return Err(BusError::Persistence(e));
    }
    record.mark_processed(processed_at)?;

    debug!(record_id = %record.id(), "outbox record processed");
    Ok(processed_at)
}

async fn release<R>(repo: &R, record: &OutboxRecord)
where
    R: OutboxRepository + ?Sized,
{
    if let Err(e) = repo.release(record).await {
        warn!(record_id = %record.id(), error = ?e, "failed to release outbox record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, Message};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Serialize)]
    struct Shipped(u32);
    impl Message for Shipped {}
    impl Event for Shipped {}

    /// Repository with scripted failures that counts every call.
    #[derive(Default)]
    struct Scripted {
        rows: Mutex<Vec<OutboxRecord>>,
        fail_add: bool,
        fail_list: bool,
        fail_update: bool,
        lists: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl OutboxRepository for Scripted {
        async fn add(&self, record: OutboxRecord) -> Result<()> {
            if self.fail_add {
                return Err(anyhow!("insert failed"));
            }
            self.rows.lock().unwrap().push(record);
            Ok(())
        }

        async fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail_list {
                return Err(anyhow!("connection reset"));
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn update_processed(&self, _record: &OutboxRecord, _at: DateTime<Utc>) -> Result<()> {
            if self.fail_update {
                return Err(anyhow!("update failed"));
            }
            Ok(())
        }

        async fn release(&self, _record: &OutboxRecord) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Accept;

    #[async_trait]
    impl OutboxHandler for Accept {
        async fn handle(&self, _record: &OutboxRecord, _context: &mut Context) -> Result<()> {
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl OutboxHandler for Panics {
        async fn handle(&self, _record: &OutboxRecord, _context: &mut Context) -> Result<()> {
            panic!("transport exploded")
        }
    }

    async fn seeded(repo: &Scripted) {
        MessageBus::new()
            .register(repo, &AnyMessage::event(Shipped(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_maps_add_failure_to_persistence() {
        let repo = Scripted {
            fail_add: true,
            ..Default::default()
        };

        let err = MessageBus::new()
            .register(&repo, &AnyMessage::event(Shipped(1)))
            .await
            .unwrap_err();

        assert!(err.is_persistence());
    }

    #[tokio::test]
    async fn test_no_handlers_does_not_touch_repository() {
        let repo = Scripted::default();
        seeded(&repo).await;

        let report = MessageBus::new()
            .process_outbox(&repo, &mut Context::new())
            .await
            .unwrap();

        assert!(report.is_empty());
        assert_eq!(repo.lists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_list_failure_is_persistence_error() {
        let repo = Scripted {
            fail_list: true,
            ..Default::default()
        };

        let err = MessageBus::new()
            .with_outbox_handler(Accept)
            .process_outbox(&repo, &mut Context::new())
            .await
            .unwrap_err();

        assert!(err.is_persistence());
    }

    #[tokio::test]
    async fn test_update_failure_releases_record() {
        let repo = Scripted {
            fail_update: true,
            ..Default::default()
        };
        seeded(&repo).await;

        let report = MessageBus::new()
            .with_outbox_handler(Accept)
            .process_outbox(&repo, &mut Context::new())
            .await
            .unwrap();

        assert_eq!(report.failed(), 1);
        assert!(matches!(
            report.outcomes()[0].result,
            Err(BusError::Persistence(_))
        ));
        assert_eq!(repo.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_only_its_record() {
        let repo = Scripted::default();
        seeded(&repo).await;
        seeded(&repo).await;

        let report = MessageBus::new()
            .with_outbox_handler(Panics)
            .process_outbox(&repo, &mut Context::new())
            .await
            .unwrap();

        assert_eq!(report.outcomes().len(), 2);
        assert_eq!(report.failed(), 2);
        assert_eq!(repo.released.load(Ordering::SeqCst), 2);
        let err = report.outcomes()[0].result.as_ref().unwrap_err();
        assert!(err.to_string().contains("handler panicked: transport exploded"));
    }
}
