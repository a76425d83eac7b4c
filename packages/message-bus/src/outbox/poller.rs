//! Timer loop that drains the outbox until shut down.
//!
//! The poller owns no retry policy: each pass calls
//! [`MessageBus::process_outbox`] on a fresh repository and a fresh
//! [`Context`]; records that failed are released by the coordinator and picked
//! up again on a later pass. The configured lease is applied when the factory
//! builds each repository, e.g. `move || PgOutboxRepository::from_config(pool.clone(), &config)`.
//!
//! # Example
//!
//! ```ignore
//! let store = InMemoryOutbox::new();
//! let poller = OutboxPoller::new(bus.clone(), move || store.session(), PollerConfig::from_env()?);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = tokio::spawn(async move { poller.run(shutdown_rx).await });
//!
//! // later
//! shutdown_tx.send(true)?;
//! let stats = handle.await?;
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use super::{OutboxReport, OutboxRepository};
use crate::bus::MessageBus;
use crate::config::PollerConfig;
use crate::context::Context;
use crate::error::BusError;

/// Totals across every pass of one [`OutboxPoller::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub passes: u64,
    pub processed: u64,
    pub failed: u64,
    /// Passes that failed as a whole (e.g. the locking read).
    pub errors: u64,
}

impl PollerStats {
    fn record(&mut self, report: &OutboxReport) {
        self.passes += 1;
        self.processed += report.processed() as u64;
        self.failed += report.failed() as u64;
    }
}

type ContextFactory = Box<dyn Fn() -> Context + Send + Sync>;

/// Periodically runs `process_outbox` against repositories built by a factory.
pub struct OutboxPoller<F> {
    bus: Arc<MessageBus>,
    repository: F,
    context: ContextFactory,
    config: PollerConfig,
}

impl<F, R> OutboxPoller<F>
where
    F: Fn() -> R + Send + Sync,
    R: OutboxRepository,
{
    /// `repository` is called once per pass; each pass gets its own session.
    pub fn new(bus: Arc<MessageBus>, repository: F, config: PollerConfig) -> Self {
        Self {
            bus,
            repository,
            context: Box::new(Context::new),
            config,
        }
    }

    /// Build the per-pass [`Context`] (e.g. to insert a database handle).
    pub fn with_context_factory(
        mut self,
        factory: impl Fn() -> Context + Send + Sync + 'static,
    ) -> Self {
        self.context = Box::new(factory);
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// One `process_outbox` pass.
    pub async fn run_once(&self) -> Result<OutboxReport, BusError> {
        let repository = (self.repository)();
        let mut context = (self.context)();
        self.bus.process_outbox(&repository, &mut context).await
    }

    /// Poll until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// A pass in progress always completes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PollerStats {
        let mut stats = PollerStats::default();
        if *shutdown.borrow() {
            return stats;
        }

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_interval = ?self.config.poll_interval, "outbox poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) => stats.record(&report),
                        Err(e) => {
                            error!(error = %e, "outbox pass failed");
                            stats.passes += 1;
                            stats.errors += 1;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            passes = stats.passes,
            processed = stats.processed,
            failed = stats.failed,
            "outbox poller stopped"
        );
        stats
    }
}
