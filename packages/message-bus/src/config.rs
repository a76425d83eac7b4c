use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;

/// What happens to a failing command's emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmissionPolicy {
    /// Keep what the failing command emitted, drain the queue to quiescence,
    /// then return the first command failure.
    #[default]
    Drain,
    /// Drop the failing command's emissions and stop draining immediately.
    Discard,
}

impl FromStr for EmissionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(EmissionPolicy::Drain),
            "discard" => Ok(EmissionPolicy::Discard),
            other => Err(anyhow!("unknown emission policy: {}", other)),
        }
    }
}

impl fmt::Display for EmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmissionPolicy::Drain => write!(f, "drain"),
            EmissionPolicy::Discard => write!(f, "discard"),
        }
    }
}

/// How `batch_handle` reacts to a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Every message is handled regardless of earlier failures.
    #[default]
    ContinueOnFailure,
    /// After the first failure the rest are reported as not attempted.
    StopOnFailure,
}

impl FromStr for BatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "continue" | "continue_on_failure" => Ok(BatchPolicy::ContinueOnFailure),
            "stop" | "stop_on_failure" => Ok(BatchPolicy::StopOnFailure),
            other => Err(anyhow!("unknown batch policy: {}", other)),
        }
    }
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusConfig {
    pub emission_policy: EmissionPolicy,
    pub batch_policy: BatchPolicy,
}

impl BusConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            emission_policy: lookup("MESSAGE_BUS_EMISSION_POLICY")
                .map(|value| value.parse::<EmissionPolicy>())
                .transpose()
                .context("MESSAGE_BUS_EMISSION_POLICY must be drain or discard")?
                .unwrap_or_default(),
            batch_policy: lookup("MESSAGE_BUS_BATCH_POLICY")
                .map(|value| value.parse::<BatchPolicy>())
                .transpose()
                .context("MESSAGE_BUS_BATCH_POLICY must be continue or stop")?
                .unwrap_or_default(),
        })
    }

    pub fn with_emission_policy(mut self, policy: EmissionPolicy) -> Self {
        self.emission_policy = policy;
        self
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }
}

/// Outbox poller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between `process_outbox` passes.
    pub poll_interval: Duration,
    /// How long a claimed record stays invisible to other workers.
    pub lease: Duration,
    /// Only required by the PostgreSQL repository.
    pub database_url: Option<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lease: Duration::from_secs(30),
            database_url: None,
        }
    }
}

impl PollerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let poll_interval = match lookup("MESSAGE_BUS_POLL_INTERVAL_MS") {
            Some(value) => Duration::from_millis(
                value
                    .trim()
                    .parse::<u64>()
                    .context("MESSAGE_BUS_POLL_INTERVAL_MS must be a valid number")?,
            ),
            None => defaults.poll_interval,
        };
        let lease = match lookup("MESSAGE_BUS_LEASE_MS") {
            Some(value) => Duration::from_millis(
                value
                    .trim()
                    .parse::<u64>()
                    .context("MESSAGE_BUS_LEASE_MS must be a valid number")?,
            ),
            None => defaults.lease,
        };

        if poll_interval.is_zero() {
            return Err(anyhow!("MESSAGE_BUS_POLL_INTERVAL_MS must be greater than zero"));
        }

        Ok(Self {
            poll_interval,
            lease,
            database_url: lookup("DATABASE_URL"),
        })
    }

    /// The database URL, or an error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }
}
