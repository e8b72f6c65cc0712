//! Job contracts driven by the market scheduler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// End-of-day history refresh
    Update,
    /// Screening scan that consumes the refreshed history
    Scan,
}

impl JobKind {
    /// Get job name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Scan => "scan",
        }
    }
}

/// Result of one background job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Work completed
    Success(String),
    /// Nothing to do today (non-trading day, provider has no rows yet)
    NoData(String),
    /// Work failed and should be retried
    Failure(String),
}

impl JobOutcome {
    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::NoData(m) | Self::Failure(m) => m,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// A background job launched on its own task.
///
/// Implementations report problems through [`JobOutcome::Failure`]; a panic
/// inside `run` is treated the same way by the scheduler.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    /// Job name for logging
    fn name(&self) -> &str;

    /// Run the job to completion.
    async fn run(&self) -> JobOutcome;
}

/// The decision step, awaited on the scheduler's timer task during open hours.
#[async_trait]
pub trait DecisionTask: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}
