//! Market-aware background scheduler.
//!
//! A fixed-interval timer drives [`MarketScheduler::tick_at`]. Each tick
//! classifies wall-clock time and then does one of:
//!
//! ```text
//! OPEN    -> clear pending work, mark session, await decision task
//! BREAK   -> clear pending work, mark session
//! CLOSED  -> idle: nothing
//!            otherwise: arm update once per close, then start at most one
//!            background job (update before scan)
//!
//! update Success -> scan launched from the update task itself
//! update NoData  -> done for the day
//! Failure/panic  -> pending flag stays set, retried next closed tick
//! ```
//!
//! All state lives in one [`SchedulerContext`] behind a `std::sync::Mutex`
//! that is never held across an `.await`.

mod context;
mod jobs;

pub use context::{JobSlot, SchedulerContext};
pub use jobs::{BackgroundJob, DecisionTask, JobKind, JobOutcome};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use smartquant_common::logging::generate_run_id;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::session::MarketSession;

/// Consecutive failures of one job kind before the log escalates to error.
const FAILURE_ALERT_THRESHOLD: u32 = 5;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub session: MarketSession,
    pub decision_ran: bool,
    pub launched: Option<JobKind>,
}

/// Point-in-time view of the scheduler for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub session: MarketSession,
    pub period_minutes: u64,
    pub was_market_open: bool,
    pub update_pending: bool,
    pub scan_pending: bool,
    pub update_running: bool,
    pub scan_running: bool,
    pub update_failures: u32,
    pub scan_failures: u32,
    pub last_update: Option<JobOutcome>,
    pub last_scan: Option<JobOutcome>,
}

struct Shared {
    context: Mutex<SchedulerContext>,
    update_job: Arc<dyn BackgroundJob>,
    scan_job: Arc<dyn BackgroundJob>,
    decision: Arc<dyn DecisionTask>,
    period: Duration,
}

/// Market-aware scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MarketScheduler {
    shared: Arc<Shared>,
}

impl MarketScheduler {
    /// Create a scheduler ticking every `period`.
    pub fn new(
        update_job: Arc<dyn BackgroundJob>,
        scan_job: Arc<dyn BackgroundJob>,
        decision: Arc<dyn DecisionTask>,
        period: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                context: Mutex::new(SchedulerContext::new()),
                update_job,
                scan_job,
                decision,
                period: period.max(Duration::from_secs(1)),
            }),
        }
    }

    /// Run the timer loop for the life of the process. The first tick fires
    /// immediately.
    pub async fn run(&self) {
        info!(
            period_secs = self.shared.period.as_secs(),
            update_job = self.shared.update_job.name(),
            scan_job = self.shared.scan_job.name(),
            "Market scheduler started"
        );

        let mut ticker = interval(self.shared.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.tick_at(Local::now().naive_local()).await;
            debug!(
                session = %report.session,
                decision_ran = report.decision_ran,
                launched = ?report.launched,
                "Scheduler tick"
            );
        }
    }

    /// Evaluate one tick at the given local time.
    pub async fn tick_at(&self, now: NaiveDateTime) -> TickReport {
        let session = MarketSession::classify(now);
        let mut report = TickReport {
            session,
            decision_ran: false,
            launched: None,
        };

        match session {
            MarketSession::Open => {
                self.shared.lock().enter_session();
                report.decision_ran = true;
                if let Err(e) = self.shared.decision.run().await {
                    error!(error = %e, "Decision task failed");
                }
            }
            MarketSession::Break => {
                self.shared.lock().enter_session();
            }
            MarketSession::Closed => {
                report.launched = self.shared.on_closed_tick();
            }
        }

        report
    }

    /// Start the update job if it is pending and nothing is in flight.
    pub fn try_start_update(&self) -> bool {
        let mut ctx = self.shared.lock();
        self.shared.try_start_update(&mut ctx)
    }

    /// Start the scan job if it is pending and nothing is in flight.
    pub fn try_start_scan(&self) -> bool {
        let mut ctx = self.shared.lock();
        self.shared.try_start_scan(&mut ctx)
    }

    /// Current flags and slot liveness.
    pub fn status(&self) -> SchedulerStatus {
        self.status_at(Local::now().naive_local())
    }

    pub fn status_at(&self, now: NaiveDateTime) -> SchedulerStatus {
        let ctx = self.shared.lock();
        SchedulerStatus {
            session: MarketSession::classify(now),
            period_minutes: self.shared.period.as_secs() / 60,
            was_market_open: ctx.was_market_open,
            update_pending: ctx.update_pending,
            scan_pending: ctx.scan_pending,
            update_running: !ctx.update_slot.is_free(),
            scan_running: !ctx.scan_slot.is_free(),
            update_failures: ctx.update_slot.consecutive_failures(),
            scan_failures: ctx.scan_slot.consecutive_failures(),
            last_update: ctx.update_slot.last_outcome().cloned(),
            last_scan: ctx.scan_slot.last_outcome().cloned(),
        }
    }

    /// Wait until no background job is in flight, including chained scans.
    pub async fn wait_idle(&self) {
        loop {
            if !self.shared.lock().any_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerContext> {
        self.context.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_closed_tick(self: &Arc<Self>) -> Option<JobKind> {
        let mut ctx = self.lock();
        if !ctx.close_session() {
            return None;
        }

        match ctx.next_job() {
            Some(JobKind::Update) if self.try_start_update(&mut ctx) => Some(JobKind::Update),
            Some(JobKind::Scan) if self.try_start_scan(&mut ctx) => Some(JobKind::Scan),
            Some(_) => None,
            None => {
                if ctx.any_running() {
                    debug!("Background job in flight, skipping tick");
                }
                None
            }
        }
    }

    fn try_start_update(self: &Arc<Self>, ctx: &mut SchedulerContext) -> bool {
        if !ctx.update_pending || ctx.any_running() {
            return false;
        }
        ctx.update_slot.occupy(self.spawn_job(JobKind::Update));
        true
    }

    fn try_start_scan(self: &Arc<Self>, ctx: &mut SchedulerContext) -> bool {
        if ctx.update_pending || !ctx.update_slot.is_free() {
            return false;
        }
        self.launch_scan(ctx)
    }

    /// Scan launch that ignores the update slot, used for the chained launch
    /// from inside the update task.
    fn launch_scan(self: &Arc<Self>, ctx: &mut SchedulerContext) -> bool {
        if !ctx.scan_pending || !ctx.scan_slot.is_free() {
            return false;
        }
        ctx.scan_slot.occupy(self.spawn_job(JobKind::Scan));
        true
    }

    fn spawn_job(self: &Arc<Self>, kind: JobKind) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let job = match kind {
            JobKind::Update => Arc::clone(&self.update_job),
            JobKind::Scan => Arc::clone(&self.scan_job),
        };

        tokio::spawn(async move {
            let run_id = generate_run_id();
            info!(job = kind.name(), name = job.name(), run_id = %run_id, "Background job started");

            let outcome = run_guarded(job).await;
            shared.finish(kind, &outcome, &run_id);
        })
    }

    fn finish(self: &Arc<Self>, kind: JobKind, outcome: &JobOutcome, run_id: &str) {
        let mut ctx = self.lock();

        let failures = match kind {
            JobKind::Update => {
                let chain = ctx.on_update_result(outcome);
                if chain && self.launch_scan(&mut ctx) {
                    info!(run_id = %run_id, "Update succeeded, scan job launched");
                }
                ctx.update_slot.consecutive_failures()
            }
            JobKind::Scan => {
                ctx.on_scan_result(outcome);
                ctx.scan_slot.consecutive_failures()
            }
        };

        match outcome {
            JobOutcome::Success(msg) | JobOutcome::NoData(msg) => {
                info!(job = kind.name(), run_id = %run_id, message = %msg, "Background job finished");
            }
            JobOutcome::Failure(msg) if failures >= FAILURE_ALERT_THRESHOLD => {
                error!(
                    job = kind.name(),
                    run_id = %run_id,
                    consecutive_failures = failures,
                    message = %msg,
                    "Background job keeps failing, will retry next tick"
                );
            }
            JobOutcome::Failure(msg) => {
                warn!(
                    job = kind.name(),
                    run_id = %run_id,
                    consecutive_failures = failures,
                    message = %msg,
                    "Background job failed, will retry next tick"
                );
            }
        }
    }
}

/// Run a job on its own task so a panic becomes a failure outcome.
async fn run_guarded(job: Arc<dyn BackgroundJob>) -> JobOutcome {
    let name = job.name().to_string();
    match tokio::spawn(async move { job.run().await }).await {
        Ok(outcome) => outcome,
        Err(e) => JobOutcome::Failure(format!("{} job aborted: {}", name, e)),
    }
}
