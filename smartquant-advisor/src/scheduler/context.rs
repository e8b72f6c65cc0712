//! Scheduler state and its transition rules.
//!
//! Everything here is synchronous and lock-free; [`super::MarketScheduler`]
//! owns the single mutex around a [`SchedulerContext`] and performs all
//! task spawning.

use tokio::task::JoinHandle;

use super::jobs::{JobKind, JobOutcome};

/// Holder of the single in-flight handle for one job kind.
#[derive(Debug, Default)]
pub struct JobSlot {
    handle: Option<JoinHandle<()>>,
    /// Consecutive failed runs, reset on success or no-data
    consecutive_failures: u32,
    last_outcome: Option<JobOutcome>,
}

impl JobSlot {
    /// A slot is free when it holds no handle or the task has finished.
    pub fn is_free(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn occupy(&mut self, handle: JoinHandle<()>) {
        self.handle = Some(handle);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_outcome(&self) -> Option<&JobOutcome> {
        self.last_outcome.as_ref()
    }

    fn record(&mut self, outcome: &JobOutcome) -> u32 {
        if outcome.is_failure() {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }
        self.last_outcome = Some(outcome.clone());
        self.consecutive_failures
    }
}

/// Process-wide scheduling state.
#[derive(Debug, Default)]
pub struct SchedulerContext {
    pub was_market_open: bool,
    pub update_pending: bool,
    pub scan_pending: bool,
    pub update_slot: JobSlot,
    pub scan_slot: JobSlot,
}

impl SchedulerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or break tick: a session is active, stale pending work is dropped.
    pub fn enter_session(&mut self) {
        self.update_pending = false;
        self.scan_pending = false;
        self.was_market_open = true;
    }

    /// Nothing armed and no session to close.
    pub fn is_idle(&self) -> bool {
        !self.was_market_open && !self.update_pending && !self.scan_pending
    }

    /// Closed tick. Arms the end-of-day update once per session close.
    ///
    /// Returns `false` in the idle state, meaning the tick does nothing.
    pub fn close_session(&mut self) -> bool {
        if self.is_idle() {
            return false;
        }
        if self.was_market_open {
            self.was_market_open = false;
            self.update_pending = true;
        }
        true
    }

    /// Whether any background job is in flight.
    pub fn any_running(&self) -> bool {
        !self.update_slot.is_free() || !self.scan_slot.is_free()
    }

    /// The job a closed tick should start, honoring single-flight and
    /// update-before-scan priority.
    pub fn next_job(&self) -> Option<JobKind> {
        if self.any_running() {
            None
        } else if self.update_pending {
            Some(JobKind::Update)
        } else if self.scan_pending {
            Some(JobKind::Scan)
        } else {
            None
        }
    }

    /// Record an update outcome. Returns `true` when the scan must be chained.
    pub fn on_update_result(&mut self, outcome: &JobOutcome) -> bool {
        self.update_slot.record(outcome);
        match outcome {
            JobOutcome::Success(_) => {
                self.update_pending = false;
                self.scan_pending = true;
                true
            }
            JobOutcome::NoData(_) => {
                self.update_pending = false;
                false
            }
            JobOutcome::Failure(_) => false,
        }
    }

    /// Record a scan outcome; only a failure keeps the scan armed.
    pub fn on_scan_result(&mut self, outcome: &JobOutcome) {
        self.scan_slot.record(outcome);
        if !outcome.is_failure() {
            self.scan_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_closed_tick_is_noop() {
        let mut ctx = SchedulerContext::new();
        assert!(!ctx.close_session());
        assert!(ctx.is_idle());
        assert_eq!(ctx.next_job(), None);
    }

    #[test]
    fn test_close_arms_update_once() {
        let mut ctx = SchedulerContext::new();
        ctx.enter_session();
        assert!(ctx.close_session());
        assert!(ctx.update_pending);
        assert!(!ctx.was_market_open);
        assert_eq!(ctx.next_job(), Some(JobKind::Update));

        // A second closed tick keeps the same single arming
        assert!(ctx.close_session());
        assert!(ctx.update_pending);
        assert!(!ctx.scan_pending);
    }

    #[test]
    fn test_session_clears_stale_pending_work() {
        let mut ctx = SchedulerContext::new();
        ctx.update_pending = true;
        ctx.scan_pending = true;
        ctx.enter_session();
        assert!(!ctx.update_pending);
        assert!(!ctx.scan_pending);
        assert!(ctx.was_market_open);
    }

    #[test]
    fn test_update_outcomes() {
        let mut ctx = SchedulerContext::new();
        ctx.update_pending = true;
        assert!(!ctx.on_update_result(&JobOutcome::Failure("net".into())));
        assert!(ctx.update_pending);
        assert_eq!(ctx.update_slot.consecutive_failures(), 1);

        assert!(!ctx.on_update_result(&JobOutcome::NoData("holiday".into())));
        assert!(!ctx.update_pending);
        assert!(!ctx.scan_pending);
        assert_eq!(ctx.update_slot.consecutive_failures(), 0);

        ctx.update_pending = true;
        assert!(ctx.on_update_result(&JobOutcome::Success("ok".into())));
        assert!(!ctx.update_pending);
        assert!(ctx.scan_pending);
        assert_eq!(ctx.next_job(), Some(JobKind::Scan));
    }

    #[test]
    fn test_scan_outcomes() {
        let mut ctx = SchedulerContext::new();
        ctx.scan_pending = true;
        ctx.on_scan_result(&JobOutcome::Failure("io".into()));
        assert!(ctx.scan_pending);
        ctx.on_scan_result(&JobOutcome::Success("3 hits".into()));
        assert!(!ctx.scan_pending);
        assert_eq!(
            ctx.scan_slot.last_outcome(),
            Some(&JobOutcome::Success("3 hits".into()))
        );
    }

    #[test]
    fn test_update_has_priority_over_scan() {
        let mut ctx = SchedulerContext::new();
        ctx.update_pending = true;
        ctx.scan_pending = true;
        assert_eq!(ctx.next_job(), Some(JobKind::Update));
    }
}
