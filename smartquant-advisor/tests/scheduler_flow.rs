//! End-to-end scheduler behavior across a trading day.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use smartquant_advisor::scheduler::{BackgroundJob, DecisionTask, JobKind, JobOutcome, MarketScheduler};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Job that blocks until released, then reports a fixed outcome.
struct GatedJob {
    outcome: JobOutcome,
    runs: AtomicUsize,
    release: Notify,
    gated: bool,
    finished: AtomicBool,
}

impl GatedJob {
    fn gated(outcome: JobOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            runs: AtomicUsize::new(0),
            release: Notify::new(),
            gated: true,
            finished: AtomicBool::new(false),
        })
    }

    fn immediate(outcome: JobOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            runs: AtomicUsize::new(0),
            release: Notify::new(),
            gated: false,
            finished: AtomicBool::new(false),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundJob for GatedJob {
    fn name(&self) -> &str {
        "gated"
    }

    async fn run(&self) -> JobOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            self.release.notified().await;
        }
        self.finished.store(true, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Scan job that records whether the update had finished when it started.
struct OrderedScan {
    update: Arc<GatedJob>,
    saw_update_finished: AtomicBool,
    runs: AtomicUsize,
}

#[async_trait]
impl BackgroundJob for OrderedScan {
    fn name(&self) -> &str {
        "ordered_scan"
    }

    async fn run(&self) -> JobOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.saw_update_finished
            .store(self.update.finished.load(Ordering::SeqCst), Ordering::SeqCst);
        JobOutcome::Success("选股完成".into())
    }
}

#[derive(Default)]
struct CountingDecision {
    runs: AtomicUsize,
}

#[async_trait]
impl DecisionTask for CountingDecision {
    async fn run(&self) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    // 2024-01-03 is a Wednesday
    NaiveDate::from_ymd_opt(2024, 1, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn scheduler(
    update: Arc<dyn BackgroundJob>,
    scan: Arc<dyn BackgroundJob>,
    decision: Arc<dyn DecisionTask>,
) -> MarketScheduler {
    MarketScheduler::new(update, scan, decision, Duration::from_secs(60))
}

#[tokio::test]
async fn test_idle_closed_tick_is_noop() {
    let update = GatedJob::immediate(JobOutcome::Success("u".into()));
    let scan = GatedJob::immediate(JobOutcome::Success("s".into()));
    let decision = Arc::new(CountingDecision::default());
    let scheduler = scheduler(update.clone(), scan.clone(), decision.clone());

    for (h, m) in [(8, 0), (15, 30), (23, 59)] {
        let report = scheduler.tick_at(at(3, h, m)).await;
        assert_eq!(report.launched, None);
        assert!(!report.decision_ran);
    }
    scheduler.wait_idle().await;

    let status = scheduler.status_at(at(3, 23, 59));
    assert!(!status.was_market_open);
    assert!(!status.update_pending);
    assert!(!status.scan_pending);
    assert_eq!(update.runs(), 0);
    assert_eq!(scan.runs(), 0);
    assert_eq!(decision.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_launches_single_update_under_fast_ticks() {
    let update = GatedJob::gated(JobOutcome::Success("增量更新完成，共更新 2 只股票".into()));
    let scan = Arc::new(OrderedScan {
        update: update.clone(),
        saw_update_finished: AtomicBool::new(false),
        runs: AtomicUsize::new(0),
    });
    let decision = Arc::new(CountingDecision::default());
    let scheduler = scheduler(update.clone(), scan.clone(), decision.clone());

    let report = scheduler.tick_at(at(3, 14, 50)).await;
    assert!(report.decision_ran);

    let report = scheduler.tick_at(at(3, 15, 1)).await;
    assert_eq!(report.launched, Some(JobKind::Update));
    let status = scheduler.status_at(at(3, 15, 1));
    assert!(status.update_pending);
    assert!(status.update_running);
    assert!(!status.was_market_open);

    // Ticks faster than the job completes must not start a second one.
    for minute in 2..10 {
        let report = scheduler.tick_at(at(3, 15, minute)).await;
        assert_eq!(report.launched, None);
    }
    assert!(!scheduler.try_start_update());
    assert!(!scheduler.try_start_scan());

    update.release.notify_one();
    scheduler.wait_idle().await;

    assert_eq!(update.runs(), 1);
    assert_eq!(scan.runs.load(Ordering::SeqCst), 1);
    assert!(scan.saw_update_finished.load(Ordering::SeqCst));

    let status = scheduler.status_at(at(3, 15, 10));
    assert!(!status.update_pending);
    assert!(!status.scan_pending);
    assert!(matches!(status.last_scan, Some(JobOutcome::Success(_))));

    // Everything settled: the rest of the evening is idle.
    let report = scheduler.tick_at(at(3, 20, 0)).await;
    assert_eq!(report.launched, None);
    assert_eq!(update.runs(), 1);
}

#[tokio::test]
async fn test_update_success_chains_scan_without_another_tick() {
    let update = GatedJob::immediate(JobOutcome::Success("增量更新完成，共更新 1 只股票".into()));
    let scan = GatedJob::immediate(JobOutcome::Success("s".into()));
    let scheduler = scheduler(update.clone(), scan.clone(), Arc::new(CountingDecision::default()));

    scheduler.tick_at(at(3, 11, 0)).await;
    let report = scheduler.tick_at(at(3, 15, 5)).await;
    assert_eq!(report.launched, Some(JobKind::Update));

    scheduler.wait_idle().await;
    assert_eq!(update.runs(), 1);
    assert_eq!(scan.runs(), 1);
    assert!(!scheduler.status_at(at(3, 15, 6)).scan_pending);
}

#[tokio::test]
async fn test_no_data_skips_scan() {
    let update = GatedJob::immediate(JobOutcome::NoData("TuShare 今日无数据 (非交易日或未收盘)".into()));
    let scan = GatedJob::immediate(JobOutcome::Success("s".into()));
    let scheduler = scheduler(update.clone(), scan.clone(), Arc::new(CountingDecision::default()));

    scheduler.tick_at(at(3, 10, 0)).await;
    scheduler.tick_at(at(3, 15, 30)).await;
    scheduler.wait_idle().await;

    let status = scheduler.status_at(at(3, 15, 40));
    assert!(!status.update_pending);
    assert!(!status.scan_pending);
    assert_eq!(scan.runs(), 0);

    let report = scheduler.tick_at(at(3, 15, 40)).await;
    assert_eq!(report.launched, None);
    assert_eq!(update.runs(), 1);
}

#[tokio::test]
async fn test_failed_update_retries_until_next_session_clears_it() {
    let update = GatedJob::immediate(JobOutcome::Failure("TuShare 请求失败: timeout".into()));
    let scan = GatedJob::immediate(JobOutcome::Success("s".into()));
    let decision = Arc::new(CountingDecision::default());
    let scheduler = scheduler(update.clone(), scan.clone(), decision.clone());

    scheduler.tick_at(at(3, 13, 0)).await;
    for minute in [1, 11, 21] {
        let report = scheduler.tick_at(at(3, 15, minute)).await;
        assert_eq!(report.launched, Some(JobKind::Update));
        scheduler.wait_idle().await;
    }
    let status = scheduler.status_at(at(3, 15, 30));
    assert!(status.update_pending);
    assert_eq!(status.update_failures, 3);
    assert_eq!(scan.runs(), 0);

    // The next morning's open discards the stale retry.
    let report = scheduler.tick_at(at(4, 9, 30)).await;
    assert!(report.decision_ran);
    let status = scheduler.status_at(at(4, 9, 30));
    assert!(!status.update_pending);
    assert!(!status.scan_pending);
    assert!(status.was_market_open);
    assert_eq!(decision.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_break_arms_update_only_after_close() {
    let update = GatedJob::immediate(JobOutcome::NoData("none".into()));
    let scan = GatedJob::immediate(JobOutcome::Success("s".into()));
    let decision = Arc::new(CountingDecision::default());
    let scheduler = scheduler(update.clone(), scan.clone(), decision.clone());

    scheduler.tick_at(at(3, 11, 0)).await;
    let report = scheduler.tick_at(at(3, 12, 0)).await;
    assert_eq!(report.launched, None);
    assert!(!report.decision_ran);
    assert!(!scheduler.status_at(at(3, 12, 0)).update_pending);

    let report = scheduler.tick_at(at(3, 15, 1)).await;
    assert_eq!(report.launched, Some(JobKind::Update));
    scheduler.wait_idle().await;
    assert_eq!(decision.runs.load(Ordering::SeqCst), 1);
}
