//! Local stock screener and the post-close scan job.
//!
//! The screener reads only the local history directory. Two strategies:
//! - overnight (一夜持股法): moderate gain on expanding volume above MA5 with
//!   positive DIF
//! - limit_up (打板策略): instruments that closed at the daily limit

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use smartquant_common::ScanStrategy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::data::{HistoryStore, PriceBar};
use crate::indicators;
use crate::notification::NotificationDispatcher;
use crate::scheduler::{BackgroundJob, JobOutcome};

/// Upper bound on hits returned by one scan.
pub const MAX_RESULTS: usize = 50;

/// Minimum history length; younger listings are skipped.
const MIN_LISTED_BARS: usize = 60;

const EXCLUDED_NAME_MARKERS: [&str; 4] = ["ST", "退市", "B股", "北证"];

pub fn strategy_label(strategy: ScanStrategy) -> &'static str {
    match strategy {
        ScanStrategy::Overnight => "一夜持股法",
        ScanStrategy::LimitUp => "打板策略",
    }
}

/// One screening match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanHit {
    pub symbol: String,
    pub name: String,
    pub score: f64,
    pub reason: String,
    pub close: f64,
    pub pct_chg: f64,
}

/// Screener over the local history store.
pub struct Screener {
    history: HistoryStore,
}

impl Screener {
    pub fn new(history: HistoryStore) -> Self {
        Self { history }
    }

    /// Scan every local history. Results are sorted by score, best first,
    /// and capped at [`MAX_RESULTS`].
    pub fn scan(&self, strategy: ScanStrategy) -> Vec<ScanHit> {
        let names = self.history.stock_names();
        let mut hits = Vec::new();

        for code in self.history.codes() {
            let name = names.get(&code).cloned().unwrap_or_default();
            if EXCLUDED_NAME_MARKERS.iter().any(|m| name.contains(m)) {
                continue;
            }

            let bars = self.history.load(&code);
            if let Some(hit) = evaluate(&code, &name, &bars, strategy) {
                hits.push(hit);
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(MAX_RESULTS);
        hits
    }
}

/// Score one instrument, `None` when it does not qualify.
fn evaluate(code: &str, name: &str, bars: &[PriceBar], strategy: ScanStrategy) -> Option<ScanHit> {
    if bars.len() < MIN_LISTED_BARS {
        return None;
    }
    let current = bars.last()?;
    if current.volume <= 0.0 {
        return None;
    }

    let (score, reason) = match strategy {
        ScanStrategy::Overnight => {
            let n = bars.len();
            let prior_volume = bars[n - 6..n - 1].iter().map(|b| b.volume).sum::<f64>() / 5.0;
            let vol_ratio = current.volume / (prior_volume + 1.0);
            if !(current.pct_change > 3.0 && current.pct_change < 8.0 && vol_ratio > 1.8) {
                return None;
            }

            let frame = indicators::compute(bars);
            let (_, latest) = frame.latest()?;
            let (ma5, dif) = (latest.ma5?, latest.dif?);
            if !(current.close > ma5 && dif > 0.0) {
                return None;
            }
            (
                80.0 + (vol_ratio * 2.0).min(15.0),
                format!("量比{:.1} 趋势向上", vol_ratio),
            )
        }
        ScanStrategy::LimitUp => {
            let main_board = code.starts_with("60") || code.starts_with("00");
            let growth_board = code.starts_with("30") || code.starts_with("68");
            if main_board && current.pct_change > 9.8 {
                (95.0, "主板涨停".to_string())
            } else if growth_board && current.pct_change > 19.8 {
                (98.0, "双创涨停".to_string())
            } else {
                return None;
            }
        }
    };

    debug!(symbol = %code, score, "Screening hit");
    Some(ScanHit {
        symbol: code.to_string(),
        name: name.to_string(),
        score: (score * 10.0).round() / 10.0,
        reason,
        close: current.close,
        pct_chg: current.pct_change,
    })
}

/// Persisted output of the latest scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub strategy: ScanStrategy,
    pub generated_at: DateTime<Local>,
    pub hits: Vec<ScanHit>,
}

impl ScanReport {
    /// Human-readable summary listing at most `top_n` hits.
    pub fn summary(&self, top_n: usize) -> String {
        if self.hits.is_empty() {
            return "本地数据中未筛选到符合条件的股票".to_string();
        }

        let mut text = format!("筛选出 {} 只股票:", self.hits.len());
        for (rank, hit) in self.hits.iter().take(top_n).enumerate() {
            text.push_str(&format!(
                "\n{}. {}({}) 推荐度 {:.1} 收盘 {:.2} 涨幅 {:.2}% {}",
                rank + 1,
                hit.name,
                hit.symbol,
                hit.score,
                hit.close,
                hit.pct_chg,
                hit.reason
            ));
        }
        text
    }
}

/// Scan job chained after a successful history update.
pub struct ScanJob {
    history: HistoryStore,
    strategy: ScanStrategy,
    top_n: usize,
    results_path: PathBuf,
    notifier: Arc<NotificationDispatcher>,
}

impl ScanJob {
    pub fn new(
        history: HistoryStore,
        data_dir: &Path,
        strategy: ScanStrategy,
        top_n: usize,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            history,
            strategy,
            top_n,
            results_path: data_dir.join("scan_results.json"),
            notifier,
        }
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }

    fn scan_and_save(
        history: HistoryStore,
        strategy: ScanStrategy,
        path: &Path,
    ) -> Result<ScanReport> {
        let report = ScanReport {
            strategy,
            generated_at: Local::now(),
            hits: Screener::new(history).scan(strategy),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize scan report")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(report)
    }
}

#[async_trait]
impl BackgroundJob for ScanJob {
    fn name(&self) -> &str {
        "local_scan"
    }

    async fn run(&self) -> JobOutcome {
        let history = self.history.clone();
        let strategy = self.strategy;
        let path = self.results_path.clone();

        let report = match tokio::task::spawn_blocking(move || {
            Self::scan_and_save(history, strategy, &path)
        })
        .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => return JobOutcome::Failure(format!("选股失败: {:#}", e)),
            Err(e) => return JobOutcome::Failure(format!("选股过程中发生异常: {}", e)),
        };

        let summary = report.summary(self.top_n);
        info!(
            strategy = strategy_label(strategy),
            hits = report.hits.len(),
            "Local scan finished"
        );

        if !report.hits.is_empty() {
            let title = format!("选股结果: {}", strategy_label(strategy));
            self.notifier.publish(&title, &summary).await;
        }

        JobOutcome::Success(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationSink;
    use std::fmt::Write as _;
    use std::sync::Mutex;

    /// Write `len` bars with a flat close of 10 and the given final bar.
    fn write_history(
        store: &HistoryStore,
        code: &str,
        len: usize,
        last_close: f64,
        last_vol: f64,
        last_pct: f64,
    ) {
        let mut csv = String::from("trade_date,open,high,low,close,vol,pct_chg\n");
        let start = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        for i in 0..len {
            let date = (start + chrono::Duration::days(i as i64)).format("%Y%m%d");
            if i + 1 == len {
                writeln!(csv, "{date},10,{last_close},10,{last_close},{last_vol},{last_pct}").unwrap();
            } else {
                // Gentle uptrend keeps DIF positive.
                let close = 9.0 + i as f64 * 0.01;
                writeln!(csv, "{date},{close},{close},{close},{close},100,0.1").unwrap();
            }
        }
        std::fs::create_dir_all(store.history_dir()).unwrap();
        std::fs::write(store.path_for(code), csv).unwrap();
    }

    #[test]
    fn test_limit_up_boards() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        write_history(&store, "600001", 80, 11.0, 500.0, 10.0);
        write_history(&store, "300001", 80, 12.0, 500.0, 20.0);
        write_history(&store, "300002", 80, 11.0, 500.0, 10.0);
        write_history(&store, "000002", 80, 11.0, 0.0, 10.0);
        write_history(&store, "000003", 40, 11.0, 500.0, 10.0);

        let hits = Screener::new(store).scan(ScanStrategy::LimitUp);
        let symbols: Vec<&str> = hits.iter().map(|h| h.symbol.as_str()).collect();
        assert_eq!(symbols, ["300001", "600001"]);
        assert_eq!(hits[0].score, 98.0);
        assert_eq!(hits[0].reason, "双创涨停");
        assert_eq!(hits[1].score, 95.0);
    }

    #[test]
    fn test_overnight_requires_volume_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        write_history(&store, "600010", 80, 10.5, 500.0, 5.0);
        write_history(&store, "600011", 80, 10.5, 150.0, 5.0);
        write_history(&store, "600012", 80, 10.5, 500.0, 9.0);

        let hits = Screener::new(store).scan(ScanStrategy::Overnight);
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!(hit.symbol, "600010");
        // vol_ratio = 500 / 101 ≈ 4.95, bonus capped below 15
        assert_eq!(hit.score, 89.9);
        assert_eq!(hit.reason, "量比5.0 趋势向上");
    }

    #[test]
    fn test_name_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        write_history(&store, "600020", 80, 11.0, 500.0, 10.0);
        write_history(&store, "600021", 80, 11.0, 500.0, 10.0);
        std::fs::write(
            dir.path().join("stock_basic.csv"),
            "symbol,name\n600020,*ST长油\n600021,正常股份\n",
        )
        .unwrap();

        let hits = Screener::new(store).scan(ScanStrategy::LimitUp);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "正常股份");
    }

    struct Recorder(Arc<Mutex<Vec<(String, String)>>>);

    #[async_trait]
    impl NotificationSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, title: &str, message: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((title.into(), message.into()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scan_job_writes_report_and_publishes_top_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        write_history(&store, "600001", 80, 11.0, 500.0, 10.0);
        write_history(&store, "688001", 80, 12.0, 500.0, 20.0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Arc::new(NotificationDispatcher::new(vec![Box::new(Recorder(seen.clone()))]));
        let job = ScanJob::new(store, dir.path(), ScanStrategy::LimitUp, 1, notifier);

        let outcome = job.run().await;
        assert!(matches!(outcome, JobOutcome::Success(_)));

        let report: ScanReport =
            serde_json::from_str(&std::fs::read_to_string(job.results_path()).unwrap()).unwrap();
        assert_eq!(report.hits.len(), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "选股结果: 打板策略");
        assert!(seen[0].1.starts_with("筛选出 2 只股票:"));
        assert!(seen[0].1.contains("688001"));
        assert!(!seen[0].1.contains("600001"));
    }

    #[tokio::test]
    async fn test_empty_scan_is_success_without_notification() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Arc::new(NotificationDispatcher::new(vec![Box::new(Recorder(seen.clone()))]));
        let job = ScanJob::new(
            HistoryStore::new(dir.path()),
            dir.path(),
            ScanStrategy::Overnight,
            20,
            notifier,
        );

        assert_eq!(
            job.run().await,
            JobOutcome::Success("本地数据中未筛选到符合条件的股票".to_string())
        );
        assert!(seen.lock().unwrap().is_empty());
    }
}
