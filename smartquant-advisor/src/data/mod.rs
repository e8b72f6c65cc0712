//! Market data: local daily history, real-time quotes and the daily update job.

mod history;
mod quote;
mod tushare;

pub use history::HistoryStore;
pub use quote::{Quote, QuoteSource, SinaQuoteSource};
pub use tushare::{DailyRow, DailyUpdateJob, TushareClient};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One trading day for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Daily change in percent
    pub pct_change: f64,
}

/// Strip exchange qualifiers from a symbol.
///
/// `600519.SH`, `sh600519` and `600519` all map to `600519`.
pub fn bare_code(symbol: &str) -> &str {
    let s = symbol.trim();
    let s = s.split('.').next().unwrap_or(s);
    let lower = s.get(..2).map(str::to_ascii_lowercase);
    match lower.as_deref() {
        Some("sh") | Some("sz") | Some("bj") => &s[2..],
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_code() {
        assert_eq!(bare_code("600519"), "600519");
        assert_eq!(bare_code("600519.SH"), "600519");
        assert_eq!(bare_code("sz000001"), "000001");
        assert_eq!(bare_code("SH600000"), "600000");
        assert_eq!(bare_code(" 300750 "), "300750");
    }
}
