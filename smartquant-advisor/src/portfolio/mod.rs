//! Manually maintained portfolio under T+1 settlement.
//!
//! Shares bought today are locked until the next trading day. The lock is
//! recorded as `(locked_shares, locked_date)`; `avail_shares` is always
//! derived on load and never trusted from disk.

mod store;

pub use store::HoldingsStore;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Cash balance of a fresh portfolio.
pub const DEFAULT_CASH: f64 = 100_000.0;

/// One owned position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    pub total_shares: u64,
    /// Shares bought on `locked_date` and not yet settled
    pub locked_shares: u64,
    pub locked_date: NaiveDate,
    /// Average cost basis per share
    pub cost: f64,
    /// Derived: `total_shares` minus today's locked shares
    pub avail_shares: u64,
}

impl Holding {
    /// Apply T+1 settlement relative to `today`.
    ///
    /// A lock from any other day is released in full.
    pub fn settle(&mut self, today: NaiveDate) {
        if self.locked_date != today {
            self.locked_shares = 0;
        }
        self.locked_shares = self.locked_shares.min(self.total_shares);
        self.avail_shares = self.total_shares - self.locked_shares;
    }
}

/// Cash plus holdings, keyed by symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Portfolio {
    pub cash: f64,
    pub holdings: Vec<Holding>,
}

impl Default for Portfolio {
    fn default() -> Self {
        Self {
            cash: DEFAULT_CASH,
            holdings: Vec::new(),
        }
    }
}

impl Portfolio {
    pub fn holding(&self, symbol: &str) -> Option<&Holding> {
        self.holdings.iter().find(|h| h.symbol == symbol)
    }

    /// Settle every holding and drop empty positions.
    pub fn settle(&mut self, today: NaiveDate) {
        self.holdings.retain(|h| h.total_shares > 0);
        for holding in &mut self.holdings {
            holding.settle(today);
        }
    }

    /// Parse a stored snapshot, accepting legacy field layouts.
    pub fn from_json(content: &str, today: NaiveDate) -> serde_json::Result<Self> {
        let stored: StoredPortfolio = serde_json::from_str(content)?;
        let mut portfolio = Self {
            cash: stored.cash,
            holdings: stored.holdings.into_iter().map(StoredHolding::into_holding).collect(),
        };
        portfolio.settle(today);
        Ok(portfolio)
    }
}

// ============================================================================
// On-disk layout
// ============================================================================

fn legacy_locked_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn default_cash() -> f64 {
    DEFAULT_CASH
}

#[derive(Debug, Deserialize)]
struct StoredPortfolio {
    #[serde(default = "default_cash")]
    cash: f64,
    #[serde(default)]
    holdings: Vec<StoredHolding>,
}

/// Holding as found on disk. Older files carry `shares` instead of
/// `total_shares` and may lack the lock fields or cost.
#[derive(Debug, Deserialize)]
struct StoredHolding {
    symbol: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    total_shares: Option<f64>,
    #[serde(default)]
    shares: Option<f64>,
    #[serde(default)]
    locked_shares: Option<f64>,
    #[serde(default)]
    locked_date: Option<String>,
    #[serde(default)]
    cost: Option<f64>,
}

impl StoredHolding {
    fn into_holding(self) -> Holding {
        let total_shares = whole_shares(self.total_shares.or(self.shares));
        let locked_date = self
            .locked_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
            .unwrap_or_else(legacy_locked_date);

        Holding {
            symbol: self.symbol,
            name: self.name,
            total_shares,
            locked_shares: whole_shares(self.locked_shares),
            locked_date,
            cost: self.cost.filter(|c| c.is_finite()).unwrap_or(0.0).max(0.0),
            avail_shares: total_shares,
        }
    }
}

fn whole_shares(value: Option<f64>) -> u64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v.round() as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_settle_releases_stale_lock() {
        let mut h = Holding {
            symbol: "600519".into(),
            name: "贵州茅台".into(),
            total_shares: 1000,
            locked_shares: 600,
            locked_date: day(2),
            cost: 10.0,
            avail_shares: 400,
        };
        h.settle(day(2));
        assert_eq!(h.avail_shares, 400);
        h.settle(day(3));
        assert_eq!(h.locked_shares, 0);
        assert_eq!(h.avail_shares, 1000);
    }

    #[test]
    fn test_legacy_layout() {
        let json = r#"{"cash": 5000, "holdings": [
            {"symbol": "000001", "name": "平安银行", "shares": 300},
            {"symbol": "600000", "total_shares": 0, "cost": 7.0},
            {"symbol": "300750", "total_shares": 200, "locked_shares": 100, "locked_date": "2024-01-03", "cost": 150.5, "avail_shares": 999}
        ]}"#;

        let portfolio = Portfolio::from_json(json, day(3)).unwrap();
        assert_eq!(portfolio.cash, 5000.0);
        assert_eq!(portfolio.holdings.len(), 2);

        let legacy = portfolio.holding("000001").unwrap();
        assert_eq!(legacy.total_shares, 300);
        assert_eq!(legacy.locked_shares, 0);
        assert_eq!(legacy.locked_date, legacy_locked_date());
        assert_eq!(legacy.cost, 0.0);
        assert_eq!(legacy.avail_shares, 300);

        let locked = portfolio.holding("300750").unwrap();
        assert_eq!(locked.avail_shares, 100);
        assert!(portfolio.holding("600000").is_none());
    }

    #[test]
    fn test_lock_never_exceeds_total() {
        let json = r#"{"holdings": [{"symbol": "1", "total_shares": 100, "locked_shares": 500, "locked_date": "2024-01-03"}]}"#;
        let portfolio = Portfolio::from_json(json, day(3)).unwrap();
        assert_eq!(portfolio.cash, DEFAULT_CASH);
        assert_eq!(portfolio.holdings[0].locked_shares, 100);
        assert_eq!(portfolio.holdings[0].avail_shares, 0);
    }

    #[test]
    fn test_bad_lock_date_falls_back() {
        let json = r#"{"holdings": [{"symbol": "1", "total_shares": 100, "locked_shares": 50, "locked_date": "yesterday"}]}"#;
        let portfolio = Portfolio::from_json(json, day(3)).unwrap();
        assert_eq!(portfolio.holdings[0].avail_shares, 100);
    }
}
