//! JSON-file persistence for the portfolio.

use anyhow::Result;
use chrono::{Local, NaiveDate};
use smartquant_common::error::ResultExt;
use smartquant_common::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use super::{Holding, Portfolio};

/// Portfolio snapshot stored at `<data_dir>/portfolio.json`.
///
/// Reads never fail: a missing or unparseable file yields the default
/// portfolio. Mutations are serialized within the process and always rewrite
/// the full snapshot, but refuse to run over a file that exists and cannot be
/// read or parsed, leaving it untouched for manual repair.
pub struct HoldingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl HoldingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("portfolio.json"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and settle against the local calendar date.
    pub fn load(&self) -> Portfolio {
        self.load_at(today())
    }

    /// Load and settle against `today`. The settled state is not written back.
    pub fn load_at(&self, today: NaiveDate) -> Portfolio {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Portfolio::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read portfolio, using empty portfolio");
                return Portfolio::default();
            }
        };

        match Portfolio::from_json(&content, today) {
            Ok(portfolio) => portfolio,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt portfolio file, using empty portfolio");
                Portfolio::default()
            }
        }
    }

    /// Portfolio as seen by the decision job.
    pub fn snapshot(&self) -> Portfolio {
        self.load()
    }

    /// Overwrite the cash balance.
    pub fn update_cash(&self, amount: f64) -> Result<Portfolio> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::InvalidInput(format!("cash must be a non-negative number, got {}", amount)).into());
        }

        self.modify(|portfolio| {
            portfolio.cash = amount;
            info!(cash = amount, "Cash updated");
            Ok(())
        })
    }

    /// Create or fully replace a holding. `total_shares <= 0` deletes it.
    ///
    /// The lock is `total_shares - avail_shares`, clamped to `[0, total]`,
    /// dated `buy_date`.
    pub fn upsert(
        &self,
        symbol: &str,
        name: &str,
        total_shares: i64,
        avail_shares: i64,
        cost: f64,
        buy_date: NaiveDate,
    ) -> Result<Portfolio> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(Error::InvalidInput("symbol must not be empty".into()).into());
        }
        if total_shares <= 0 {
            return self.delete(symbol);
        }
        if !cost.is_finite() || cost < 0.0 {
            return Err(Error::InvalidInput(format!("cost must be a non-negative number, got {}", cost)).into());
        }

        let total = total_shares as u64;
        let locked = total_shares.saturating_sub(avail_shares).clamp(0, total_shares) as u64;

        self.modify(|portfolio| {
            let record = Holding {
                symbol: symbol.to_string(),
                name: name.trim().to_string(),
                total_shares: total,
                locked_shares: locked,
                locked_date: buy_date,
                cost,
                avail_shares: total - locked,
            };

            match portfolio.holdings.iter_mut().find(|h| h.symbol == symbol) {
                Some(existing) => *existing = record,
                None => portfolio.holdings.push(record),
            }

            info!(symbol = %symbol, total_shares = total, locked_shares = locked, "Holding upserted");
            Ok(())
        })
    }

    /// Remove a holding. Absent symbols are a no-op, the snapshot is still
    /// rewritten.
    pub fn delete(&self, symbol: &str) -> Result<Portfolio> {
        let symbol = symbol.trim();
        self.modify(|portfolio| {
            let before = portfolio.holdings.len();
            portfolio.holdings.retain(|h| h.symbol != symbol);
            if portfolio.holdings.len() < before {
                info!(symbol = %symbol, "Holding removed");
            }
            Ok(())
        })
    }

    fn modify<F>(&self, f: F) -> Result<Portfolio>
    where
        F: FnOnce(&mut Portfolio) -> Result<()>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let today = today();
        let mut portfolio = self.load_strict(today)?;
        f(&mut portfolio)?;
        self.save(&portfolio)?;

        portfolio.settle(today);
        Ok(portfolio)
    }

    /// Base snapshot for a mutation. Only a missing file falls back to the
    /// default portfolio.
    fn load_strict(&self, today: NaiveDate) -> smartquant_common::Result<Portfolio> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Portfolio::default()),
            Err(e) => {
                return Err(Error::from(e).with_context(format!("Failed to read {}", self.path.display())))
            }
        };

        Portfolio::from_json(&content, today).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Corrupt portfolio file, refusing to overwrite");
            Error::from(e).with_context(format!("Corrupt portfolio file {}", self.path.display()))
        })
    }

    fn save(&self, portfolio: &Portfolio) -> smartquant_common::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(portfolio).context("Failed to serialize portfolio")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).context(format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).context(format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
