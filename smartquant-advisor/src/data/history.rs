//! Local daily price history stored as one CSV file per instrument.
//!
//! Layout under the data directory:
//! - `history/<code>.csv`: `trade_date,open,high,low,close,vol,pct_chg,...`
//! - `stock_basic.csv`: optional `symbol,name,...` listing used for name filters
//!
//! Extra columns are tolerated on read and preserved on append.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{bare_code, PriceBar};

/// File-backed price history.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    history_dir: PathBuf,
    stock_basic_path: PathBuf,
}

impl HistoryStore {
    /// Create a store rooted at the data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            history_dir: data_dir.join("history"),
            stock_basic_path: data_dir.join("stock_basic.csv"),
        }
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    /// Path of the history file for a symbol.
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.history_dir.join(format!("{}.csv", bare_code(symbol)))
    }

    /// Load a symbol's history in ascending date order.
    ///
    /// Missing or unreadable files load as an empty history. Rows whose date
    /// or price columns cannot be parsed are skipped.
    pub fn load(&self, symbol: &str) -> Vec<PriceBar> {
        let path = self.path_for(symbol);
        if !path.exists() {
            debug!(symbol = %symbol, "No local history");
            return Vec::new();
        }

        match read_bars(&path) {
            Ok(mut bars) => {
                bars.sort_by_key(|b| b.date);
                bars
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Failed to read history, treating as empty");
                Vec::new()
            }
        }
    }

    /// Bare codes of every instrument with a history file.
    pub fn codes(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.history_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut codes: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                    return None;
                }
                path.file_stem().and_then(|s| s.to_str()).map(String::from)
            })
            .collect();
        codes.sort();
        codes
    }

    /// Symbol to name mapping from `stock_basic.csv`, empty when absent.
    pub fn stock_names(&self) -> HashMap<String, String> {
        if !self.stock_basic_path.exists() {
            return HashMap::new();
        }

        match read_stock_names(&self.stock_basic_path) {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to read stock_basic.csv");
                HashMap::new()
            }
        }
    }

    /// Append one row to an existing history file, aligned to its header.
    ///
    /// Columns missing from `values` are written empty; keys the file does not
    /// have are dropped. Returns `Ok(false)` when the instrument has no file,
    /// since incremental updates never create new histories.
    pub fn append_row(&self, symbol: &str, values: &HashMap<String, String>) -> Result<bool> {
        let path = self.path_for(symbol);
        if !path.exists() {
            return Ok(false);
        }

        let header = {
            let mut reader = csv::Reader::from_path(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            reader
                .headers()
                .with_context(|| format!("Failed to read header of {}", path.display()))?
                .clone()
        };

        let record: Vec<&str> = header
            .iter()
            .map(|column| values.get(column).map(String::as_str).unwrap_or(""))
            .collect();

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {} for append", path.display()))?;

        if !ends_with_newline(&mut file)? {
            file.write_all(b"\n")?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(&record)?;
        writer.flush()?;

        Ok(true)
    }
}

fn ends_with_newline(file: &mut fs::File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn read_bars(path: &Path) -> Result<Vec<PriceBar>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let header = reader.headers()?.clone();
    let column = |name: &str| header.iter().position(|h| h.trim().eq_ignore_ascii_case(name));

    let date_col = column("trade_date")
        .or_else(|| column("date"))
        .context("history file has no trade_date column")?;
    let close_col = column("close").context("history file has no close column")?;
    let open_col = column("open");
    let high_col = column("high");
    let low_col = column("low");
    let vol_col = column("vol").or_else(|| column("volume"));
    let pct_col = column("pct_chg");

    let mut bars = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => continue,
        };

        let field = |idx: Option<usize>| -> Option<f64> {
            idx.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
        };

        let date = match record.get(date_col).and_then(parse_trade_date) {
            Some(d) => d,
            None => continue,
        };
        let close = match field(Some(close_col)) {
            Some(c) => c,
            None => continue,
        };

        bars.push(PriceBar {
            date,
            open: field(open_col).unwrap_or(close),
            high: field(high_col).unwrap_or(close),
            low: field(low_col).unwrap_or(close),
            close,
            volume: field(vol_col).unwrap_or(0.0),
            pct_change: field(pct_col).unwrap_or(0.0),
        });
    }

    Ok(bars)
}

fn read_stock_names(path: &Path) -> Result<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let header = reader.headers()?.clone();
    let symbol_col = header
        .iter()
        .position(|h| h == "symbol")
        .context("stock_basic.csv has no symbol column")?;
    let name_col = header
        .iter()
        .position(|h| h == "name")
        .context("stock_basic.csv has no name column")?;

    let mut names = HashMap::new();
    for record in reader.records().filter_map(|r| r.ok()) {
        if let (Some(symbol), Some(name)) = (record.get(symbol_col), record.get(name_col)) {
            names.insert(bare_code(symbol).to_string(), name.trim().to_string());
        }
    }
    Ok(names)
}

/// Parse `YYYYMMDD` (as written by Tushare) or ISO `YYYY-MM-DD`.
pub(crate) fn parse_trade_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let raw = raw.strip_suffix(".0").unwrap_or(raw);
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}
