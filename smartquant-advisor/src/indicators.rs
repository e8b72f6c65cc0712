//! Technical indicators over daily price history.
//!
//! Columns per bar:
//! - `MA5/MA10/MA20/MA60`: rolling mean, minimum period 1
//! - `DIF/DEA/MACD`: EMA 12/26/9 seeded from the first value, `MACD = 2(DIF - DEA)`
//! - `K/D/J`: 9-bar RSV (50 while the window is incomplete or flat), smoothed
//!   with alpha 1/3, `J = 3K - 2D`
//! - `RSI`: 14-period Wilder smoothing (alpha 1/14) of clipped moves
//! - `MACD_Cross`: 1 on a golden cross bar, -1 on a dead cross bar, else 0
//!
//! Histories shorter than [`MIN_BARS`] are returned without indicator rows.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::data::PriceBar;

/// Minimum number of bars before any indicator is produced.
pub const MIN_BARS: usize = 30;

const MA_WINDOWS: [usize; 4] = [5, 10, 20, 60];
const KDJ_WINDOW: usize = 9;
const RSI_EPSILON: f64 = 1e-10;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStage {
    MovingAverage,
    Macd,
    Kdj,
    Rsi,
    Cross,
}

impl std::fmt::Display for IndicatorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MovingAverage => "moving_average",
            Self::Macd => "macd",
            Self::Kdj => "kdj",
            Self::Rsi => "rsi",
            Self::Cross => "cross",
        };
        f.write_str(name)
    }
}

/// Why a stage could not run.
#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("{stage}: non-finite {column} at bar {index}")]
    NonFinite {
        stage: IndicatorStage,
        column: &'static str,
        index: usize,
    },
}

impl IndicatorError {
    pub fn stage(&self) -> IndicatorStage {
        match self {
            Self::NonFinite { stage, .. } => *stage,
        }
    }
}

/// Indicator values for one bar. `None` means not computed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorSet {
    #[serde(rename = "MA5")]
    pub ma5: Option<f64>,
    #[serde(rename = "MA10")]
    pub ma10: Option<f64>,
    #[serde(rename = "MA20")]
    pub ma20: Option<f64>,
    #[serde(rename = "MA60")]
    pub ma60: Option<f64>,
    #[serde(rename = "DIF")]
    pub dif: Option<f64>,
    #[serde(rename = "DEA")]
    pub dea: Option<f64>,
    #[serde(rename = "MACD")]
    pub macd: Option<f64>,
    #[serde(rename = "K")]
    pub k: Option<f64>,
    #[serde(rename = "D")]
    pub d: Option<f64>,
    #[serde(rename = "J")]
    pub j: Option<f64>,
    #[serde(rename = "RSI")]
    pub rsi: Option<f64>,
    #[serde(rename = "MACD_Cross")]
    pub macd_cross: i8,
}

/// Outcome of an indicator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    Complete,
    /// Fewer than [`MIN_BARS`] bars; no rows were computed
    InsufficientHistory,
    /// A stage failed; it and every later column are `None`
    Partial { stage: IndicatorStage },
}

/// Sorted bars plus one indicator row per bar (empty unless computed).
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorFrame {
    pub bars: Vec<PriceBar>,
    pub rows: Vec<IndicatorSet>,
    pub status: FrameStatus,
}

impl IndicatorFrame {
    /// The most recent bar and its indicators, if any were computed.
    pub fn latest(&self) -> Option<(&PriceBar, &IndicatorSet)> {
        self.bars.last().zip(self.rows.last())
    }

    pub fn is_complete(&self) -> bool {
        self.status == FrameStatus::Complete
    }
}

/// Compute every indicator for a price series.
///
/// Never fails: a stage error is logged and yields a partial frame.
pub fn compute(series: &[PriceBar]) -> IndicatorFrame {
    if series.len() < MIN_BARS {
        return IndicatorFrame {
            bars: series.to_vec(),
            rows: Vec::new(),
            status: FrameStatus::InsufficientHistory,
        };
    }

    let mut bars = series.to_vec();
    bars.sort_by_key(|b| b.date);

    let mut rows = vec![IndicatorSet::default(); bars.len()];
    let status = match fill_rows(&bars, &mut rows) {
        Ok(()) => FrameStatus::Complete,
        Err(e) => {
            warn!(error = %e, "Indicator calculation stopped early");
            FrameStatus::Partial { stage: e.stage() }
        }
    };

    IndicatorFrame { bars, rows, status }
}

fn fill_rows(bars: &[PriceBar], rows: &mut [IndicatorSet]) -> Result<(), IndicatorError> {
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    ensure_finite(&close, IndicatorStage::MovingAverage, "close")?;

    let [ma5, ma10, ma20, ma60] = MA_WINDOWS.map(|w| rolling_mean(&close, w));
    for (i, row) in rows.iter_mut().enumerate() {
        row.ma5 = Some(ma5[i]);
        row.ma10 = Some(ma10[i]);
        row.ma20 = Some(ma20[i]);
        row.ma60 = Some(ma60[i]);
    }

    let fast = ema(&close, span_alpha(12));
    let slow = ema(&close, span_alpha(26));
    let dif: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let dea = ema(&dif, span_alpha(9));
    for (i, row) in rows.iter_mut().enumerate() {
        row.dif = Some(dif[i]);
        row.dea = Some(dea[i]);
        row.macd = Some(2.0 * (dif[i] - dea[i]));
    }

    let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
    ensure_finite(&high, IndicatorStage::Kdj, "high")?;
    ensure_finite(&low, IndicatorStage::Kdj, "low")?;

    let rsv = raw_stochastic(&close, &high, &low);
    let k = ema(&rsv, com_alpha(2.0));
    let d = ema(&k, com_alpha(2.0));
    for (i, row) in rows.iter_mut().enumerate() {
        row.k = Some(k[i]);
        row.d = Some(d[i]);
        row.j = Some(3.0 * k[i] - 2.0 * d[i]);
    }

    for (row, value) in rows.iter_mut().zip(rsi(&close)) {
        row.rsi = value;
    }

    for i in 1..rows.len() {
        let (prev_dif, prev_dea) = (dif[i - 1], dea[i - 1]);
        rows[i].macd_cross = if dif[i] > dea[i] && prev_dif <= prev_dea {
            1
        } else if dif[i] < dea[i] && prev_dif >= prev_dea {
            -1
        } else {
            0
        };
    }

    Ok(())
}

fn ensure_finite(
    values: &[f64],
    stage: IndicatorStage,
    column: &'static str,
) -> Result<(), IndicatorError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(IndicatorError::NonFinite {
            stage,
            column,
            index,
        }),
        None => Ok(()),
    }
}

fn span_alpha(span: usize) -> f64 {
    2.0 / (span as f64 + 1.0)
}

fn com_alpha(com: f64) -> f64 {
    1.0 / (1.0 + com)
}

/// Rolling mean over up to `window` trailing values.
fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];
        if i >= window {
            sum -= values[i - window];
        }
        let count = (i + 1).min(window);
        out.push(sum / count as f64);
    }
    out
}

/// EMA[0] = x[0]; EMA[t] = alpha * x[t] + (1 - alpha) * EMA[t-1].
fn ema(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev = match values.first() {
        Some(v) => *v,
        None => return out,
    };
    for v in values {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

fn raw_stochastic(close: &[f64], high: &[f64], low: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| {
            if i + 1 < KDJ_WINDOW {
                return 50.0;
            }
            let start = i + 1 - KDJ_WINDOW;
            let lowest = low[start..=i].iter().copied().fold(f64::INFINITY, f64::min);
            let highest = high[start..=i].iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let range = highest - lowest;
            if range == 0.0 {
                50.0
            } else {
                (close[i] - lowest) / range * 100.0
            }
        })
        .collect()
}

/// Wilder RSI. The first bar has no delta and yields `None`.
fn rsi(close: &[f64]) -> Vec<Option<f64>> {
    let alpha = com_alpha(13.0);
    let mut out = Vec::with_capacity(close.len());
    let mut smoothed: Option<(f64, f64)> = None;

    for (i, price) in close.iter().enumerate() {
        if i == 0 {
            out.push(None);
            continue;
        }
        let delta = price - close[i - 1];
        let (up, down) = (delta.max(0.0), (-delta).max(0.0));

        let (avg_up, avg_down) = match smoothed {
            None => (up, down),
            Some((u, d)) => (alpha * up + (1.0 - alpha) * u, alpha * down + (1.0 - alpha) * d),
        };
        smoothed = Some((avg_up, avg_down));

        let rs = avg_up / (avg_down + RSI_EPSILON);
        out.push(Some(100.0 - 100.0 / (1.0 + rs)));
    }

    out
}
