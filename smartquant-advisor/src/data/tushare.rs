//! Tushare Pro daily bars and the end-of-day incremental update job.
//!
//! # API Documentation
//! https://tushare.pro/document/2?doc_id=27
//!
//! The `daily` API answers with a column-oriented table:
//!
//! ```json
//! {"code": 0, "msg": "", "data": {"fields": ["ts_code", "trade_date", ...],
//!                                 "items": [["000001.SZ", "20240103", ...]]}}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::HistoryStore;
use crate::scheduler::{BackgroundJob, JobOutcome};

const TUSHARE_URL: &str = "http://api.tushare.pro";

/// Tushare Pro API client bound to one token.
pub struct TushareClient {
    token: String,
    client: reqwest::Client,
    base_url: String,
}

impl TushareClient {
    pub fn new(token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            token: token.into(),
            client,
            base_url: TUSHARE_URL.to_string(),
        }
    }

    /// Point the client at another endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call_api(
        &self,
        api_name: &str,
        params: &HashMap<&str, String>,
    ) -> Result<TushareTable> {
        let request = TushareRequest {
            api_name: api_name.to_string(),
            token: self.token.clone(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            fields: None,
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Tushare")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Tushare API error: {} - {}", status, body);
        }

        let result: TushareResponse = response
            .json()
            .await
            .context("Failed to parse Tushare response")?;

        if result.code != 0 {
            anyhow::bail!(
                "Tushare API returned error: {} - {}",
                result.code,
                result.msg.unwrap_or_default()
            );
        }

        Ok(result.data.unwrap_or_default())
    }

    /// Every instrument's daily bar for one trade date.
    pub async fn daily(&self, trade_date: NaiveDate) -> Result<Vec<DailyRow>> {
        let mut params = HashMap::new();
        params.insert("trade_date", trade_date.format("%Y%m%d").to_string());

        let table = self.call_api("daily", &params).await?;
        Ok(table.into_rows())
    }
}

/// One row of a Tushare table, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyRow {
    pub values: HashMap<String, String>,
}

impl DailyRow {
    pub fn ts_code(&self) -> Option<&str> {
        self.values.get("ts_code").map(String::as_str)
    }
}

#[derive(Debug, Serialize)]
struct TushareRequest {
    api_name: String,
    token: String,
    params: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TushareResponse {
    code: i32,
    msg: Option<String>,
    data: Option<TushareTable>,
}

#[derive(Debug, Default, Deserialize)]
struct TushareTable {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    items: Vec<Vec<serde_json::Value>>,
}

impl TushareTable {
    fn into_rows(self) -> Vec<DailyRow> {
        let fields = self.fields;
        self.items
            .into_iter()
            .map(|item| DailyRow {
                values: fields
                    .iter()
                    .cloned()
                    .zip(item.into_iter().map(cell_to_string))
                    .collect(),
            })
            .collect()
    }
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

// ============================================================================
// Daily update job
// ============================================================================

/// End-of-day incremental history update.
///
/// Fetches today's bars for the whole market and appends each one to the
/// instrument's existing history file. Instruments without a local file are
/// skipped: the update never creates new histories.
pub struct DailyUpdateJob {
    tokens: Vec<String>,
    history: HistoryStore,
    base_url: String,
    trade_date: Option<NaiveDate>,
}

impl DailyUpdateJob {
    pub fn new(tokens: Vec<String>, history: HistoryStore) -> Self {
        Self {
            tokens,
            history,
            base_url: TUSHARE_URL.to_string(),
            trade_date: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Pin the trade date instead of using the local calendar date.
    pub fn with_trade_date(mut self, date: NaiveDate) -> Self {
        self.trade_date = Some(date);
        self
    }

    /// Fetch today's table, trying each token in order.
    async fn fetch(&self, trade_date: NaiveDate) -> Result<Vec<DailyRow>> {
        let mut last_error = None;

        for (index, token) in self.tokens.iter().enumerate() {
            let client = TushareClient::new(token.as_str()).with_base_url(self.base_url.as_str());
            match client.daily(trade_date).await {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    warn!(token_index = index, error = %e, "Tushare daily request failed, trying next token");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no Tushare token configured")))
    }

    /// Append fetched rows to local histories. Returns the number updated.
    pub fn apply(history: &HistoryStore, rows: &[DailyRow]) -> usize {
        let mut updated = 0;
        for row in rows {
            let Some(ts_code) = row.ts_code() else {
                continue;
            };
            match history.append_row(ts_code, &row.values) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => warn!(ts_code = %ts_code, error = %e, "Failed to append daily bar"),
            }
        }
        updated
    }
}

#[async_trait]
impl BackgroundJob for DailyUpdateJob {
    fn name(&self) -> &str {
        "tushare_daily_update"
    }

    async fn run(&self) -> JobOutcome {
        if self.tokens.is_empty() {
            return JobOutcome::Failure("错误：未配置 Token".to_string());
        }

        let trade_date = self
            .trade_date
            .unwrap_or_else(|| Local::now().date_naive());

        let rows = match self.fetch(trade_date).await {
            Ok(rows) => rows,
            Err(e) => return JobOutcome::Failure(format!("TuShare 请求失败: {:#}", e)),
        };

        if rows.is_empty() {
            return JobOutcome::NoData("TuShare 今日无数据 (非交易日或未收盘)".to_string());
        }

        let history = self.history.clone();
        let fetched = rows.len();
        let updated = match tokio::task::spawn_blocking(move || Self::apply(&history, &rows)).await {
            Ok(n) => n,
            Err(e) => return JobOutcome::Failure(format!("更新过程中发生异常: {}", e)),
        };

        info!(trade_date = %trade_date, fetched, updated, "Daily history update applied");
        JobOutcome::Success(format!("增量更新完成，共更新 {} 只股票", updated))
    }
}
