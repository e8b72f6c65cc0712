//! Real-time quotes.
//!
//! The default source is Sina's public `hq.sinajs.cn` endpoint, which answers
//! with a JavaScript assignment:
//!
//! ```text
//! var hq_str_sh600519="贵州茅台,1700.000,1690.000,1712.500,...";
//! ```
//!
//! Field 0 is the name, field 2 the previous close, field 3 the last price.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::bare_code;

/// Latest price for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub price: f64,
    /// Display name, when the source returned a readable one
    pub name: Option<String>,
}

/// Source of real-time prices.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Fetch the latest quote for a symbol.
    async fn quote(&self, symbol: &str) -> Result<Quote>;
}

/// Sina Finance quote source.
pub struct SinaQuoteSource {
    client: reqwest::Client,
    base_url: String,
}

impl SinaQuoteSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: "http://hq.sinajs.cn".to_string(),
        }
    }

    /// Exchange-prefixed code as Sina expects it (`sh600519`, `sz000001`).
    pub fn sina_code(symbol: &str) -> String {
        let code = bare_code(symbol);
        let prefix = match code.chars().next() {
            Some('6') | Some('9') | Some('5') => "sh",
            _ => "sz",
        };
        format!("{}{}", prefix, code)
    }
}

impl Default for SinaQuoteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteSource for SinaQuoteSource {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/list={}", self.base_url, Self::sina_code(symbol));

        let response = self
            .client
            .get(&url)
            .header("Referer", "https://finance.sina.com.cn/")
            .send()
            .await
            .context("Failed to send request to Sina")?;

        if !response.status().is_success() {
            anyhow::bail!("Sina quote error: {}", response.status());
        }

        let bytes = response.bytes().await.context("Failed to read Sina response")?;
        let body = String::from_utf8_lossy(&bytes);

        parse_sina_body(&body).with_context(|| format!("Unparseable Sina quote for {}", symbol))
    }
}

/// Parse a Sina quote assignment.
///
/// A last price below 0.01 (suspended, or before the auction) falls back to
/// the previous close.
pub fn parse_sina_body(body: &str) -> Option<Quote> {
    let payload = body.split("=\"").nth(1)?;
    let payload = payload.split('"').next()?;
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() <= 30 {
        return None;
    }

    let mut price: f64 = fields[3].trim().parse().ok()?;
    if price < 0.01 {
        price = fields[2].trim().parse().ok()?;
    }

    let name = fields[0].trim();
    let name = if name.is_empty() || name.contains('\u{FFFD}') {
        None
    } else {
        Some(name.to_string())
    };

    Some(Quote { price, name })
}
