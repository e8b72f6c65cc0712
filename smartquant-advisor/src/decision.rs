//! Decision step: portfolio snapshot in, structured recommendations out.
//!
//! The default client speaks the OpenAI-compatible chat completions API
//! (DeepSeek by default). Model output is parsed leniently: malformed
//! documents become an empty response and malformed list items are skipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use smartquant_common::{Error, LlmSecretsConfig, Strategy};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Request
// ============================================================================

/// Account-level context for the decision.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub cash: f64,
    pub total_assets: f64,
    pub strategy: Strategy,
}

/// Latest-bar indicators handed to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorBrief {
    #[serde(rename = "MA5")]
    pub ma5: f64,
    #[serde(rename = "RSI")]
    pub rsi: f64,
    #[serde(rename = "MACD_Cross")]
    pub macd_cross: i8,
}

/// One tracked instrument.
#[derive(Debug, Clone, Serialize)]
pub struct StockInput {
    pub symbol: String,
    pub name: String,
    pub current_price: f64,
    pub cost_price: f64,
    pub shares: u64,
    pub avail_shares: u64,
    pub market_value: f64,
    pub indicators: IndicatorBrief,
}

impl StockInput {
    /// Unrealized profit in percent, 0 without a cost basis.
    pub fn pnl_pct(&self) -> f64 {
        if self.cost_price > 0.0 {
            (self.current_price - self.cost_price) / self.cost_price * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub summary: PortfolioSummary,
    pub stocks: Vec<StockInput>,
}

// ============================================================================
// Response
// ============================================================================

/// Recommended action for a tracked instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Reduce,
    Clear,
    /// Any label outside the contract; never published
    Unknown,
}

impl From<String> for Action {
    fn from(label: String) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "BUY" => Self::Buy,
            "SELL" => Self::Sell,
            "HOLD" => Self::Hold,
            "REDUCE" => Self::Reduce,
            "CLEAR" => Self::Clear,
            _ => Self::Unknown,
        }
    }
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Reduce => "REDUCE",
            Self::Clear => "CLEAR",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether the action warrants a notification (HOLD is silent).
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Buy | Self::Sell | Self::Reduce | Self::Clear)
    }
}

/// Analysis of one tracked instrument.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StockAdvice {
    #[serde(deserialize_with = "de_required_text")]
    pub symbol: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub name: Option<String>,
    pub action: Action,
    #[serde(default, deserialize_with = "de_shares")]
    pub quantity: u64,
    #[serde(default, deserialize_with = "de_text")]
    pub price_range: String,
    #[serde(default, deserialize_with = "de_text")]
    pub reason: String,
}

/// A new instrument suggested by the model.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Opportunity {
    #[serde(deserialize_with = "de_required_text")]
    pub symbol: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_text")]
    pub price: String,
    #[serde(default, deserialize_with = "de_shares")]
    pub quantity: u64,
    #[serde(default = "min_score", deserialize_with = "de_score")]
    pub recommendation: u8,
    #[serde(default, deserialize_with = "de_text")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionResponse {
    pub stocks_analysis: Vec<StockAdvice>,
    pub market_opportunities: Vec<Opportunity>,
}

impl DecisionResponse {
    /// Build a response from an already-decoded document.
    ///
    /// A bare array is read as `stocks_analysis`. Items that do not match the
    /// schema are skipped individually.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self {
                stocks_analysis: parse_items(items, "stocks_analysis"),
                market_opportunities: Vec::new(),
            },
            Value::Object(map) => {
                let list = |key: &str| match map.get(key) {
                    Some(Value::Array(items)) => items.as_slice(),
                    _ => &[],
                };
                Self {
                    stocks_analysis: parse_items(list("stocks_analysis"), "stocks_analysis"),
                    market_opportunities: parse_items(
                        list("market_opportunities"),
                        "market_opportunities",
                    ),
                }
            }
            _ => Self::default(),
        }
    }

    /// Parse raw model output. Anything unreadable is an empty response.
    pub fn parse(content: &str) -> Self {
        let json = match extract_json(content) {
            Some(json) => json,
            None => {
                warn!("No JSON found in decision output");
                return Self::default();
            }
        };

        match serde_json::from_str::<Value>(json) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                warn!(error = %e, "Malformed decision output");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stocks_analysis.is_empty() && self.market_opportunities.is_empty()
    }
}

fn parse_items<T: for<'de> Deserialize<'de>>(items: &[Value], list: &str) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(list = list, error = %e, "Skipping malformed decision item");
                None
            }
        })
        .collect()
}

/// Find the JSON document in model output: a fenced ```json block, otherwise
/// the first balanced object or array.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some(start) = content.find("```json") {
        let start = start + 7;
        if let Some(end) = content[start..].find("```") {
            return Some(content[start..start + end].trim());
        }
    }

    let start = content.find(['{', '['])?;
    let (open, close) = if content[start..].starts_with('{') {
        ('{', '}')
    } else {
        ('[', ']')
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in content[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&content[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn value_to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn de_text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(value_to_text(&Value::deserialize(d)?))
}

fn de_optional_text<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    let text = value_to_text(&Value::deserialize(d)?);
    Ok(if text.is_empty() { None } else { Some(text) })
}

fn de_required_text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let text = value_to_text(&Value::deserialize(d)?);
    if text.is_empty() {
        return Err(serde::de::Error::custom("empty symbol"));
    }
    Ok(text)
}

fn de_shares<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(value_to_number(&value).map_or(0, |v| v.max(0.0).round() as u64))
}

fn min_score() -> u8 {
    1
}

fn de_score<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u8, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(value_to_number(&value).map_or(min_score(), |v| v.round().clamp(1.0, 100.0) as u8))
}

// ============================================================================
// Client
// ============================================================================

/// Produces recommendations for a decision request.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionResponse>;
}

/// Strategy text included in the prompt.
pub fn strategy_brief(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Aggressive => {
            "【激进策略】追求短期爆发，捕捉龙头。亏损超过 -8% 止损；盈利超过 +20% 后技术面走弱则分批止盈。"
        }
        Strategy::Conservative => {
            "【稳健策略】保本增值，偏好低估值蓝筹和高股息。亏损超过 -5% 立即止损；盈利 +10% 左右逐步落袋。"
        }
        Strategy::Balanced => {
            "【动态均衡策略】兼顾成长与风控，跟随热点轮动。亏损 -6% 至 -8% 触发止损；RSI 超买(>80)或高位放量滞涨时止盈。"
        }
    }
}

const SYSTEM_PROMPT: &str = "你是一名A股顶级基金经理。请只输出JSON。";

/// Render the user prompt for a request.
pub fn build_prompt(request: &DecisionRequest) -> String {
    let summary = &request.summary;
    let cap = summary.strategy.max_position_pct();

    let (held, followed): (Vec<&StockInput>, Vec<&StockInput>) =
        request.stocks.iter().partition(|s| s.shares > 0);

    let held: Vec<Value> = held
        .iter()
        .map(|s| {
            let mut v = serde_json::to_value(s).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut v {
                map.insert("pnl_ratio".into(), Value::String(format!("{:.2}%", s.pnl_pct())));
            }
            v
        })
        .collect();
    let followed: Vec<Value> = followed
        .iter()
        .map(|s| {
            serde_json::json!({
                "symbol": s.symbol,
                "name": s.name,
                "current_price": s.current_price,
                "indicators": s.indicators,
            })
        })
        .collect();

    let pretty = |v: &Vec<Value>| serde_json::to_string_pretty(v).unwrap_or_else(|_| "[]".into());

    format!(
        "根据以下账户状态和持仓数据进行投资决策分析。\n\n\
         【账户概况】\n\
         - 策略风格: {label} {brief}\n\
         - 总资产: {total:.2} 元\n\
         - 可用现金: {cash:.2} 元\n\
         - 单票仓位上限: {cap}% (约 {cap_value:.0} 元)\n\n\
         【当前持仓数据】\n{held}\n\n\
         【已跟踪但未持仓的股票】\n{followed}\n\n\
         【任务要求】\n\
         1. 逐一诊断持仓：结合仓位占比、pnl_ratio、cost_price、avail_shares(当前可卖股数) 与 indicators。\
         MACD_Cross=1 为金叉，-1 为死叉。仓位超过上限且趋势不明确时建议 REDUCE；破位或触及止损线建议 SELL/CLEAR；\
         趋势良好且仓位不足可建议 BUY。卖出数量不得超过 avail_shares。\n\
         2. 逐一诊断未持仓的跟踪股票：金叉或底背离建议 BUY，表现不佳建议 CLEAR。\n\
         3. 结合可用现金推荐 0-5 个更有机会的标的，放入 market_opportunities，没有把握可返回空列表。\n\n\
         【输出格式】合法 JSON 对象，不含 Markdown：\n\
         {{\"stocks_analysis\": [{{\"symbol\": \"代码\", \"name\": \"名称\", \"action\": \"BUY/SELL/HOLD/REDUCE/CLEAR\", \
         \"quantity\": 100的整数倍, \"price_range\": \"20.50-20.80\", \"reason\": \"理由\"}}], \
         \"market_opportunities\": [{{\"symbol\": \"代码\", \"name\": \"名称\", \"price\": \"价格区间\", \
         \"quantity\": 100的整数倍, \"recommendation\": 1到100, \"reason\": \"理由\"}}]}}",
        label = summary.strategy.label(),
        brief = strategy_brief(summary.strategy),
        total = summary.total_assets,
        cash = summary.cash,
        cap = cap,
        cap_value = summary.total_assets * f64::from(cap) / 100.0,
        held = pretty(&held),
        followed = pretty(&followed),
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiDecisionClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiDecisionClient {
    pub fn new(config: &LlmSecretsConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl DecisionClient for OpenAiDecisionClient {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionResponse> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Config("未配置 API Key".into()))?;

        let prompt = build_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.3,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send decision request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::External(format!("decision API {} - {}", status, text)).into());
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse decision API response")?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let parsed = DecisionResponse::parse(&content);
        info!(
            model = %self.model,
            analyses = parsed.stocks_analysis.len(),
            opportunities = parsed.market_opportunities.len(),
            "Decision received"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_malformed_items() {
        let content = r#"{
            "stocks_analysis": [
                {"symbol": "600519", "name": "贵州茅台", "action": "buy", "quantity": "200", "price_range": "1700-1710", "reason": "金叉"},
                {"name": "missing symbol", "action": "SELL"},
                {"symbol": "000001", "action": "PANIC", "quantity": 100},
                {"symbol": "300750", "action": "HOLD", "quantity": 150.4, "price_range": 151.2}
            ],
            "market_opportunities": [
                {"symbol": "002594", "price": "250-255", "quantity": 100, "recommendation": 180, "reason": "新能源"},
                "not an object"
            ]
        }"#;

        let response = DecisionResponse::parse(content);
        assert_eq!(response.stocks_analysis.len(), 3);

        let buy = &response.stocks_analysis[0];
        assert_eq!(buy.action, Action::Buy);
        assert_eq!(buy.quantity, 200);
        assert_eq!(buy.name.as_deref(), Some("贵州茅台"));

        assert_eq!(response.stocks_analysis[1].action, Action::Unknown);
        assert!(!response.stocks_analysis[1].action.is_actionable());

        let hold = &response.stocks_analysis[2];
        assert_eq!(hold.quantity, 150);
        assert_eq!(hold.price_range, "151.2");

        assert_eq!(response.market_opportunities.len(), 1);
        assert_eq!(response.market_opportunities[0].recommendation, 100);
        assert_eq!(response.market_opportunities[0].name, None);
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(DecisionResponse::parse("").is_empty());
        assert!(DecisionResponse::parse("I cannot help with that").is_empty());
        assert!(DecisionResponse::parse("{\"stocks_analysis\": [").is_empty());
        assert!(DecisionResponse::parse("{\"stocks_analysis\": 5}").is_empty());
    }

    #[test]
    fn test_recommendation_stays_in_range() {
        let response = DecisionResponse::parse(
            r#"{"market_opportunities": [
                {"symbol": "600036", "reason": "no score"},
                {"symbol": "601318", "recommendation": "strong"},
                {"symbol": "000858", "recommendation": -3}
            ]}"#,
        );
        let scores: Vec<u8> = response
            .market_opportunities
            .iter()
            .map(|o| o.recommendation)
            .collect();
        assert_eq!(scores, [1, 1, 1]);
    }

    #[test]
    fn test_bare_array_is_stock_analysis() {
        let response = DecisionResponse::parse(r#"[{"symbol": "1", "action": "SELL"}]"#);
        assert_eq!(response.stocks_analysis.len(), 1);
        assert!(response.market_opportunities.is_empty());
    }

    #[test]
    fn test_extract_json_variants() {
        let fenced = "Here you go:\n```json\n{\"a\": 1}\n```\nDone";
        assert_eq!(extract_json(fenced), Some("{\"a\": 1}"));

        let raw = "prefix {\"a\": {\"b\": \"}\"}} suffix";
        assert_eq!(extract_json(raw), Some("{\"a\": {\"b\": \"}\"}}"));

        assert_eq!(extract_json("no json"), None);
        assert_eq!(extract_json("{\"open\": 1"), None);
    }

    #[test]
    fn test_prompt_splits_held_and_followed() {
        let stock = |symbol: &str, shares: u64| StockInput {
            symbol: symbol.into(),
            name: symbol.into(),
            current_price: 11.0,
            cost_price: 10.0,
            shares,
            avail_shares: shares,
            market_value: 11.0 * shares as f64,
            indicators: IndicatorBrief::default(),
        };
        let request = DecisionRequest {
            summary: PortfolioSummary {
                cash: 1000.0,
                total_assets: 2100.0,
                strategy: Strategy::Conservative,
            },
            stocks: vec![stock("600000", 100), stock("000002", 0)],
        };

        let prompt = build_prompt(&request);
        assert!(prompt.contains("单票仓位上限: 15%"));
        assert!(prompt.contains("\"pnl_ratio\": \"10.00%\""));
        assert!(prompt.contains("【稳健策略】"));
        let followed_section = prompt
            .split("【已跟踪但未持仓的股票】")
            .nth(1)
            .and_then(|rest| rest.split("【任务要求】").next())
            .unwrap();
        assert!(followed_section.contains("000002"));
        assert!(!followed_section.contains("pnl_ratio"));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let client = OpenAiDecisionClient::new(&LlmSecretsConfig::default());
        let request = DecisionRequest {
            summary: PortfolioSummary {
                cash: 0.0,
                total_assets: 0.0,
                strategy: Strategy::Balanced,
            },
            stocks: vec![],
        };
        let err: Error = client.decide(&request).await.unwrap_err().into();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_upstream_rejection_is_external_error() {
        use axum::{http::StatusCode, routing::post, Router};

        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = OpenAiDecisionClient::new(&LlmSecretsConfig {
            base_url: format!("http://{}/", addr),
            model: "deepseek-chat".into(),
            api_key: Some("sk-test".into()),
        });
        let request = DecisionRequest {
            summary: PortfolioSummary {
                cash: 1000.0,
                total_assets: 1000.0,
                strategy: Strategy::Balanced,
            },
            stocks: vec![],
        };
        let err: Error = client.decide(&request).await.unwrap_err().into();
        assert_eq!(err.status_code(), 502);
        assert!(err.to_string().contains("overloaded"));
    }
}
