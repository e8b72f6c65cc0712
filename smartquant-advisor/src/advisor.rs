//! The decision job run on every open-session tick.
//!
//! Snapshot the portfolio, price each holding, attach its latest indicators,
//! ask the [`DecisionClient`] and publish the actionable results.

use anyhow::Result;
use async_trait::async_trait;
use smartquant_common::Strategy;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::{HistoryStore, QuoteSource};
use crate::decision::{
    DecisionClient, DecisionRequest, DecisionResponse, IndicatorBrief, Opportunity,
    PortfolioSummary, StockAdvice, StockInput,
};
use crate::indicators;
use crate::notification::NotificationDispatcher;
use crate::portfolio::HoldingsStore;
use crate::scheduler::DecisionTask;

pub struct AdvisorJob {
    store: Arc<HoldingsStore>,
    history: HistoryStore,
    quotes: Arc<dyn QuoteSource>,
    client: Arc<dyn DecisionClient>,
    notifier: Arc<NotificationDispatcher>,
    strategy: Strategy,
}

impl AdvisorJob {
    pub fn new(
        store: Arc<HoldingsStore>,
        history: HistoryStore,
        quotes: Arc<dyn QuoteSource>,
        client: Arc<dyn DecisionClient>,
        notifier: Arc<NotificationDispatcher>,
        strategy: Strategy,
    ) -> Self {
        Self {
            store,
            history,
            quotes,
            client,
            notifier,
            strategy,
        }
    }

    /// Assemble the request the next decision would send.
    ///
    /// A failed quote prices the holding at 0.0. Histories too short for
    /// indicators contribute all-zero indicators.
    pub async fn build_request(&self) -> DecisionRequest {
        let portfolio = self.store.snapshot();
        let mut stocks = Vec::with_capacity(portfolio.holdings.len());
        let mut market_value = 0.0;

        for holding in &portfolio.holdings {
            let quote = match self.quotes.quote(&holding.symbol).await {
                Ok(quote) => Some(quote),
                Err(e) => {
                    warn!(symbol = %holding.symbol, error = %e, "Quote unavailable, pricing at 0");
                    None
                }
            };
            let price = quote.as_ref().map_or(0.0, |q| q.price);
            let name = quote
                .and_then(|q| q.name)
                .unwrap_or_else(|| holding.name.clone());

            let value = price * holding.total_shares as f64;
            market_value += value;

            stocks.push(StockInput {
                symbol: holding.symbol.clone(),
                name,
                current_price: price,
                cost_price: holding.cost,
                shares: holding.total_shares,
                avail_shares: holding.avail_shares,
                market_value: value,
                indicators: self.latest_indicators(&holding.symbol),
            });
        }

        DecisionRequest {
            summary: PortfolioSummary {
                cash: portfolio.cash,
                total_assets: portfolio.cash + market_value,
                strategy: self.strategy,
            },
            stocks,
        }
    }

    fn latest_indicators(&self, symbol: &str) -> IndicatorBrief {
        let frame = indicators::compute(&self.history.load(symbol));
        match frame.latest() {
            Some((_, row)) => IndicatorBrief {
                ma5: row.ma5.unwrap_or(0.0),
                rsi: row.rsi.unwrap_or(0.0),
                macd_cross: row.macd_cross,
            },
            None => {
                debug!(symbol = %symbol, status = ?frame.status, "No indicators available");
                IndicatorBrief::default()
            }
        }
    }

    /// Publish every actionable item. Returns the number of signals sent.
    pub async fn publish(&self, response: &DecisionResponse) -> usize {
        let mut published = 0;

        for advice in response.stocks_analysis.iter().filter(|a| a.action.is_actionable()) {
            let title = format!("AI 信号: {} {}", advice.action.as_str(), advice.symbol);
            self.notifier.publish(&title, &format_advice(advice)).await;
            published += 1;
        }

        for opportunity in &response.market_opportunities {
            let title = format!("AI 信号: 推荐 {}", opportunity.symbol);
            self.notifier
                .publish(&title, &format_opportunity(opportunity))
                .await;
            published += 1;
        }

        published
    }
}

pub fn format_advice(advice: &StockAdvice) -> String {
    format!(
        "【{}】{}({}) 价格区间：{}；操作股数：{}\n{}",
        advice.action.as_str(),
        advice.name.as_deref().unwrap_or_default(),
        advice.symbol,
        advice.price_range,
        advice.quantity,
        advice.reason
    )
}

pub fn format_opportunity(opportunity: &Opportunity) -> String {
    format!(
        "【推荐({})】{}({}) 价格区间：{}；操作股数：{}\n{}",
        opportunity.recommendation,
        opportunity.name.as_deref().unwrap_or_default(),
        opportunity.symbol,
        opportunity.price,
        opportunity.quantity,
        opportunity.reason
    )
}

#[async_trait]
impl DecisionTask for AdvisorJob {
    async fn run(&self) -> Result<()> {
        let request = self.build_request().await;
        if request.stocks.is_empty() {
            debug!("No holdings, skipping decision");
            return Ok(());
        }

        info!(
            holdings = request.stocks.len(),
            total_assets = request.summary.total_assets,
            strategy = request.summary.strategy.label(),
            "Requesting decision"
        );

        let response = self.client.decide(&request).await?;
        let published = self.publish(&response).await;
        info!(
            analyses = response.stocks_analysis.len(),
            opportunities = response.market_opportunities.len(),
            published,
            "Decision completed"
        );
        Ok(())
    }
}
