//! SmartQuant Advisor
//!
//! Tracks a manually maintained A-share portfolio under T+1 settlement and
//! drives a market-aware decision loop around it.
//!
//! # Architecture
//!
//! ```text
//! timer tick ─► MarketScheduler ─┬─ OPEN   ─► AdvisorJob ─► DecisionClient ─► NotificationDispatcher
//!                                ├─ BREAK  ─► (mark session)
//!                                └─ CLOSED ─► DailyUpdateJob ──success──► ScanJob ─► NotificationDispatcher
//!
//! HoldingsStore (portfolio.json)   HistoryStore (history/*.csv)   indicators::compute
//! ```
//!
//! # T+1 Settlement
//! - Shares bought today are locked until the next trading day
//! - The lock is stored as `(locked_shares, locked_date)` and released on load
//! - `avail_shares` is always derived, never trusted from disk

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod advisor;
pub mod data;
pub mod decision;
pub mod indicators;
pub mod notification;
pub mod portfolio;
pub mod routes;
pub mod scheduler;
pub mod screener;
pub mod session;

use anyhow::Result;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use smartquant_common::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::advisor::AdvisorJob;
use crate::data::{DailyUpdateJob, HistoryStore, SinaQuoteSource};
use crate::decision::OpenAiDecisionClient;
use crate::notification::NotificationDispatcher;
use crate::portfolio::HoldingsStore;
use crate::scheduler::MarketScheduler;
use crate::screener::ScanJob;

/// Advisor service state
pub struct AdvisorState {
    /// Configuration
    pub config: Config,
    /// Portfolio persistence
    pub store: Arc<HoldingsStore>,
    /// Local price history
    pub history: HistoryStore,
    /// Decision job, shared with the scheduler
    pub advisor: Arc<AdvisorJob>,
    /// Market-aware scheduler
    pub scheduler: MarketScheduler,
}

impl AdvisorState {
    /// Wire every component from configuration
    pub fn new(config: Config) -> Self {
        let data_dir = config.data_dir();
        let store = Arc::new(HoldingsStore::new(&data_dir));
        let history = HistoryStore::new(&data_dir);
        let notifier = Arc::new(NotificationDispatcher::from_config(&config));

        let advisor = Arc::new(AdvisorJob::new(
            Arc::clone(&store),
            history.clone(),
            Arc::new(SinaQuoteSource::new()),
            Arc::new(OpenAiDecisionClient::new(&config.secrets.llm)),
            Arc::clone(&notifier),
            config.scheduler.strategy,
        ));

        let update_job = Arc::new(DailyUpdateJob::new(
            config.secrets.tushare_tokens.clone(),
            history.clone(),
        ));
        let scan_job = Arc::new(ScanJob::new(
            history.clone(),
            &data_dir,
            config.advisor.scan_strategy,
            config.advisor.scan_top_n,
            notifier,
        ));

        let scheduler = MarketScheduler::new(
            update_job,
            scan_job,
            advisor.clone(),
            Duration::from_secs(config.scheduler.period_minutes.saturating_mul(60)),
        );

        Self {
            config,
            store,
            history,
            advisor,
            scheduler,
        }
    }
}

/// Build the HTTP router over shared state.
pub fn router(state: Arc<AdvisorState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/portfolio", get(routes::get_portfolio))
        .route("/api/v1/portfolio/cash", put(routes::update_cash))
        .route("/api/v1/portfolio/holdings", post(routes::upsert_holding))
        .route("/api/v1/portfolio/holdings/:symbol", delete(routes::delete_holding))
        .route("/api/v1/scheduler/status", get(routes::scheduler_status))
        .route("/api/v1/indicators/:symbol", get(routes::get_indicators))
        .route("/api/v1/decision/preview", get(routes::decision_preview))
        .with_state(state)
}

/// Main advisor service
pub struct AdvisorService {
    state: Arc<AdvisorState>,
}

impl AdvisorService {
    pub fn new(config: Config) -> Self {
        Self {
            state: Arc::new(AdvisorState::new(config)),
        }
    }

    pub fn state(&self) -> &Arc<AdvisorState> {
        &self.state
    }

    /// Run the scheduler, and the HTTP API when enabled, until Ctrl+C.
    pub async fn start(self) -> Result<()> {
        let scheduler = self.state.scheduler.clone();
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        let advisor = &self.state.config.advisor;
        if advisor.http_enabled {
            let addr: SocketAddr = format!("{}:{}", advisor.host, advisor.port).parse()?;
            tracing::info!(address = %addr, "Starting HTTP server");

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router(Arc::clone(&self.state)))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        } else {
            shutdown_signal().await;
        }

        tracing::info!("Shutting down, stopping scheduler");
        scheduler_handle.abort();
        let _ = scheduler_handle.await;
        self.state.scheduler.wait_idle().await;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
