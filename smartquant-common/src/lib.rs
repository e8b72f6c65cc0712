//! SmartQuant Common - Shared configuration, logging, and error types.
//!
//! This crate provides:
//! - Configuration types and loading (`~/.smartquant/config.json`)
//! - Error types and handling utilities
//! - Logging setup with noise filtering

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    AdvisorConfig, Config, LlmSecretsConfig, NotificationConfig, ObservabilityConfig,
    ScanStrategy, SchedulerConfig, SecretsConfig, Strategy, WxPusherSecretsConfig,
};
pub use error::{Error, Result};
