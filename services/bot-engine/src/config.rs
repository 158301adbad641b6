//! Engine settings
//!
//! Loaded from an optional TOML file (`ENGINE_CONFIG`, default `engine.toml`)
//! with `ENGINE__SECTION__KEY` environment variables layered on top.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "ENGINE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "engine.toml";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    /// PostgreSQL URL; the in-memory store is used when absent
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub submit: SubmitSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub kill_switch: KillSwitchSettings,
    #[serde(default)]
    pub paper: PaperSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkerSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_concurrent_bots")]
    pub max_concurrent_bots: usize,
    /// Upper bound on one bot's tick, exchange calls included
    #[serde(default = "default_bot_timeout_ms")]
    pub bot_timeout_ms: u64,
}

/// Order submission retry policy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SubmitSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReconcileSettings {
    /// Remaining amount at or below which an order counts as filled
    #[serde(default = "default_fill_tolerance")]
    pub fill_tolerance: Decimal,
    /// How long a submitted order may be missing from the open-orders list
    /// before it is considered canceled
    #[serde(default = "default_missing_order_grace_secs")]
    pub missing_order_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct KillSwitchSettings {
    /// CAS retries per bot during an enable sweep
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

/// Simulated venue used when no real exchange is wired in
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PaperSettings {
    #[serde(default = "default_paper_name")]
    pub name: String,
    #[serde(default = "default_initial_price")]
    pub initial_price: Decimal,
    /// Max move per ticker read, in percent
    #[serde(default = "default_volatility_percent")]
    pub volatility_percent: Decimal,
    #[serde(default = "default_min_amount")]
    pub min_amount: Decimal,
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    #[serde(default = "default_price_precision")]
    pub price_precision: u32,
    #[serde(default = "default_amount_precision")]
    pub amount_precision: u32,
    #[serde(default = "default_quote_balance")]
    pub quote_balance: Decimal,
}

impl Settings {
    /// Load from `$ENGINE_CONFIG` (or `engine.toml`) plus the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// Load from a specific file plus the environment. A missing file is not
    /// an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("ENGINE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_max_connections(),
            log_level: default_log_level(),
            worker: WorkerSettings::default(),
            submit: SubmitSettings::default(),
            reconcile: ReconcileSettings::default(),
            kill_switch: KillSwitchSettings::default(),
            paper: PaperSettings::default(),
        }
    }
}

impl WorkerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn bot_timeout(&self) -> Duration {
        Duration::from_millis(self.bot_timeout_ms)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_bots: default_max_concurrent_bots(),
            bot_timeout_ms: default_bot_timeout_ms(),
        }
    }
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl ReconcileSettings {
    pub fn missing_order_grace(&self) -> Duration {
        Duration::from_secs(self.missing_order_grace_secs)
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            fill_tolerance: default_fill_tolerance(),
            missing_order_grace_secs: default_missing_order_grace_secs(),
        }
    }
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            name: default_paper_name(),
            initial_price: default_initial_price(),
            volatility_percent: default_volatility_percent(),
            min_amount: default_min_amount(),
            min_notional: default_min_notional(),
            price_precision: default_price_precision(),
            amount_precision: default_amount_precision(),
            quote_balance: default_quote_balance(),
        }
    }
}

fn default_max_connections() -> u32 { 20 }
fn default_log_level() -> String { "info".to_string() }
fn default_tick_interval_ms() -> u64 { 5_000 }
fn default_max_concurrent_bots() -> usize { 16 }
fn default_bot_timeout_ms() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_jitter_ms() -> u64 { 250 }
fn default_fill_tolerance() -> Decimal { Decimal::new(1, 8) }
fn default_missing_order_grace_secs() -> u64 { 60 }
fn default_max_cas_retries() -> u32 { 3 }
fn default_paper_name() -> String { "paper".to_string() }
fn default_initial_price() -> Decimal { Decimal::ONE_HUNDRED }
fn default_volatility_percent() -> Decimal { Decimal::ONE }
fn default_min_amount() -> Decimal { Decimal::new(1, 3) }
fn default_min_notional() -> Decimal { Decimal::TEN }
fn default_price_precision() -> u32 { 2 }
fn default_amount_precision() -> u32 { 6 }
fn default_quote_balance() -> Decimal { Decimal::new(10_000, 0) }
