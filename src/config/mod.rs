//! Configuration for the reconciliation worker and per-property tunables.

use crate::error::AppError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;

/// Worker-level configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service_name: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    /// Directory the upload collaborator drops statement files into.
    pub statement_dir: String,
    /// Soft wall-clock budget for one batch run, in seconds.
    pub batch_timeout_secs: u64,
    /// Sleep between polls for pending batches, in seconds.
    pub poll_interval_secs: u64,
    /// Base currency assumed for properties with no stored configuration.
    pub default_currency: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "property-reconciliation".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            statement_dir: env::var("STATEMENT_DIR")
                .unwrap_or_else(|_| "/var/lib/recon/statements".to_string()),
            batch_timeout_secs: env::var("BATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            poll_interval_secs: env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            default_currency: env::var("DEFAULT_BASE_CURRENCY")
                .unwrap_or_else(|_| "ARS".to_string()),
        })
    }
}

/// An exchange rate usable for statement lines whose date falls within
/// [`RATE_VALIDITY_DAYS`] of `rate_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Currency the rate converts from, e.g. "USD".
    pub currency: String,
    /// Multiplier into the base currency.
    pub rate: Decimal,
    pub rate_date: NaiveDate,
}

/// How many days an exchange rate stays usable around its rate date.
pub const RATE_VALIDITY_DAYS: i64 = 7;

/// CSV dialect of one property's bank export. Column names are settings,
/// never hard-coded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvDialect {
    /// Encoding label understood by encoding_rs, e.g. "utf-8" or "windows-1252".
    pub encoding: String,
    pub delimiter: char,
    pub date_column: String,
    pub description_column: String,
    pub amount_column: String,
    pub currency_column: Option<String>,
    pub reference_column: Option<String>,
}

/// Per-property reconciliation tunables. Shared, read-only input to every
/// component; loaded once per batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub base_currency: String,
    pub exchange_rate: Option<ExchangeRate>,

    pub exact_date_tolerance_days: i64,
    pub fuzzy_date_tolerance_days: i64,
    /// Percent of the payment amount, e.g. 2 means 2%.
    pub fuzzy_amount_tolerance_pct: Decimal,
    pub partial_date_tolerance_days: i64,
    pub partial_amount_tolerance_pct: Decimal,

    /// Confidence at or above which a match confirms without review.
    pub auto_confirm_threshold: f64,
    /// Confidence at or above which a match is queued for staff review.
    pub pending_review_threshold: f64,

    /// Fraction of unmatched transactions (0..1) above which an alert is
    /// raised after batch completion.
    pub unmatched_alert_threshold: f64,

    pub csv: CsvDialect,
}

impl ReconciliationConfig {
    /// The one documented default factory, used when a property has no stored
    /// configuration: exact 0 days, fuzzy 2% / 3 days, partial 10% / 7 days,
    /// auto-confirm 90, pending-review 50, alert above 50% unmatched.
    pub fn default_for(base_currency: &str) -> Self {
        Self {
            base_currency: base_currency.to_string(),
            exchange_rate: None,
            exact_date_tolerance_days: 0,
            fuzzy_date_tolerance_days: 3,
            fuzzy_amount_tolerance_pct: Decimal::new(2, 0),
            partial_date_tolerance_days: 7,
            partial_amount_tolerance_pct: Decimal::new(10, 0),
            auto_confirm_threshold: 90.0,
            pending_review_threshold: 50.0,
            unmatched_alert_threshold: 0.5,
            csv: CsvDialect {
                encoding: "utf-8".to_string(),
                delimiter: ',',
                date_column: "fecha".to_string(),
                description_column: "descripcion".to_string(),
                amount_column: "importe".to_string(),
                currency_column: Some("moneda".to_string()),
                reference_column: Some("referencia".to_string()),
            },
        }
    }

    /// Threshold sanity check, run before any transaction is processed.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pending_review_threshold < 0.0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "pending_review_threshold must be >= 0, got {}",
                self.pending_review_threshold
            )));
        }
        if self.auto_confirm_threshold <= self.pending_review_threshold {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "auto_confirm_threshold ({}) must be greater than pending_review_threshold ({})",
                self.auto_confirm_threshold,
                self.pending_review_threshold
            )));
        }
        if self.fuzzy_amount_tolerance_pct < Decimal::ZERO
            || self.partial_amount_tolerance_pct < Decimal::ZERO
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "amount tolerances must not be negative"
            )));
        }
        Ok(())
    }
}
