//! Conversion of statement amounts into the reconciliation base currency.

use crate::config::{ReconciliationConfig, RATE_VALIDITY_DAYS};
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

/// Outcome of normalizing one statement amount.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Amount to score with. Stays the stated amount when no usable rate
    /// exists; `rate_missing` marks that case.
    pub amount: Decimal,
    /// Original stated amount, kept when a conversion happened or was needed.
    pub original_amount: Option<Decimal>,
    /// True when the currency is foreign and no configured rate applies.
    /// The engine caps such transactions at pending review instead of
    /// failing the batch.
    pub rate_missing: bool,
}

/// Convert `amount` in `currency` on `date` into the base currency.
///
/// A configured rate applies only to its own currency and only within
/// [`RATE_VALIDITY_DAYS`] of its rate date.
pub fn normalize(
    amount: Decimal,
    currency: &str,
    date: NaiveDate,
    config: &ReconciliationConfig,
) -> Normalized {
    if currency.eq_ignore_ascii_case(&config.base_currency) {
        return Normalized {
            amount,
            original_amount: None,
            rate_missing: false,
        };
    }

    let usable_rate = config.exchange_rate.as_ref().filter(|rate| {
        rate.currency.eq_ignore_ascii_case(currency)
            && (date - rate.rate_date).num_days().abs() <= RATE_VALIDITY_DAYS
    });

    match usable_rate {
        Some(rate) => Normalized {
            amount: (amount * rate.rate)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            original_amount: Some(amount),
            rate_missing: false,
        },
        None => Normalized {
            amount,
            original_amount: Some(amount),
            rate_missing: true,
        },
    }
}
