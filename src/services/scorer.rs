//! Tiered confidence scoring between one bank transaction and one candidate
//! payment.
//!
//! Scoring is pure and deterministic: no randomness, no clock, and the only
//! rounding is the documented 2-decimal confidence rounding. The engine
//! performs the side effects separately.

use crate::config::ReconciliationConfig;
use crate::models::{MatchType, PendingPayment};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// An immutable scoring outcome for one (transaction, payment) pair.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub payment: PendingPayment,
    pub match_type: MatchType,
    /// 0..=100, rounded to 2 decimals.
    pub confidence: f64,
    pub amount_difference: Decimal,
    pub date_difference_days: i64,
}

impl MatchCandidate {
    /// Deterministic candidate ordering: higher confidence, then stricter
    /// tier, then smaller date distance, then smaller amount distance, then
    /// the payment recorded earliest.
    pub fn outranks(&self, other: &MatchCandidate) -> bool {
        match self
            .confidence
            .partial_cmp(&other.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => {}
        }
        if self.match_type.tier_rank() != other.match_type.tier_rank() {
            return self.match_type.tier_rank() < other.match_type.tier_rank();
        }
        if self.date_difference_days != other.date_difference_days {
            return self.date_difference_days < other.date_difference_days;
        }
        if self.amount_difference != other.amount_difference {
            return self.amount_difference < other.amount_difference;
        }
        self.payment.created_utc < other.payment.created_utc
    }
}

/// Score one transaction against one payment. Returns `None` when no tier's
/// tolerances hold. Tiers are checked strictest first, so an exact hit never
/// degrades to fuzzy and a fuzzy hit never degrades to partial.
pub fn score(
    tx_amount: Decimal,
    tx_date: NaiveDate,
    payment: &PendingPayment,
    config: &ReconciliationConfig,
) -> Option<MatchCandidate> {
    let amount_diff = (tx_amount - payment.amount).abs();
    let date_diff = (tx_date - payment.reference_date).num_days().abs();

    let candidate = |match_type, confidence| MatchCandidate {
        payment: payment.clone(),
        match_type,
        confidence,
        amount_difference: amount_diff,
        date_difference_days: date_diff,
    };

    if amount_diff.is_zero() && date_diff <= config.exact_date_tolerance_days {
        return Some(candidate(MatchType::Exact, 100.0));
    }

    let fuzzy_amount_tol = pct_of(payment.amount, config.fuzzy_amount_tolerance_pct);
    if amount_diff <= fuzzy_amount_tol && date_diff <= config.fuzzy_date_tolerance_days {
        let confidence = tier_confidence(
            amount_diff,
            fuzzy_amount_tol,
            date_diff,
            config.fuzzy_date_tolerance_days,
            100.0,
            20.0,
        );
        return Some(candidate(MatchType::Fuzzy, confidence));
    }

    let partial_amount_tol = pct_of(payment.amount, config.partial_amount_tolerance_pct);
    if amount_diff <= partial_amount_tol && date_diff <= config.partial_date_tolerance_days {
        let confidence = tier_confidence(
            amount_diff,
            partial_amount_tol,
            date_diff,
            config.partial_date_tolerance_days,
            60.0,
            30.0,
        );
        return Some(candidate(MatchType::Partial, confidence));
    }

    None
}

/// Score against a whole pending-payment snapshot and keep the single best
/// candidate under [`MatchCandidate::outranks`].
pub fn best_candidate(
    tx_amount: Decimal,
    tx_date: NaiveDate,
    payments: &[PendingPayment],
    config: &ReconciliationConfig,
) -> Option<MatchCandidate> {
    let mut best: Option<MatchCandidate> = None;
    for payment in payments {
        if let Some(candidate) = score(tx_amount, tx_date, payment, config) {
            let better = match &best {
                Some(current) => candidate.outranks(current),
                None => true,
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

fn pct_of(amount: Decimal, pct: Decimal) -> Decimal {
    (amount.abs() * pct) / Decimal::new(100, 0)
}

/// Average of the per-dimension decayed scores:
/// `max(0, ceiling − (actual/tolerance)·slope)` for amount and for date.
fn tier_confidence(
    amount_diff: Decimal,
    amount_tolerance: Decimal,
    date_diff: i64,
    date_tolerance: i64,
    ceiling: f64,
    slope: f64,
) -> f64 {
    let amount_ratio = ratio(amount_diff, amount_tolerance);
    let date_ratio = if date_tolerance <= 0 {
        0.0
    } else {
        date_diff as f64 / date_tolerance as f64
    };

    let amount_score = (ceiling - amount_ratio * slope).max(0.0);
    let date_score = (ceiling - date_ratio * slope).max(0.0);
    round2((amount_score + date_score) / 2.0)
}

fn ratio(actual: Decimal, tolerance: Decimal) -> f64 {
    // A zero tolerance only admits a zero distance; the tier check already
    // guaranteed that, so the ratio is zero.
    if tolerance.is_zero() {
        return 0.0;
    }
    (actual / tolerance).to_f64().unwrap_or(1.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
