//! Scoring behavior: tier selection, confidence decay, candidate ordering.

mod common;

use chrono::Utc;
use common::{cents, date, payment};
use property_reconciliation::config::{ExchangeRate, ReconciliationConfig};
use property_reconciliation::models::MatchType;
use property_reconciliation::services::currency;
use property_reconciliation::services::scorer::{best_candidate, score, MatchCandidate};
use rust_decimal::Decimal;

fn config() -> ReconciliationConfig {
    ReconciliationConfig::default_for("ARS")
}

#[test]
fn exact_hit_scores_one_hundred() {
    let p = payment(cents(100_000), date(2024, 3, 1));
    let c = score(cents(100_000), date(2024, 3, 1), &p, &config()).unwrap();
    assert_eq!(c.match_type, MatchType::Exact);
    assert_eq!(c.confidence, 100.0);
    assert_eq!(c.amount_difference, Decimal::ZERO);
    assert_eq!(c.date_difference_days, 0);
}

#[test]
fn exact_requires_zero_amount_difference() {
    let p = payment(cents(100_000), date(2024, 3, 1));
    let c = score(cents(100_100), date(2024, 3, 1), &p, &config()).unwrap();
    assert_eq!(c.match_type, MatchType::Fuzzy);
    assert_eq!(c.confidence, 99.5);
}

#[test]
fn fuzzy_decay_matches_hand_computed_value() {
    // 1% of a 2% tolerance -> amount score 90; 1 of 3 days -> date score
    // 100 - 20/3 = 93.33...; mean 91.67.
    let p = payment(cents(100_000), date(2024, 3, 1));
    let c = score(cents(101_000), date(2024, 3, 2), &p, &config()).unwrap();
    assert_eq!(c.match_type, MatchType::Fuzzy);
    assert_eq!(c.confidence, 91.67);
}

#[test]
fn partial_tier_uses_lower_ceiling() {
    // 5% amount difference falls outside fuzzy (2%) but inside partial (10%):
    // amount score 60 - 0.5*30 = 45, date score 60, mean 52.5.
    let p = payment(cents(100_000), date(2024, 3, 1));
    let c = score(cents(105_000), date(2024, 3, 1), &p, &config()).unwrap();
    assert_eq!(c.match_type, MatchType::Partial);
    assert_eq!(c.confidence, 52.5);
}

#[test]
fn outside_all_tolerances_scores_nothing() {
    let p = payment(cents(100_000), date(2024, 3, 1));
    assert!(score(cents(120_000), date(2024, 3, 1), &p, &config()).is_none());
    assert!(score(cents(100_000), date(2024, 3, 20), &p, &config()).is_none());
}

#[test]
fn worst_fuzzy_still_beats_best_partial() {
    let cfg = config();
    let p = payment(cents(100_000), date(2024, 3, 1));
    // At both fuzzy tolerance edges: 80/80.
    let fuzzy = score(cents(102_000), date(2024, 3, 4), &p, &cfg).unwrap();
    assert_eq!(fuzzy.match_type, MatchType::Fuzzy);
    assert_eq!(fuzzy.confidence, 80.0);
    // Best possible partial (zero distances never reach it; closest partial
    // sits just outside fuzzy).
    let partial = score(cents(102_001), date(2024, 3, 1), &p, &cfg).unwrap();
    assert_eq!(partial.match_type, MatchType::Partial);
    assert!(partial.confidence < fuzzy.confidence);
}

#[test]
fn confidence_decays_monotonically_within_a_tier() {
    let cfg = config();
    let p = payment(cents(100_000), date(2024, 3, 1));
    let mut last = 101.0;
    for diff in [200, 600, 1000, 1400, 1800] {
        let c = score(cents(100_000 + diff), date(2024, 3, 2), &p, &cfg).unwrap();
        assert_eq!(c.match_type, MatchType::Fuzzy);
        assert!(c.confidence <= last, "confidence rose at diff {}", diff);
        last = c.confidence;
    }
}

#[test]
fn zero_date_tolerance_scores_the_ceiling() {
    let mut cfg = config();
    cfg.fuzzy_date_tolerance_days = 0;
    let p = payment(cents(100_000), date(2024, 3, 1));
    let c = score(cents(101_000), date(2024, 3, 1), &p, &cfg).unwrap();
    assert_eq!(c.match_type, MatchType::Fuzzy);
    // Amount score 90, date score at the ceiling.
    assert_eq!(c.confidence, 95.0);
}

#[test]
fn scoring_is_invariant_under_currency_restatement() {
    // The same economic value stated in USD and converted must score exactly
    // like the ARS statement of it.
    let mut cfg = config();
    cfg.exchange_rate = Some(ExchangeRate {
        currency: "USD".to_string(),
        rate: Decimal::new(950, 0),
        rate_date: date(2024, 3, 1),
    });
    let p = payment(cents(9_500_000), date(2024, 3, 1));

    let native = score(cents(9_500_000), date(2024, 3, 2), &p, &cfg).unwrap();

    let restated = currency::normalize(cents(10_000), "USD", date(2024, 3, 2), &cfg);
    assert!(!restated.rate_missing);
    let converted = score(restated.amount, date(2024, 3, 2), &p, &cfg).unwrap();

    assert_eq!(native.confidence, converted.confidence);
    assert_eq!(native.match_type, converted.match_type);
}

#[test]
fn best_candidate_prefers_higher_confidence() {
    let cfg = config();
    let close = payment(cents(100_000), date(2024, 3, 1));
    let far = payment(cents(101_500), date(2024, 3, 1));
    let best = best_candidate(
        cents(100_000),
        date(2024, 3, 1),
        &[far, close.clone()],
        &cfg,
    )
    .unwrap();
    assert_eq!(best.payment.external_id, close.external_id);
    assert_eq!(best.confidence, 100.0);
}

#[test]
fn full_tie_breaks_on_earliest_payment() {
    let cfg = config();
    let mut older = payment(cents(100_000), date(2024, 3, 1));
    older.created_utc = Utc::now() - chrono::Duration::days(2);
    let newer = payment(cents(100_000), date(2024, 3, 1));

    let best = best_candidate(
        cents(100_000),
        date(2024, 3, 1),
        &[newer, older.clone()],
        &cfg,
    )
    .unwrap();
    assert_eq!(best.payment.external_id, older.external_id);
}

#[test]
fn outranks_orders_by_date_then_amount_distance() {
    let cfg = config();
    let p = payment(cents(100_000), date(2024, 3, 1));

    let near_date = score(cents(101_000), date(2024, 3, 2), &p, &cfg).unwrap();
    let far_date = score(cents(101_000), date(2024, 3, 3), &p, &cfg).unwrap();
    assert!(near_date.outranks(&far_date));
    assert!(!far_date.outranks(&near_date));

    fn with_confidence(c: &MatchCandidate, confidence: f64) -> MatchCandidate {
        MatchCandidate {
            confidence,
            ..c.clone()
        }
    }
    // Same confidence and date distance: smaller amount distance wins.
    let small_amount = with_confidence(
        &score(cents(100_500), date(2024, 3, 2), &p, &cfg).unwrap(),
        90.0,
    );
    let large_amount = with_confidence(
        &score(cents(101_500), date(2024, 3, 2), &p, &cfg).unwrap(),
        90.0,
    );
    assert!(small_amount.outranks(&large_amount));
}
