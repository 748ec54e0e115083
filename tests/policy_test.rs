/*!
 * Policy Tests
 * Importance derivation, threshold interpolation, retention budgets
 */

use procwarden::core::config::{MapSource, Tunables, KEY_EMPTY_APP_PERCENT, KEY_MAX_CACHED_PROCESSES};
use procwarden::policy::bands::{
    Importance, CACHED_MAX_SCORE, CACHED_MIN_SCORE, FOREGROUND_SCORE, NATIVE_SCORE,
};
use procwarden::policy::budget::RetentionBudget;
use procwarden::policy::thresholds::{ThresholdParams, ThresholdTable};
use proptest::prelude::*;

proptest! {
    /// A smaller score is never classified as less critical than a larger one
    #[test]
    fn importance_is_monotonic(a in -2000i32..2100, b in -2000i32..2100) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(Importance::from_score(lo) <= Importance::from_score(hi));
    }

    /// Derivation is total and clamps to the outer bands
    #[test]
    fn importance_is_total(score in i32::MIN..i32::MAX) {
        let importance = Importance::from_score(score);
        if score >= CACHED_MAX_SCORE {
            prop_assert_eq!(importance, Importance::Cached);
        }
        if score <= NATIVE_SCORE {
            prop_assert_eq!(importance, Importance::Native);
        }
    }

    /// The interpolation factor is always inside [0, 1]
    #[test]
    fn scale_factor_clamped(mem in 0u64..1_000_000, px in 0u64..100_000_000) {
        let scale = ThresholdTable::scale_factor(mem, px);
        prop_assert!((0.0..=1.0).contains(&scale));
    }

    /// Bucket levels rise with the score no matter the host geometry
    #[test]
    fn thresholds_monotonic(mem in 0u64..16_384, px in 0u64..10_000_000) {
        let table = ThresholdTable::compute(ThresholdParams::new(mem, px));
        for pair in table.buckets().windows(2) {
            prop_assert!(pair[0].0 < pair[1].0);
            prop_assert!(pair[0].1 <= pair[1].1);
        }
    }
}

#[test]
fn foreground_and_cached_are_distinct_bands() {
    assert_eq!(Importance::from_score(FOREGROUND_SCORE), Importance::Foreground);
    assert_eq!(Importance::from_score(CACHED_MIN_SCORE), Importance::Cached);
    assert!(Importance::from_score(FOREGROUND_SCORE) < Importance::from_score(CACHED_MIN_SCORE));
}

#[test]
fn daemon_pairs_are_page_scaled() {
    let table = ThresholdTable::compute(ThresholdParams::new(350, 0));
    let pairs = table.daemon_pairs();
    assert_eq!(pairs.len(), 6);
    for ((score, kb), (pages, pair_score)) in table.buckets().iter().zip(&pairs) {
        assert_eq!(score, pair_score);
        assert_eq!(u64::from(*pages), kb * 1024 / 4096);
    }
}

#[test]
fn budget_derivation_from_source() {
    let mut src = MapSource::new();
    src.set(KEY_MAX_CACHED_PROCESSES, 64);
    src.set(KEY_EMPTY_APP_PERCENT, 25);
    let tunables = Tunables::from_source(&src);
    let budget = RetentionBudget::derive(&tunables);
    assert_eq!(budget.max_cached, 64);
    assert_eq!(budget.max_empty, 16);
}
