//! Property-based tests for the memory model.
//!
//! Invariants:
//! - Stability never decreases under repeated good/easy reviews at equal gaps
//! - A lapse never increases stability
//! - No scheduled state escapes the valid domain, whatever the input

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use danci_session::services::fsrs::{schedule, LifecycleState, MemoryState, Rating};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_rating() -> impl Strategy<Value = Rating> {
    prop_oneof![
        Just(Rating::Again),
        Just(Rating::Hard),
        Just(Rating::Good),
        Just(Rating::Easy),
    ]
}

fn arb_recall_rating() -> impl Strategy<Value = Rating> {
    prop_oneof![Just(Rating::Good), Just(Rating::Easy)]
}

fn arb_lifecycle() -> impl Strategy<Value = LifecycleState> {
    prop_oneof![
        Just(LifecycleState::New),
        Just(LifecycleState::Learning),
        Just(LifecycleState::Review),
        Just(LifecycleState::Relearning),
    ]
}

/// Anything a corrupted store could hand back.
fn arb_wild_f64() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1000.0f64..1000.0f64,
        Just(0.0),
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(1e300),
    ]
}

fn arb_reviewed_state() -> impl Strategy<Value = MemoryState> {
    (
        f64::MIN_POSITIVE..=365.0f64,               // stability
        1.0f64..=10.0f64,                           // difficulty
        prop_oneof![Just(LifecycleState::Learning), Just(LifecycleState::Review)],
        0u32..50,                                   // repetitions
        0u32..10,                                   // lapses
        0i64..=400,                                 // days since last review
    )
        .prop_map(|(stability, difficulty, lifecycle_state, repetitions, lapses, ago)| {
            let last = t0() - Duration::days(ago);
            MemoryState {
                stability,
                difficulty,
                repetitions,
                lapses,
                lifecycle_state,
                last_reviewed_at: Some(last),
                due_at: last + Duration::days(1),
            }
        })
}

fn arb_any_state() -> impl Strategy<Value = MemoryState> {
    (
        arb_wild_f64(),
        arb_wild_f64(),
        arb_lifecycle(),
        proptest::option::of(-1000i64..=1000i64),
        -1000i64..=1000i64,
    )
        .prop_map(|(stability, difficulty, lifecycle_state, last_offset, due_offset)| MemoryState {
            stability,
            difficulty,
            repetitions: 3,
            lapses: 1,
            lifecycle_state,
            last_reviewed_at: last_offset.map(|days| t0() + Duration::days(days)),
            due_at: t0() + Duration::days(due_offset),
        })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_recall_reviews_never_shrink_stability(
        ratings in proptest::collection::vec(arb_recall_rating(), 1..20),
        gap_days in 0i64..=30,
    ) {
        let mut state = MemoryState::new_item(t0());
        let mut previous = state.stability;
        for (i, rating) in ratings.into_iter().enumerate() {
            let now = t0() + Duration::days(gap_days * i as i64);
            state = schedule(&state, rating, now);
            prop_assert!(
                state.stability >= previous,
                "stability fell from {} to {} at step {}", previous, state.stability, i
            );
            previous = state.stability;
        }
    }

    #[test]
    fn prop_lapse_never_grows_stability(state in arb_reviewed_state(), gap_hours in 0i64..=2000) {
        let next = schedule(&state, Rating::Again, t0() + Duration::hours(gap_hours));
        prop_assert!(next.stability <= state.stability);
        prop_assert_eq!(next.lifecycle_state, LifecycleState::Relearning);
        prop_assert_eq!(next.lapses, state.lapses + 1);
    }

    #[test]
    fn prop_no_invalid_state_escapes(
        state in arb_any_state(),
        rating in arb_rating(),
        now_offset in -1000i64..=1000i64,
    ) {
        let now = t0() + Duration::days(now_offset);
        let next = schedule(&state, rating, now);

        prop_assert!(next.stability.is_finite());
        prop_assert!(next.stability > 0.0);
        prop_assert!(next.difficulty.is_finite());
        prop_assert!((1.0..=10.0).contains(&next.difficulty));
        prop_assert!(next.is_in_domain());
        let reviewed = next.last_reviewed_at.expect("scheduling sets the review time");
        prop_assert!(next.due_at >= reviewed);
    }
}

#[test]
fn lapse_scenario_walks_the_lifecycle_and_damps_regrowth() {
    let day = |n: i64| t0() + Duration::days(n);
    let mut state = MemoryState::new_item(day(0));
    let mut lifecycle = vec![state.lifecycle_state];

    for (n, rating) in [Rating::Good, Rating::Good, Rating::Again, Rating::Good]
        .into_iter()
        .enumerate()
    {
        state = schedule(&state, rating, day(n as i64));
        lifecycle.push(state.lifecycle_state);
    }

    assert_eq!(
        lifecycle,
        [
            LifecycleState::New,
            LifecycleState::Learning,
            LifecycleState::Review,
            LifecycleState::Relearning,
            LifecycleState::Review,
        ]
    );
    assert_eq!(state.lapses, 1);

    let mut clean = MemoryState::new_item(day(0));
    for (n, rating) in [Rating::Good, Rating::Good, Rating::Good].into_iter().enumerate() {
        let at = if n == 2 { day(3) } else { day(n as i64) };
        clean = schedule(&clean, rating, at);
    }

    let interval = |s: &MemoryState| s.due_at - s.last_reviewed_at.unwrap();
    assert!(
        interval(&state) < interval(&clean),
        "lapsed interval {:?} should be shorter than {:?}",
        interval(&state),
        interval(&clean)
    );
    assert!(state.difficulty > clean.difficulty);
}
