use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retention reached when `elapsed == stability`; anchors the forgetting curve.
const CURVE_RETENTION: f64 = 0.9;
const MS_PER_DAY: f64 = 86_400_000.0;
const RELEARN_DELAY_MINUTES: i64 = 5;
const HARD_DELAY_HOURS: i64 = 12;
const DIFFICULTY_MIN: f64 = 1.0;
const DIFFICULTY_MAX: f64 = 10.0;
const DIFFICULTY_FALLBACK: f64 = 5.0;
pub const MASTERED_STABILITY_DAYS: f64 = 14.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsrsParams {
    pub w: [f64; 17],
    pub target_retention: f64,
    pub max_interval_days: f64,
    pub min_stability: f64,
}

impl Default for FsrsParams {
    fn default() -> Self {
        Self {
            w: [
                0.4, 0.6, 2.4, 5.8, // w0-w3: initial stability
                4.93, 0.94, 0.86, 0.01, 1.49, // w4-w8
                0.14, 0.94, 2.18, 0.05, 0.34, // w9-w13
                1.26, 0.29, 2.61, // w14-w16
            ],
            target_retention: 0.9,
            max_interval_days: 365.0,
            min_stability: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Again = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl Rating {
    pub const ALL: [Rating; 4] = [Rating::Again, Rating::Hard, Rating::Good, Rating::Easy];

    pub fn grade(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Again => "again",
            Self::Hard => "hard",
            Self::Good => "good",
            Self::Easy => "easy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    New,
    Learning,
    Review,
    Relearning,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Learning => "learning",
            Self::Review => "review",
            Self::Relearning => "relearning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryState {
    pub stability: f64,
    pub difficulty: f64,
    pub repetitions: u32,
    pub lapses: u32,
    pub lifecycle_state: LifecycleState,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub due_at: DateTime<Utc>,
}

impl MemoryState {
    /// Never-reviewed item, due immediately.
    pub fn new_item(now: DateTime<Utc>) -> Self {
        let params = FsrsParams::default();
        Self {
            stability: params.min_stability,
            difficulty: DIFFICULTY_FALLBACK,
            repetitions: 0,
            lapses: 0,
            lifecycle_state: LifecycleState::New,
            last_reviewed_at: None,
            due_at: now,
        }
    }

    pub fn is_new(&self) -> bool {
        self.lifecycle_state == LifecycleState::New
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    /// `false` when scheduling from this state would need clamping.
    pub fn is_in_domain(&self) -> bool {
        self.stability.is_finite()
            && self.stability > 0.0
            && self.difficulty.is_finite()
            && (DIFFICULTY_MIN..=DIFFICULTY_MAX).contains(&self.difficulty)
    }

    pub fn elapsed_days(&self, now: DateTime<Utc>) -> f64 {
        self.last_reviewed_at
            .map(|last| (now - last).num_milliseconds() as f64 / MS_PER_DAY)
            .filter(|days| days.is_finite())
            .unwrap_or(0.0)
            .max(0.0)
    }
}

/// Recall probability after `elapsed_days`; exactly 0.9 when `elapsed_days == stability`.
pub fn retrievability(stability: f64, elapsed_days: f64) -> f64 {
    if !stability.is_finite() || stability <= 0.0 {
        return 0.0;
    }
    let elapsed = if elapsed_days.is_finite() {
        elapsed_days.max(0.0)
    } else {
        0.0
    };
    (CURVE_RETENTION.ln() * elapsed / stability).exp()
}

/// Whole days until retrievability falls to the target retention, within `[1, max_interval_days]`.
pub fn next_interval_days(stability: f64, params: &FsrsParams) -> f64 {
    let retention = params.target_retention.clamp(0.0001, 0.9999);
    let raw = (stability * retention.ln() / CURVE_RETENTION.ln()).round();
    if !raw.is_finite() {
        return 1.0;
    }
    raw.clamp(1.0, params.max_interval_days.max(1.0))
}

pub fn schedule(state: &MemoryState, rating: Rating, now: DateTime<Utc>) -> MemoryState {
    schedule_with(state, rating, now, &FsrsParams::default())
}

pub fn schedule_with(
    state: &MemoryState,
    rating: Rating,
    now: DateTime<Utc>,
    params: &FsrsParams,
) -> MemoryState {
    let current = sanitize(state, params);
    let w = &params.w;
    let mut next = current.clone();
    next.repetitions = current.repetitions.saturating_add(1);

    if current.is_new() {
        next.lifecycle_state = LifecycleState::Learning;
        next.stability = initial_stability(w, rating);
        next.difficulty = initial_difficulty(rating);
    } else {
        let elapsed = current.elapsed_days(now);
        let r = retrievability(current.stability, elapsed);
        next.difficulty = next_difficulty(w, current.difficulty, rating);

        if rating == Rating::Again {
            next.lapses = current.lapses.saturating_add(1);
            next.lifecycle_state = LifecycleState::Relearning;
            next.stability = next_forget_stability(w, current.difficulty, current.stability, r);
        } else {
            next.lifecycle_state = LifecycleState::Review;
            next.stability =
                next_recall_stability(w, current.difficulty, current.stability, r, rating);
        }
    }

    next.stability = guard_stability(next.stability, params);
    if rating == Rating::Again && !current.is_new() {
        // The floor must not lift a lapse above where it started.
        next.stability = next.stability.min(current.stability);
    }
    next.difficulty = guard_difficulty(next.difficulty);

    // A review in the past would break `due_at >= last_reviewed_at` for the previous entry.
    let reviewed_at = match current.last_reviewed_at {
        Some(last) if last > now => last,
        _ => now,
    };
    next.last_reviewed_at = Some(reviewed_at);

    let interval = next_interval_days(next.stability, params);
    next.due_at = match rating {
        Rating::Again => reviewed_at + Duration::minutes(RELEARN_DELAY_MINUTES),
        Rating::Hard => reviewed_at + Duration::hours(HARD_DELAY_HOURS),
        Rating::Good | Rating::Easy => {
            reviewed_at + Duration::milliseconds((interval * MS_PER_DAY) as i64)
        }
    };

    next
}

fn initial_stability(w: &[f64; 17], rating: Rating) -> f64 {
    w[(rating.grade() - 1) as usize]
}

fn initial_difficulty(rating: Rating) -> f64 {
    match rating {
        Rating::Again => 10.0,
        Rating::Hard => 7.0,
        Rating::Good => 5.0,
        Rating::Easy => 3.0,
    }
}

fn next_difficulty(w: &[f64; 17], d: f64, rating: Rating) -> f64 {
    let delta = (rating.grade() - 3) as f64;
    (d - w[6] * delta).clamp(DIFFICULTY_MIN, DIFFICULTY_MAX)
}

fn next_recall_stability(w: &[f64; 17], d: f64, s: f64, r: f64, rating: Rating) -> f64 {
    let hard_penalty = if rating == Rating::Hard { w[15] } else { 1.0 };
    let easy_bonus = if rating == Rating::Easy { w[16] } else { 1.0 };

    s * (1.0
        + w[8].exp()
            * (11.0 - d)
            * s.powf(-w[9])
            * ((1.0 - r) * w[10]).exp_m1()
            * hard_penalty
            * easy_bonus)
}

fn next_forget_stability(w: &[f64; 17], d: f64, s: f64, r: f64) -> f64 {
    let candidate =
        w[11] * d.powf(-w[12]) * ((s + 1.0).powf(w[13]) - 1.0) * ((1.0 - r) * w[14]).exp();
    candidate.min(s)
}

/// Valid stored values pass through untouched, including stabilities below the
/// floor; only non-finite or non-positive values are replaced.
fn sanitize(state: &MemoryState, params: &FsrsParams) -> MemoryState {
    let mut clean = state.clone();
    if !state.stability.is_finite() || state.stability <= 0.0 {
        warn!(stability = state.stability, "memory model fault: stability out of domain, clamping");
        clean.stability = params.min_stability;
    }
    clean.difficulty = guard_difficulty(state.difficulty);
    clean
}

fn guard_stability(stability: f64, params: &FsrsParams) -> f64 {
    if !stability.is_finite() || stability < params.min_stability {
        return params.min_stability;
    }
    stability
}

fn guard_difficulty(difficulty: f64) -> f64 {
    if !difficulty.is_finite() {
        warn!(difficulty, "memory model fault: non-finite difficulty, resetting");
        return DIFFICULTY_FALLBACK;
    }
    difficulty.clamp(DIFFICULTY_MIN, DIFFICULTY_MAX)
}

/// Counted as mastered once the item holds more than two weeks of stability in review.
pub fn is_mastered(state: &MemoryState) -> bool {
    state.lifecycle_state == LifecycleState::Review && state.stability > MASTERED_STABILITY_DAYS
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_new_item_good_rating() {
        let state = MemoryState::new_item(t0());
        let next = schedule(&state, Rating::Good, t0());
        assert_eq!(next.lifecycle_state, LifecycleState::Learning);
        assert_eq!(next.repetitions, 1);
        assert!((next.stability - 2.4).abs() < 1e-9);
        assert!((next.difficulty - 5.0).abs() < 1e-9);
        assert_eq!(next.last_reviewed_at, Some(t0()));
        assert_eq!(next.due_at, t0() + Duration::days(2));
    }

    #[test]
    fn test_initial_tables_order_by_rating() {
        let state = MemoryState::new_item(t0());
        let results: Vec<MemoryState> = Rating::ALL
            .iter()
            .map(|r| schedule(&state, *r, t0()))
            .collect();
        for pair in results.windows(2) {
            assert!(pair[0].stability < pair[1].stability);
            assert!(pair[0].difficulty > pair[1].difficulty);
        }
    }

    #[test]
    fn test_retrievability_decay() {
        let r_0 = retrievability(10.0, 0.0);
        let r_5 = retrievability(10.0, 5.0);
        let r_10 = retrievability(10.0, 10.0);
        assert!(r_0 > r_5);
        assert!(r_5 > r_10);
        assert!((r_0 - 1.0).abs() < 1e-9);
        assert!((r_10 - 0.9).abs() < 1e-9);
        assert_eq!(retrievability(0.0, 3.0), 0.0);
    }

    #[test]
    fn test_due_policy_urgency() {
        let learned = schedule(&MemoryState::new_item(t0()), Rating::Good, t0());
        let later = t0() + Duration::days(2);

        let again = schedule(&learned, Rating::Again, later);
        assert_eq!(again.due_at, later + Duration::minutes(5));

        let hard = schedule(&learned, Rating::Hard, later);
        assert_eq!(hard.due_at, later + Duration::hours(12));

        let good = schedule(&learned, Rating::Good, later);
        assert!(good.due_at >= later + Duration::days(1));
    }

    #[test]
    fn test_interval_bounds() {
        let params = FsrsParams::default();
        assert_eq!(next_interval_days(0.1, &params), 1.0);
        assert_eq!(next_interval_days(10_000.0, &params), 365.0);
        assert_eq!(next_interval_days(f64::NAN, &params), 1.0);
        assert_eq!(next_interval_days(7.2, &params), 7.0);
    }

    #[test]
    fn test_corrupt_state_is_clamped() {
        let mut state = schedule(&MemoryState::new_item(t0()), Rating::Good, t0());
        assert!(state.is_in_domain());
        state.stability = f64::NAN;
        state.difficulty = f64::INFINITY;
        assert!(!state.is_in_domain());
        let next = schedule(&state, Rating::Good, t0() + Duration::days(1));
        assert!(next.stability.is_finite() && next.stability > 0.0);
        assert!((1.0..=10.0).contains(&next.difficulty));
        assert!(next.is_in_domain());

        state.stability = -4.0;
        let next = schedule(&state, Rating::Again, t0() + Duration::days(1));
        assert!(next.stability >= FsrsParams::default().min_stability);
    }

    #[test]
    fn test_lapse_below_floor_keeps_stability() {
        let mut state = schedule(&MemoryState::new_item(t0()), Rating::Good, t0());
        state.lifecycle_state = LifecycleState::Review;
        state.stability = 0.05;
        assert!(state.is_in_domain());

        let next = schedule(&state, Rating::Again, t0() + Duration::days(1));
        assert!(next.stability <= 0.05);
        assert!(next.stability > 0.0);
        assert_eq!(next.lifecycle_state, LifecycleState::Relearning);

        let recovered = schedule(&state, Rating::Good, t0() + Duration::days(1));
        assert!(recovered.stability >= FsrsParams::default().min_stability);
    }

    #[test]
    fn test_mastery() {
        let mut state = schedule(&MemoryState::new_item(t0()), Rating::Easy, t0());
        state.lifecycle_state = LifecycleState::Review;
        state.stability = 30.0;
        assert!(is_mastered(&state));

        state.stability = 10.0;
        assert!(!is_mastered(&state));

        state.stability = 30.0;
        state.lifecycle_state = LifecycleState::Relearning;
        assert!(!is_mastered(&state));
    }
}
