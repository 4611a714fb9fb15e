//! Daily send volume: limit growth and per-cycle quota.

use crate::model::WarmupConfig;

use chrono::{DateTime, Datelike as _, NaiveDate, Utc, Weekday};
use rand::Rng;

/// Today's sending plan for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyPlan {
    /// Daily limit after today's growth, if any.
    pub daily_limit: u32,
    /// Set when today's growth step was consumed; persisted as `last_limit_increase`.
    pub grown_on: Option<NaiveDate>,
    /// Messages to send in this cycle.
    pub quota: u32,
    pub sending_day: bool,
}

/// Limit for the next warmup day.
///
/// Grows by `daily_increase` up to `max_emails_per_day` while the warmup period
/// lasts, then stays frozen at its last value.
pub fn next_daily_limit(config: &WarmupConfig, days_elapsed: u32) -> u32 {
    let current = config.current_daily_limit.min(config.max_emails_per_day);
    if days_elapsed >= config.warmup_days {
        return current;
    }
    current
        .saturating_add(config.daily_increase)
        .min(config.max_emails_per_day)
}

pub fn is_sending_day(config: &WarmupConfig, now: DateTime<Utc>) -> bool {
    !(config.weekdays_only && matches!(now.weekday(), Weekday::Sat | Weekday::Sun))
}

/// Plan this cycle's sends.
///
/// Growth happens at most once per calendar day, never on day 0 and never on a
/// non-sending day. `sent_today` caps the quota so repeated cycles on one day
/// share a single daily limit.
pub fn plan_day<R: Rng>(
    config: &WarmupConfig,
    now: DateTime<Utc>,
    sent_today: u32,
    jitter_percent: u32,
    rng: &mut R,
) -> DailyPlan {
    let today = now.date_naive();
    let days_elapsed = config.days_elapsed(now);
    let sending_day = is_sending_day(config, now);

    let already_grown_today = config
        .last_limit_increase
        .is_some_and(|last| last >= today);
    let grows = sending_day
        && days_elapsed >= 1
        && days_elapsed < config.warmup_days
        && !already_grown_today;

    let daily_limit = if grows {
        next_daily_limit(config, days_elapsed)
    } else {
        config.current_daily_limit.min(config.max_emails_per_day)
    };

    let quota = if sending_day {
        let count = if config.randomize_volume {
            randomized_count(daily_limit, jitter_percent, rng)
        } else {
            daily_limit
        };
        count.min(daily_limit.saturating_sub(sent_today))
    } else {
        0
    };

    DailyPlan {
        daily_limit,
        grown_on: grows.then_some(today),
        quota,
        sending_day,
    }
}

/// Uniform draw from `[max(1, limit - band), limit]`.
pub fn randomized_count<R: Rng>(limit: u32, jitter_percent: u32, rng: &mut R) -> u32 {
    if limit == 0 {
        return 0;
    }
    let band = (f64::from(limit) * f64::from(jitter_percent) / 100.0).round() as u32;
    let low = limit.saturating_sub(band).max(1);
    rng.random_range(low..=limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;
    use proptest::prelude::*;
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    fn config(start: NaiveDate) -> WarmupConfig {
        WarmupConfig {
            start_date: start,
            max_emails_per_day: 10,
            daily_increase: 3,
            current_daily_limit: 2,
            warmup_days: 5,
            randomize_volume: false,
            ..WarmupConfig::default()
        }
    }

    // 2026-10-14 is a Wednesday.
    fn wednesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap()
    }

    #[test]
    fn day_zero_does_not_grow() {
        let now = wednesday();
        let plan = plan_day(&config(now.date_naive()), now, 0, 20, &mut StdRng::seed_from_u64(1));
        assert_eq!(plan.daily_limit, 2);
        assert_eq!(plan.grown_on, None);
        assert_eq!(plan.quota, 2);
    }

    #[test]
    fn growth_is_idempotent_within_a_day() {
        let now = wednesday();
        let mut config = config(now.date_naive() - chrono::Duration::days(2));
        let mut rng = StdRng::seed_from_u64(1);

        let first = plan_day(&config, now, 0, 20, &mut rng);
        assert_eq!(first.daily_limit, 5);
        assert_eq!(first.grown_on, Some(now.date_naive()));

        config.current_daily_limit = first.daily_limit;
        config.last_limit_increase = first.grown_on;

        let later = now + chrono::Duration::hours(6);
        let second = plan_day(&config, later, 5, 20, &mut rng);
        assert_eq!(second.daily_limit, 5);
        assert_eq!(second.grown_on, None);
        assert_eq!(second.quota, 0);
    }

    #[test]
    fn limit_caps_at_max() {
        let now = wednesday();
        let config = WarmupConfig {
            current_daily_limit: 9,
            ..config(now.date_naive() - chrono::Duration::days(1))
        };
        assert_eq!(next_daily_limit(&config, 1), 10);
    }

    #[test]
    fn weekend_quota_is_zero_when_weekdays_only() {
        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();
        let config = WarmupConfig {
            weekdays_only: true,
            ..config(saturday.date_naive() - chrono::Duration::days(2))
        };
        let plan = plan_day(&config, saturday, 0, 20, &mut StdRng::seed_from_u64(1));
        assert!(!plan.sending_day);
        assert_eq!(plan.quota, 0);
        assert_eq!(plan.grown_on, None);
        assert_eq!(plan.daily_limit, 2);
    }

    #[test]
    fn completed_warmup_freezes_limit() {
        let now = wednesday();
        let config = config(now.date_naive() - chrono::Duration::days(10));
        let plan = plan_day(&config, now, 0, 20, &mut StdRng::seed_from_u64(1));
        assert_eq!(plan.daily_limit, 2);
        assert_eq!(plan.grown_on, None);
    }

    #[test]
    fn randomized_count_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let count = randomized_count(20, 20, &mut rng);
            assert!((16..=20).contains(&count));
        }
        assert_eq!(randomized_count(0, 20, &mut rng), 0);
        assert_eq!(randomized_count(1, 100, &mut rng), 1);
    }

    #[test]
    fn quota_never_exceeds_remaining_daily_limit() {
        let now = wednesday();
        let config = WarmupConfig {
            randomize_volume: true,
            ..config(now.date_naive())
        };
        let plan = plan_day(&config, now, 1, 20, &mut StdRng::seed_from_u64(9));
        assert!(plan.quota <= 1);
    }

    proptest! {
        #[test]
        fn limit_is_monotonic_then_constant(
            max in 0u32..200,
            increase in 0u32..25,
            start_fraction in 0.0f64..=1.0,
            warmup_days in 1u32..60,
        ) {
            let mut config = WarmupConfig {
                max_emails_per_day: max,
                daily_increase: increase,
                current_daily_limit: (f64::from(max) * start_fraction) as u32,
                warmup_days,
                ..WarmupConfig::default()
            };

            let mut previous = config.current_daily_limit;
            let mut frozen_at = None;
            for day in 1..(warmup_days + 20) {
                let limit = next_daily_limit(&config, day);
                prop_assert!(limit >= previous);
                prop_assert!(limit <= max);
                if day >= warmup_days {
                    let frozen = *frozen_at.get_or_insert(limit);
                    prop_assert_eq!(limit, frozen);
                }
                config.current_daily_limit = limit;
                previous = limit;
            }
        }
    }
}
