//! Mutual-activity streak: consecutive calendar days on which at least two
//! different people posted in the room.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Days, NaiveDate, Utc};
use uuid::Uuid;

use crate::config::StreakConfig;

const MIN_DISTINCT_SENDERS: usize = 2;

/// Count the streak ending at the day containing `now`.
///
/// Days are cut at midnight in `config.day_offset`. Today is allowed to be
/// incomplete: if it does not qualify yet it is skipped instead of ending the
/// streak. Any earlier day without two distinct senders stops the walk.
pub fn streak<I>(history: I, now: DateTime<Utc>, config: &StreakConfig) -> u32
where
    I: IntoIterator<Item = (Uuid, DateTime<Utc>)>,
{
    let today = local_day(now, config);
    let Some(oldest) = today.checked_sub_days(Days::new(u64::from(config.lookback_days))) else {
        return 0;
    };

    let mut senders_by_day: BTreeMap<NaiveDate, BTreeSet<Uuid>> = BTreeMap::new();
    for (sender, created_at) in history {
        let day = local_day(created_at, config);
        if day < oldest || day > today {
            continue;
        }
        senders_by_day.entry(day).or_default().insert(sender);
    }

    streak_from_counts(
        |day| senders_by_day.get(&day).map_or(0, BTreeSet::len),
        today,
        oldest,
    )
}

fn local_day(at: DateTime<Utc>, config: &StreakConfig) -> NaiveDate {
    at.with_timezone(&config.day_offset).date_naive()
}

fn streak_from_counts<F>(distinct_senders: F, today: NaiveDate, oldest: NaiveDate) -> u32
where
    F: Fn(NaiveDate) -> usize,
{
    let mut streak = 0;
    let mut day = today;

    if distinct_senders(today) < MIN_DISTINCT_SENDERS {
        match day.pred_opt() {
            Some(yesterday) => day = yesterday,
            None => return 0,
        }
    }

    while day >= oldest && distinct_senders(day) >= MIN_DISTINCT_SENDERS {
        streak += 1;
        match day.pred_opt() {
            Some(previous) => day = previous,
            None => break,
        }
    }
    streak
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn noon(days_ago: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap() - Duration::days(days_ago)
    }

    fn now() -> DateTime<Utc> {
        noon(0) + Duration::hours(6)
    }

    /// Post `senders` distinct users on the day `days_ago`.
    fn day(history: &mut Vec<(Uuid, DateTime<Utc>)>, days_ago: i64, senders: &[Uuid]) {
        for (i, sender) in senders.iter().enumerate() {
            history.push((*sender, noon(days_ago) + Duration::minutes(i as i64)));
        }
    }

    #[test]
    fn skips_incomplete_today_and_stops_at_single_sender_day() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut history = Vec::new();
        day(&mut history, 0, &[a]);
        day(&mut history, 1, &[a, b]);
        day(&mut history, 2, &[b, a]);
        day(&mut history, 3, &[a]);
        day(&mut history, 4, &[a, b]);

        assert_eq!(streak(history, now(), &StreakConfig::default()), 2);
    }

    #[test]
    fn today_counts_when_it_qualifies() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut history = Vec::new();
        day(&mut history, 0, &[a, b]);
        day(&mut history, 1, &[a, b]);

        assert_eq!(streak(history, now(), &StreakConfig::default()), 2);
    }

    #[test]
    fn one_chatty_sender_breaks_the_streak() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut history = Vec::new();
        day(&mut history, 1, &[a, b]);
        day(&mut history, 2, &[a, a, a, a, a]);
        day(&mut history, 3, &[a, b]);

        assert_eq!(streak(history, now(), &StreakConfig::default()), 1);
    }

    #[test]
    fn empty_history_and_gap_yesterday() {
        assert_eq!(streak(Vec::new(), now(), &StreakConfig::default()), 0);

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut history = Vec::new();
        day(&mut history, 2, &[a, b]);
        assert_eq!(streak(history, now(), &StreakConfig::default()), 0);
    }

    #[test]
    fn lookback_bounds_the_walk() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut history = Vec::new();
        for days_ago in 1..=10 {
            day(&mut history, days_ago, &[a, b]);
        }
        let config = StreakConfig {
            lookback_days: 4,
            ..StreakConfig::default()
        };

        assert_eq!(streak(history, now(), &config), 4);
    }

    #[test]
    fn day_boundary_follows_configured_offset() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        // 23:30 UTC and 00:30 UTC the next day: two UTC days, one day at UTC-2.
        let late = Utc.with_ymd_and_hms(2026, 3, 18, 23, 30, 0).unwrap();
        let history = vec![(a, late), (b, late + Duration::hours(1))];
        let now = Utc.with_ymd_and_hms(2026, 3, 19, 12, 0, 0).unwrap();

        assert_eq!(streak(history.clone(), now, &StreakConfig::default()), 0);

        let minus_two = StreakConfig {
            day_offset: FixedOffset::west_opt(2 * 3600).unwrap(),
            ..StreakConfig::default()
        };
        assert_eq!(streak(history, now, &minus_two), 1);
    }
}
