//! Daily start/stop schedule evaluation.

use chrono::{DateTime, Datelike, FixedOffset, LocalResult, NaiveDate, TimeZone, Weekday};

/// Whether the time-of-day of `schedule`, taken in `now`'s zone, falls
/// strictly inside `(since, now)`.
///
/// The candidate is placed on `now`'s date; if that lands after `now` it is
/// moved to `since`'s date, which handles windows that cross midnight.
/// Local times skipped by a DST gap never match; ambiguous local times use
/// the earlier instant.
pub fn check_daily_schedule_match<Tz: TimeZone>(
    schedule: &DateTime<FixedOffset>,
    since: &DateTime<Tz>,
    now: &DateTime<Tz>,
) -> bool {
    let tz = now.timezone();
    let time_of_day = schedule.with_timezone(&tz).time();
    let since = since.with_timezone(&tz);

    let on_date = |date: NaiveDate| -> Option<DateTime<Tz>> {
        match tz.from_local_datetime(&date.and_time(time_of_day)) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => None,
        }
    };

    let mut candidate = on_date(now.date_naive());
    if candidate.as_ref().is_some_and(|c| c > now) {
        candidate = on_date(since.date_naive());
    }
    candidate.is_some_and(|c| c > since && &c < now)
}

/// Saturday or Sunday in `t`'s own zone.
pub fn is_weekend_day<Tz: TimeZone>(t: &DateTime<Tz>) -> bool {
    matches!(t.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn matches_inside_window() {
        let schedule = at("2020-01-01T17:00:00-05:00");
        let since = at("2024-03-12T16:45:00-05:00");
        let now = at("2024-03-12T17:05:00-05:00");
        assert!(check_daily_schedule_match(&schedule, &since, &now));
    }

    #[test]
    fn window_bounds_are_exclusive() {
        let schedule = at("2020-01-01T17:00:00-05:00");
        let since = at("2024-03-12T17:00:00-05:00");
        let now = at("2024-03-12T17:20:00-05:00");
        assert!(!check_daily_schedule_match(&schedule, &since, &now));

        let since = at("2024-03-12T16:40:00-05:00");
        let now = at("2024-03-12T17:00:00-05:00");
        assert!(!check_daily_schedule_match(&schedule, &since, &now));
    }

    #[test]
    fn handles_midnight_crossing() {
        let schedule = at("2020-06-01T23:55:00+00:00");
        let since = at("2024-03-12T23:50:00+00:00");
        let now = at("2024-03-13T00:10:00+00:00");
        assert!(check_daily_schedule_match(&schedule, &since, &now));

        let schedule = at("2020-06-01T00:05:00+00:00");
        assert!(check_daily_schedule_match(&schedule, &since, &now));

        let schedule = at("2020-06-01T12:00:00+00:00");
        assert!(!check_daily_schedule_match(&schedule, &since, &now));
    }

    #[test]
    fn schedule_is_localized_to_now_zone() {
        // 22:00 UTC is 17:00 in UTC-5.
        let schedule = at("2020-01-01T22:00:00+00:00");
        let since = at("2024-03-12T16:45:00-05:00");
        let now = at("2024-03-12T17:05:00-05:00");
        assert!(check_daily_schedule_match(&schedule, &since, &now));
    }

    #[test]
    fn time_of_day_is_wall_clock_across_dst() {
        use crate::testing::UsEastern2024;
        // Saved in January as 17:00 EST; fires at 17:00 EDT in July.
        let schedule = at("2024-01-01T17:00:00-05:00");
        let now = UsEastern2024.with_ymd_and_hms(2024, 7, 9, 17, 5, 0).unwrap();
        let since = now - Duration::minutes(20);
        assert!(check_daily_schedule_match(&schedule, &since, &now));

        let now = UsEastern2024.with_ymd_and_hms(2024, 7, 9, 18, 5, 0).unwrap();
        let since = now - Duration::minutes(20);
        assert!(!check_daily_schedule_match(&schedule, &since, &now));
    }

    #[test]
    fn weekend_uses_own_offset() {
        // Saturday 02:00 UTC is still Friday in UTC-5.
        let t = at("2024-03-16T02:00:00+00:00");
        assert!(is_weekend_day(&t));
        assert!(!is_weekend_day(&t.with_timezone(&FixedOffset::west_opt(5 * 3600).unwrap())));
    }

    proptest! {
        #[test]
        fn match_iff_some_same_time_of_day_instant_in_window(
            schedule_secs in 0i64..86_400,
            now_secs in 1_600_000_000i64..1_800_000_000,
            width in 1i64..86_399,
        ) {
            let now = Utc.timestamp_opt(now_secs, 0).unwrap();
            let since = now - Duration::seconds(width);
            let schedule = Utc.timestamp_opt(schedule_secs, 0).unwrap().fixed_offset();

            // First instant after `since` with the schedule's time of day.
            let since_tod = since.timestamp().rem_euclid(86_400);
            let delta = (schedule_secs - since_tod).rem_euclid(86_400);
            let expected = delta > 0 && since + Duration::seconds(delta) < now;

            prop_assert_eq!(check_daily_schedule_match(&schedule, &since, &now), expected);
        }
    }
}
