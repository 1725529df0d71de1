// Working-hour deadline arithmetic.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc, Weekday};
use std::collections::HashSet;
use triage_shared::{SlaConfig, WorkingHours};

/// Answers "is this civil date a holiday in the configured calendar". The
/// source of the calendar (static list, table, external feed) is the
/// deployer's choice.
pub trait HolidayOracle: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// The default oracle: no holidays.
pub struct NoHolidays;

impl HolidayOracle for NoHolidays {
    fn is_holiday(&self, _date: NaiveDate) -> bool {
        false
    }
}

/// A fixed set of dates, typically loaded from configuration.
pub struct FixedHolidays {
    dates: HashSet<NaiveDate>,
}

impl FixedHolidays {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }
}

impl HolidayOracle for FixedHolidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }
}

/// Compute (response_deadline, resolution_deadline) for a ticket anchored at
/// `anchor` (its creation time).
///
/// With neither weekend nor holiday exclusion the deadlines are plain
/// offsets. Otherwise the budget is walked forward through each day's
/// working window in the configured local timezone.
pub fn compute_deadlines(
    anchor: DateTime<Utc>,
    config: &SlaConfig,
    offset: FixedOffset,
    holidays: &dyn HolidayOracle,
) -> (DateTime<Utc>, DateTime<Utc>) {
    if !config.exclude_weekends && !config.exclude_holidays {
        return (
            anchor + Duration::minutes(config.response_time_minutes as i64),
            anchor + Duration::minutes(config.resolution_time_minutes as i64),
        );
    }

    let mut hours = config.parse_working_hours();
    if hours.is_empty() {
        hours = WorkingHours::standard();
    }

    let response = add_working_minutes(
        anchor,
        config.response_time_minutes as i64,
        &hours,
        offset,
        config.exclude_weekends,
        config.exclude_holidays,
        holidays,
    );
    let resolution = add_working_minutes(
        anchor,
        config.resolution_time_minutes as i64,
        &hours,
        offset,
        config.exclude_weekends,
        config.exclude_holidays,
        holidays,
    );
    (response, resolution)
}

/// Walk forward consuming per-day working budgets until `minutes` are spent.
fn add_working_minutes(
    anchor: DateTime<Utc>,
    minutes: i64,
    hours: &WorkingHours,
    offset: FixedOffset,
    exclude_weekends: bool,
    exclude_holidays: bool,
    holidays: &dyn HolidayOracle,
) -> DateTime<Utc> {
    if minutes <= 0 {
        return anchor;
    }

    let mut cursor = anchor.with_timezone(&offset).naive_local();
    let mut remaining = minutes;

    // Ten years of calendar is far beyond any sane SLA; treat the cap as a
    // guard against configs with no working time at all.
    for _ in 0..3660 {
        let date = cursor.date();
        let weekday = date.weekday();

        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        let excluded = (exclude_weekends && weekend)
            || (exclude_holidays && holidays.is_holiday(date));

        if !excluded {
            if let Some((start, end)) = hours.window_for(weekday) {
                let window_start = date.and_time(start);
                let window_end = date.and_time(end);
                let effective_start = cursor.max(window_start);

                if effective_start < window_end {
                    let available = (window_end - effective_start).num_minutes();
                    if remaining <= available {
                        let local = effective_start + Duration::minutes(remaining);
                        return to_utc(local, offset, anchor + Duration::minutes(minutes));
                    }
                    remaining -= available;
                }
            }
        }

        // Budget for this day exhausted (or the day is out); jump to the
        // next day's start.
        cursor = match date.succ_opt() {
            Some(next) => next.and_hms_opt(0, 0, 0).unwrap_or(cursor),
            None => break,
        };
    }

    // No working time found within the guard window; degrade to the plain
    // offset rather than looping forever.
    anchor + Duration::minutes(minutes)
}

fn to_utc(
    local: chrono::NaiveDateTime,
    offset: FixedOffset,
    fallback: DateTime<Utc>,
) -> DateTime<Utc> {
    offset
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn config(response: i32, resolution: i32, exclude_weekends: bool) -> SlaConfig {
        SlaConfig {
            id: 1,
            name: "test".into(),
            is_active: true,
            is_default: true,
            ticket_type: None,
            priority: None,
            category_id: None,
            assigned_to: None,
            response_time_minutes: response,
            resolution_time_minutes: resolution,
            working_hours: json!({
                "mon": {"start": "09:00", "end": "18:00"},
                "tue": {"start": "09:00", "end": "18:00"},
                "wed": {"start": "09:00", "end": "18:00"},
                "thu": {"start": "09:00", "end": "18:00"},
                "fri": {"start": "09:00", "end": "18:00"}
            }),
            exclude_weekends,
            exclude_holidays: false,
            escalation_rules: json!([]),
            applied_count: 0,
            violation_count: 0,
            compliance_rate: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn plain_offsets_when_nothing_is_excluded() {
        // Saturday anchor still gets a plain offset
        let anchor = Utc.with_ymd_and_hms(2025, 3, 8, 10, 0, 0).unwrap();
        let (response, resolution) = compute_deadlines(anchor, &config(60, 240, false), utc(), &NoHolidays);
        assert_eq!(response, anchor + Duration::minutes(60));
        assert_eq!(resolution, anchor + Duration::minutes(240));
    }

    #[test]
    fn zero_duration_response_yields_anchor() {
        let anchor = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        let (response, _) = compute_deadlines(anchor, &config(0, 240, true), utc(), &NoHolidays);
        assert_eq!(response, anchor);
    }

    #[test]
    fn budget_consumed_within_one_working_day() {
        // Monday 10:00, 60 working minutes -> Monday 11:00
        let anchor = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        let (response, _) = compute_deadlines(anchor, &config(60, 240, true), utc(), &NoHolidays);
        assert_eq!(response, Utc.with_ymd_and_hms(2025, 3, 10, 11, 0, 0).unwrap());
    }

    #[test]
    fn weekend_is_skipped() {
        // Friday 17:30 + 60 working minutes: 30 min on Friday, 30 min on Monday.
        let anchor = Utc.with_ymd_and_hms(2025, 3, 14, 17, 30, 0).unwrap();
        let (response, _) = compute_deadlines(anchor, &config(60, 240, true), utc(), &NoHolidays);
        assert_eq!(response, Utc.with_ymd_and_hms(2025, 3, 17, 9, 30, 0).unwrap());
    }

    #[test]
    fn anchor_before_window_starts_at_window_open() {
        // Monday 06:00, 30 working minutes -> Monday 09:30
        let anchor = Utc.with_ymd_and_hms(2025, 3, 10, 6, 0, 0).unwrap();
        let (response, _) = compute_deadlines(anchor, &config(30, 240, true), utc(), &NoHolidays);
        assert_eq!(response, Utc.with_ymd_and_hms(2025, 3, 10, 9, 30, 0).unwrap());
    }

    #[test]
    fn holidays_are_consulted() {
        let mut cfg = config(60, 240, true);
        cfg.exclude_holidays = true;
        // Monday 2025-03-10 is a holiday: Friday 17:30 + 60 working minutes
        // spills past the weekend and the holiday into Tuesday 09:30.
        let oracle = FixedHolidays::new([NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()]);
        let anchor = Utc.with_ymd_and_hms(2025, 3, 7, 17, 30, 0).unwrap();
        let (response, _) = compute_deadlines(anchor, &cfg, utc(), &oracle);
        assert_eq!(response, Utc.with_ymd_and_hms(2025, 3, 11, 9, 30, 0).unwrap());
    }

    #[test]
    fn timezone_offset_shifts_windows() {
        // UTC+8 local: anchor 2025-03-10 00:00 UTC = 08:00 local Monday;
        // 60 working minutes start at 09:00 local = 01:00 UTC.
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let anchor = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let (response, _) = compute_deadlines(anchor, &config(60, 240, true), offset, &NoHolidays);
        assert_eq!(response, Utc.with_ymd_and_hms(2025, 3, 10, 2, 0, 0).unwrap());
    }

    #[test]
    fn resolution_budget_spans_days() {
        // Monday 16:00, 240 working minutes: 120 Monday, 120 Tuesday -> Tue 11:00.
        let anchor = Utc.with_ymd_and_hms(2025, 3, 10, 16, 0, 0).unwrap();
        let (_, resolution) = compute_deadlines(anchor, &config(60, 240, true), utc(), &NoHolidays);
        assert_eq!(resolution, Utc.with_ymd_and_hms(2025, 3, 11, 11, 0, 0).unwrap());
    }
}
