//! Five-field cron expressions on top of the `cron` crate.
//!
//! Jobs and recurring tasks are written in classic `minute hour dom month dow`
//! form. The `cron` crate wants a leading seconds field and numbers weekdays
//! 1-7 starting at Sunday, so expressions are translated before parsing.
//! Times are evaluated as wall-clock values: the naive local time is handed to
//! the crate as if it were UTC, which keeps DST transitions from shifting
//! schedules.

use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

use crate::store::timestamp;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cron expression '{expr}' has {found} fields, expected 5 (minute hour day month weekday)")]
    FieldCount { expr: String, found: usize },
    #[error("invalid weekday '{0}' (use 0-7 or names)")]
    Weekday(String),
    #[error("invalid cron expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
    daily: bool,
}

fn map_weekday(token: &str) -> Result<String, ScheduleError> {
    match token.parse::<u8>() {
        Ok(0) | Ok(7) => Ok("1".to_string()),
        Ok(n @ 1..=6) => Ok((n + 1).to_string()),
        Ok(_) => Err(ScheduleError::Weekday(token.to_string())),
        // Names (MON, tue, ...) mean the same thing to both dialects.
        Err(_) => Ok(token.to_string()),
    }
}

fn translate_weekday_item(item: &str) -> Result<String, ScheduleError> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };

    let translated = match range.split_once('-') {
        _ if range == "*" || range == "?" => range.to_string(),
        Some((start, end)) => {
            let start_n = start.parse::<u8>().ok();
            let end_n = end.parse::<u8>().ok();
            match (start_n, end_n) {
                // 0-7 and friends cover the whole week.
                (Some(0), Some(6 | 7)) => "1-7".to_string(),
                // A range ending on Sunday-as-7 wraps in the 1-7 numbering.
                (Some(6), Some(7)) if step.is_none() => "7,1".to_string(),
                (Some(s @ 1..=5), Some(7)) if step.is_none() => format!("{}-7,1", s + 1),
                _ => format!("{}-{}", map_weekday(start)?, map_weekday(end)?),
            }
        }
        None => map_weekday(range)?,
    };

    Ok(match step {
        Some(step) => format!("{}/{}", translated, step),
        None => translated,
    })
}

fn translate_weekdays(field: &str) -> Result<String, ScheduleError> {
    let items: Result<Vec<String>, ScheduleError> =
        field.split(',').map(translate_weekday_item).collect();
    Ok(items?.join(","))
}

fn is_fixed(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_digit())
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount {
                expr: expr.to_string(),
                found: fields.len(),
            });
        }
        let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

        let native = format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            dom,
            month,
            translate_weekdays(dow)?
        );
        let schedule = Schedule::from_str(&native).map_err(|e| ScheduleError::Parse {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;

        let daily = is_fixed(minute) && is_fixed(hour) && dom == "*" && month == "*" && dow == "*";

        Ok(Self {
            expr: fields.join(" "),
            schedule,
            daily,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// True for the "fixed minute, fixed hour, every day" shape, the only
    /// shape that gets same-day catch-up after a missed firing.
    pub fn is_daily(&self) -> bool {
        self.daily
    }

    /// The latest firing time at or before `now`.
    pub fn latest_at_or_before(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let bound = timestamp::truncate(now) + Duration::seconds(1);
        self.schedule
            .after(&Utc.from_utc_datetime(&bound))
            .next_back()
            .map(|dt| dt.naive_utc())
    }

    /// The first firing time strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        self.schedule
            .after(&Utc.from_utc_datetime(&after))
            .next()
            .map(|dt| dt.naive_utc())
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(
            CronSchedule::parse("0 9 * *"),
            Err(ScheduleError::FieldCount { found: 4, .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 9 * * *"),
            Err(ScheduleError::FieldCount { found: 6, .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_weekday() {
        assert_eq!(
            CronSchedule::parse("0 9 * * 9").unwrap_err(),
            ScheduleError::Weekday("9".into())
        );
    }

    #[test]
    fn daily_shape_detection() {
        assert!(CronSchedule::parse("0 9 * * *").unwrap().is_daily());
        assert!(CronSchedule::parse("30 18 * * *").unwrap().is_daily());
        assert!(!CronSchedule::parse("*/5 9 * * *").unwrap().is_daily());
        assert!(!CronSchedule::parse("0 9 * * 1").unwrap().is_daily());
        assert!(!CronSchedule::parse("0 9 1 * *").unwrap().is_daily());
        assert!(!CronSchedule::parse("0 * * * *").unwrap().is_daily());
    }

    #[test]
    fn latest_firing_includes_now() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        assert_eq!(
            schedule.latest_at_or_before(at(2024, 3, 5, 9, 0)),
            Some(at(2024, 3, 5, 9, 0))
        );
        assert_eq!(
            schedule.latest_at_or_before(at(2024, 3, 5, 8, 59)),
            Some(at(2024, 3, 4, 9, 0))
        );
    }

    #[test]
    fn next_after_is_strict() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 5, 9, 0)),
            Some(at(2024, 3, 6, 9, 0))
        );
    }

    #[test]
    fn weekday_numbers_follow_posix() {
        // 2024-03-04 is a Monday.
        let monday = CronSchedule::parse("0 9 * * 1").unwrap();
        let next = monday.next_after(at(2024, 3, 5, 0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next, at(2024, 3, 11, 9, 0));

        for sunday in ["0 9 * * 0", "0 9 * * 7"] {
            let next = CronSchedule::parse(sunday)
                .unwrap()
                .next_after(at(2024, 3, 5, 0, 0))
                .unwrap();
            assert_eq!(next.weekday(), Weekday::Sun);
        }

        let weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        let friday = at(2024, 3, 8, 10, 0);
        assert_eq!(weekdays.next_after(friday), Some(at(2024, 3, 11, 9, 0)));
    }

    #[test]
    fn range_ending_on_seven_includes_sunday() {
        let weekend = CronSchedule::parse("0 9 * * 6-7").unwrap();
        let saturday = weekend.next_after(at(2024, 3, 5, 0, 0)).unwrap();
        assert_eq!(saturday.weekday(), Weekday::Sat);
        let sunday = weekend.next_after(saturday).unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);
    }
}
