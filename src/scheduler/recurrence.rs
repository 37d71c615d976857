use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use super::schedule::CronSchedule;

#[derive(Debug, Clone)]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Cron(CronSchedule),
}

impl Recurrence {
    /// Parses a task's recurrence descriptor. Unknown descriptors yield `None`.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let descriptor = descriptor.trim().to_lowercase();
        match descriptor.as_str() {
            "" => None,
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            expr => CronSchedule::parse(expr).ok().map(Self::Cron),
        }
    }

    /// The next due time after `base`.
    pub fn advance(&self, base: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Self::Daily => Some(base + Duration::days(1)),
            Self::Weekly => Some(base + Duration::days(7)),
            Self::Monthly => add_month_clamped(base),
            Self::Yearly => add_year_clamped(base),
            Self::Cron(schedule) => schedule.next_after(base),
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
}

/// Same day next month, clamped to the month's last day. Time of day is kept.
fn add_month_clamped(base: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if base.month() == 12 {
        (base.year() + 1, 1)
    } else {
        (base.year(), base.month() + 1)
    };
    let day = base.day().min(last_day_of_month(year, month)?);
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.and_time(base.time()))
}

/// Same date next year; Feb 29 falls back to Feb 28.
fn add_year_clamped(base: NaiveDateTime) -> Option<NaiveDateTime> {
    let year = base.year() + 1;
    let day = base.day().min(last_day_of_month(year, base.month())?);
    NaiveDate::from_ymd_opt(year, base.month(), day).map(|date| date.and_time(base.time()))
}

/// Due and remind times for the next instance of a recurring task.
///
/// The new due time is computed from the old one (or from `now` when the task
/// had none). When the old task had both a due and a remind time, their gap
/// is carried over; otherwise the next instance has no reminder.
pub fn next_instance(
    recurrence: &Recurrence,
    due: Option<NaiveDateTime>,
    remind: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
    let new_due = recurrence.advance(due.unwrap_or(now));
    let new_remind = match (new_due, due, remind) {
        (Some(new_due), Some(due), Some(remind)) => Some(new_due - (due - remind)),
        _ => None,
    };
    (new_due, new_remind)
}
