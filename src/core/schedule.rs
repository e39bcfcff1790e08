//! Schedule parsing and next occurrence calculation.
//!
//! Supports daily and weekly wall-clock triggers, fixed intervals, standard
//! five-field cron expressions (plus the `@daily`-style shortcuts), and
//! one-time triggers. All wall-clock math happens in a caller-supplied
//! timezone and results are returned in UTC.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid time of day (expected HH:MM).
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),

    /// Invalid weekday name.
    #[error("invalid day of week: {0}")]
    InvalidWeekday(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// Wall-clock time of day with minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    /// Create a time of day, validating the ranges.
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTime(format!("{:02}:{:02}", hour, minute)));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    fn naive(&self) -> NaiveTime {
        // Ranges are checked in `new`.
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTime(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Day of the week, serialized as a lowercase English name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayOfWeek(Weekday);

impl DayOfWeek {
    pub fn new(weekday: Weekday) -> Self {
        Self(weekday)
    }

    pub fn weekday(&self) -> Weekday {
        self.0
    }

    fn name(&self) -> &'static str {
        match self.0 {
            Weekday::Mon => "monday",
            Weekday::Tue => "tuesday",
            Weekday::Wed => "wednesday",
            Weekday::Thu => "thursday",
            Weekday::Fri => "friday",
            Weekday::Sat => "saturday",
            Weekday::Sun => "sunday",
        }
    }
}

impl FromStr for DayOfWeek {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let weekday = match s.trim().to_lowercase().as_str() {
            "monday" | "mon" => Weekday::Mon,
            "tuesday" | "tue" | "tues" => Weekday::Tue,
            "wednesday" | "wed" => Weekday::Wed,
            "thursday" | "thu" | "thurs" => Weekday::Thu,
            "friday" | "fri" => Weekday::Fri,
            "saturday" | "sat" => Weekday::Sat,
            "sunday" | "sun" => Weekday::Sun,
            _ => return Err(ScheduleError::InvalidWeekday(s.to_string())),
        };
        Ok(Self(weekday))
    }
}

impl TryFrom<String> for DayOfWeek {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DayOfWeek> for String {
    fn from(value: DayOfWeek) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Every day at a fixed wall-clock time.
    Daily { time: TimeOfDay },
    /// Every week on a given day at a fixed wall-clock time.
    Weekly { day: DayOfWeek, time: TimeOfDay },
    /// A fixed period measured from the previous run.
    Interval { seconds: u64 },
    /// A standard five-field cron expression or an `@`-shortcut.
    Cron { expression: String },
    /// Exactly one firing. `None` means as soon as possible.
    OneTime {
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

impl Schedule {
    /// Daily schedule from an `HH:MM` string.
    pub fn daily(time: &str) -> Result<Self, ScheduleError> {
        Ok(Schedule::Daily { time: time.parse()? })
    }

    /// Weekly schedule from a day name and an `HH:MM` string.
    pub fn weekly(day: &str, time: &str) -> Result<Self, ScheduleError> {
        Ok(Schedule::Weekly {
            day: day.parse()?,
            time: time.parse()?,
        })
    }

    /// Interval schedule. Zero-length intervals and intervals longer than
    /// [`MAX_INTERVAL_SECS`] are rejected.
    pub fn every(period: std::time::Duration) -> Result<Self, ScheduleError> {
        let seconds = period.as_secs();
        interval_period(seconds)?;
        Ok(Schedule::Interval { seconds })
    }

    /// Interval schedule from a compact expression like `1h30m` or `45s`.
    pub fn every_expr(expr: &str) -> Result<Self, ScheduleError> {
        Self::every(parse_duration(expr)?)
    }

    /// Cron schedule; the expression is validated eagerly.
    pub fn cron(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        CronExpr::parse(&expression)?;
        Ok(Schedule::Cron { expression })
    }

    /// One-time schedule.
    pub fn once(at: Option<DateTime<Utc>>) -> Self {
        Schedule::OneTime { at }
    }

    /// Check that the schedule can produce fire times.
    ///
    /// Deserialized schedules bypass the constructors, so this is called
    /// wherever a definition enters the job table.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Cron { expression } => CronExpr::parse(expression).map(|_| ()),
            Schedule::Interval { seconds } => interval_period(*seconds).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Whether the schedule fires more than once.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::OneTime { .. })
    }

    /// Short type tag, matching the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Daily { .. } => "daily",
            Schedule::Weekly { .. } => "weekly",
            Schedule::Interval { .. } => "interval",
            Schedule::Cron { .. } => "cron",
            Schedule::OneTime { .. } => "one_time",
        }
    }

    /// Compute the next fire time strictly after `now`.
    ///
    /// `last_run` anchors interval schedules and marks a one-time schedule
    /// as spent.
    pub fn next_after(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Schedule::Daily { time } => next_daily(now, *time, tz),
            Schedule::Weekly { day, time } => next_weekly(now, day.weekday(), *time, tz),
            Schedule::Interval { seconds } => {
                let period = interval_period(*seconds)?;
                last_run
                    .unwrap_or(now)
                    .checked_add_signed(period)
                    .ok_or_else(|| {
                        ScheduleError::InvalidInterval(format!(
                            "every {} overflows the calendar",
                            format_duration(*seconds)
                        ))
                    })
            }
            Schedule::Cron { expression } => CronExpr::parse(expression)?.next_after(now, tz),
            Schedule::OneTime { at } => {
                if last_run.is_some() {
                    return Err(ScheduleError::NoMoreOccurrences);
                }
                Ok(at.filter(|at| *at > now).unwrap_or(now))
            }
        }
    }

    /// First fire time for a freshly added job.
    ///
    /// With `interval_immediate`, interval jobs fire on the next tick instead
    /// of waiting one full period.
    pub fn first_run(
        &self,
        now: DateTime<Utc>,
        tz: Tz,
        interval_immediate: bool,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Schedule::Interval { .. } if interval_immediate => Ok(now),
            _ => self.next_after(now, None, tz),
        }
    }

    /// Get the next N occurrences after the given time.
    ///
    /// Interval occurrences are chained from `after`; one-time schedules yield
    /// at most one entry.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
        tz: Tz,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        let mut last_run = None;
        for _ in 0..n {
            let next = match self.next_after(current, last_run, tz) {
                Ok(next) => next,
                Err(ScheduleError::NoMoreOccurrences) => break,
                Err(e) => return Err(e),
            };
            results.push(next);
            current = next;
            last_run = Some(next);
        }
        Ok(results)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Daily { time } => write!(f, "daily at {}", time),
            Schedule::Weekly { day, time } => write!(f, "weekly on {} at {}", day, time),
            Schedule::Interval { seconds } => write!(f, "every {}", format_duration(*seconds)),
            Schedule::Cron { expression } => write!(f, "cron '{}'", expression),
            Schedule::OneTime { at: Some(at) } => {
                write!(f, "once at {}", at.format("%Y-%m-%d %H:%M:%S UTC"))
            }
            Schedule::OneTime { at: None } => write!(f, "once, as soon as possible"),
        }
    }
}

/// Longest accepted interval: ten years.
pub const MAX_INTERVAL_SECS: u64 = 10 * 366 * 86_400;

/// Period of an interval schedule, or an error outside `1..=MAX_INTERVAL_SECS`.
fn interval_period(seconds: u64) -> Result<ChronoDuration, ScheduleError> {
    if seconds == 0 {
        return Err(ScheduleError::InvalidInterval("interval must be positive".into()));
    }
    if seconds > MAX_INTERVAL_SECS {
        return Err(ScheduleError::InvalidInterval(format!(
            "{}s exceeds the {}s maximum",
            seconds, MAX_INTERVAL_SECS
        )));
    }
    i64::try_from(seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .ok_or_else(|| ScheduleError::InvalidInterval(format!("{}s", seconds)))
}

/// Parse a timezone name, defaulting to UTC for an empty string.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    if name.trim().is_empty() {
        return Ok(Tz::UTC);
    }
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s" or "2d".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<std::time::Duration, ScheduleError> {
    let trimmed = s.trim();
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        total_secs = trimmed
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(s.to_string()))?;
    } else {
        for c in trimmed.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else {
                let num: u64 = current_num
                    .parse()
                    .map_err(|_| ScheduleError::InvalidInterval(s.to_string()))?;
                current_num.clear();

                let unit: u64 = match c {
                    's' => 1,
                    'm' => 60,
                    'h' => 3600,
                    'd' => 86400,
                    _ => return Err(ScheduleError::InvalidInterval(s.to_string())),
                };
                total_secs = num
                    .checked_mul(unit)
                    .and_then(|secs| total_secs.checked_add(secs))
                    .ok_or_else(|| ScheduleError::InvalidInterval(s.to_string()))?;
            }
        }
        if !current_num.is_empty() {
            return Err(ScheduleError::InvalidInterval(s.to_string()));
        }
    }

    if total_secs == 0 {
        return Err(ScheduleError::InvalidInterval(s.to_string()));
    }

    Ok(std::time::Duration::from_secs(total_secs))
}

/// Render seconds in the same compact form `parse_duration` accepts.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    let mut rest = seconds;
    for (unit, size) in [('d', 86400), ('h', 3600), ('m', 60), ('s', 1)] {
        let n = rest / size;
        if n > 0 {
            out.push_str(&format!("{}{}", n, unit));
            rest %= size;
        }
    }
    out
}

/// Resolve a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// DST gap are pushed forward by an hour.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + ChronoDuration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
}

fn next_daily(now: DateTime<Utc>, time: TimeOfDay, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    let mut date = now.with_timezone(&tz).date_naive();
    // Today, tomorrow, and one spare day for DST edge cases.
    for _ in 0..3 {
        if let Some(candidate) = resolve_local(tz, date, time.naive()) {
            if candidate > now {
                return Ok(candidate);
            }
        }
        date = date.succ_opt().ok_or(ScheduleError::NoMoreOccurrences)?;
    }
    Err(ScheduleError::NoMoreOccurrences)
}

fn next_weekly(
    now: DateTime<Utc>,
    day: Weekday,
    time: TimeOfDay,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    let mut date = now.with_timezone(&tz).date_naive();
    // Eight days covers "today, but the time already passed".
    for _ in 0..=8 {
        if date.weekday() == day {
            if let Some(candidate) = resolve_local(tz, date, time.naive()) {
                if candidate > now {
                    return Ok(candidate);
                }
            }
        }
        date = date.succ_opt().ok_or(ScheduleError::NoMoreOccurrences)?;
    }
    Err(ScheduleError::NoMoreOccurrences)
}

/// A parsed five-field cron expression.
///
/// Uses standard (Vixie) cron semantics: day-of-week is 0-7 with both 0 and 7
/// meaning Sunday, and when day-of-month and day-of-week are both restricted a
/// day matches if either field matches.
#[derive(Debug, Clone)]
pub struct CronExpr {
    schedules: Vec<CronSchedule>,
}

impl CronExpr {
    /// Parse a five-field expression or one of the `@` shortcuts.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed);
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let dom_restricted = !dom.starts_with('*');
        let dow_restricted = !dow.starts_with('*');
        let dow = translate_day_of_week(dow)?;

        let exprs = if dom_restricted && dow_restricted {
            vec![
                format!("0 {} {} {} {} *", minute, hour, dom, month),
                format!("0 {} {} * {} {}", minute, hour, month, dow),
            ]
        } else {
            vec![format!("0 {} {} {} {} {}", minute, hour, dom, month, dow)]
        };

        let schedules = exprs
            .iter()
            .map(|e| {
                CronSchedule::from_str(e)
                    .map_err(|err| ScheduleError::InvalidCron(format!("{}: {}", expression, err)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { schedules })
    }

    /// Parse a shortcut expression (@daily, @hourly, etc.).
    fn parse_shortcut(expression: &str) -> Result<Self, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse("0 0 1 1 *"),
            "@monthly" => Self::parse("0 0 1 * *"),
            "@weekly" => Self::parse("0 0 * * 0"),
            "@daily" | "@midnight" => Self::parse("0 0 * * *"),
            "@hourly" => Self::parse("0 * * * *"),
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    /// Earliest matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&tz);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .map(|dt| dt.with_timezone(&Utc))
            .min()
            .ok_or(ScheduleError::NoMoreOccurrences)
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn day_number(token: &str, field: &str) -> Result<u32, ScheduleError> {
    let upper = token.to_uppercase();
    if let Some(idx) = DAY_NAMES.iter().position(|d| *d == upper) {
        return Ok(idx as u32);
    }
    match token.parse::<u32>() {
        Ok(n) if n <= 7 => Ok(n),
        _ => Err(ScheduleError::InvalidCron(format!(
            "invalid day-of-week '{}' in '{}'",
            token, field
        ))),
    }
}

/// Expand a standard day-of-week field into the name list the cron crate
/// understands. Numeric days use 0-7 (Sunday twice) here but 1-7 there, so
/// everything is normalized to names.
fn translate_day_of_week(field: &str) -> Result<String, ScheduleError> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    ScheduleError::InvalidCron(format!("invalid step in '{}'", field))
                })?;
                if step == 0 {
                    return Err(ScheduleError::InvalidCron(format!("zero step in '{}'", field)));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_number(a, field)?, day_number(b, field)?)
        } else {
            let n = day_number(range, field)?;
            // `5/2` means "from 5 to the end, every 2".
            if item.contains('/') { (n, 7) } else { (n, n) }
        };

        if start > end {
            return Err(ScheduleError::InvalidCron(format!(
                "descending day-of-week range in '{}'",
                field
            )));
        }

        let mut day = start;
        while day <= end {
            days.insert(day % 7);
            day += step;
        }
    }

    Ok(days
        .iter()
        .map(|d| DAY_NAMES[*d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_time_of_day_parsing() {
        let t: TimeOfDay = "02:00".parse().unwrap();
        assert_eq!((t.hour(), t.minute()), (2, 0));
        assert_eq!(t.to_string(), "02:00");

        let t: TimeOfDay = "9:05".parse().unwrap();
        assert_eq!(t.to_string(), "09:05");

        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
        assert!("12".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_day_of_week_parsing() {
        assert_eq!("Monday".parse::<DayOfWeek>().unwrap().weekday(), Weekday::Mon);
        assert_eq!("sun".parse::<DayOfWeek>().unwrap().weekday(), Weekday::Sun);
        assert!(matches!(
            "someday".parse::<DayOfWeek>(),
            Err(ScheduleError::InvalidWeekday(_))
        ));
    }

    #[test]
    fn test_daily_before_time_fires_same_day() {
        let schedule = Schedule::daily("02:00").unwrap();
        let next = schedule.next_after(at(2024, 6, 1, 1, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 1, 2, 0));
    }

    #[test]
    fn test_daily_after_time_wraps_to_next_day() {
        let schedule = Schedule::daily("02:00").unwrap();
        let next = schedule.next_after(at(2024, 6, 1, 2, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 2, 2, 0));

        let next = schedule.next_after(at(2024, 6, 30, 23, 59), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 7, 1, 2, 0));
    }

    #[test]
    fn test_daily_is_future_and_within_one_day() {
        let schedule = Schedule::daily("13:37").unwrap();
        let mut now = at(2024, 1, 1, 0, 0);
        for _ in 0..200 {
            let next = schedule.next_after(now, None, Tz::UTC).unwrap();
            assert!(next > now);
            assert!(next - now <= ChronoDuration::hours(24));
            now += ChronoDuration::minutes(97);
        }
    }

    #[test]
    fn test_weekly_is_future_and_within_one_week() {
        let schedule = Schedule::weekly("wednesday", "09:30").unwrap();
        let mut now = at(2024, 3, 1, 0, 0);
        for _ in 0..300 {
            let next = schedule.next_after(now, None, Tz::UTC).unwrap();
            assert!(next > now);
            assert!(next - now <= ChronoDuration::days(7));
            assert_eq!(next.weekday(), Weekday::Wed);
            assert_eq!((next.hour(), next.minute()), (9, 30));
            now += ChronoDuration::minutes(331);
        }
    }

    #[test]
    fn test_weekly_same_day_after_time_goes_to_next_week() {
        // 2024-06-03 is a Monday.
        let schedule = Schedule::weekly("monday", "08:00").unwrap();
        let next = schedule.next_after(at(2024, 6, 3, 9, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 10, 8, 0));

        let next = schedule.next_after(at(2024, 6, 3, 7, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 3, 8, 0));
    }

    #[test]
    fn test_interval_anchors_on_last_run() {
        let schedule = Schedule::every_expr("1h30m").unwrap();
        let now = at(2024, 1, 15, 12, 0);

        let first = schedule.next_after(now, None, Tz::UTC).unwrap();
        assert_eq!((first - now).num_minutes(), 90);

        let last = at(2024, 1, 15, 11, 0);
        let next = schedule.next_after(now, Some(last), Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 1, 15, 12, 30));
    }

    #[test]
    fn test_interval_first_run_immediate() {
        let schedule = Schedule::every_expr("10m").unwrap();
        let now = at(2024, 1, 15, 12, 0);
        assert_eq!(schedule.first_run(now, Tz::UTC, true).unwrap(), now);
        assert_eq!(
            schedule.first_run(now, Tz::UTC, false).unwrap(),
            at(2024, 1, 15, 12, 10)
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Schedule::every(std::time::Duration::ZERO).is_err());
        assert!(Schedule::Interval { seconds: 0 }.validate().is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let huge = std::time::Duration::from_secs(10_000_000_000_000_000);
        assert!(matches!(
            Schedule::every(huge),
            Err(ScheduleError::InvalidInterval(_))
        ));
        assert!(Schedule::every(std::time::Duration::from_secs(MAX_INTERVAL_SECS)).is_ok());

        // Deserialized values bypass `every`.
        let stored = Schedule::Interval { seconds: u64::MAX };
        assert!(stored.validate().is_err());
        assert!(matches!(
            stored.next_after(at(2024, 1, 1, 0, 0), None, Tz::UTC),
            Err(ScheduleError::InvalidInterval(_))
        ));
        assert!(parse_duration("99999999999999999999d").is_err());
        assert!(parse_duration("18446744073709551615d").is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
        assert_eq!(parse_duration("2d").unwrap().as_secs(), 172800);
        assert_eq!(parse_duration("900").unwrap().as_secs(), 900);
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("5m3").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5400), "1h30m");
        assert_eq!(format_duration(86401), "1d1s");
        assert_eq!(format_duration(45), "45s");
    }

    #[test]
    fn test_cron_specific_time() {
        let schedule = Schedule::cron("30 2 * * *").unwrap();
        let next = schedule.next_after(at(2024, 1, 15, 0, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 1, 15, 2, 30));
    }

    #[test]
    fn test_cron_weekday_numbering_matches_standard_cron() {
        // 1 is Monday in standard cron. 2024-06-01 is a Saturday.
        let schedule = Schedule::cron("0 9 * * 1").unwrap();
        let next = schedule.next_after(at(2024, 6, 1, 0, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 3, 9, 0));
        assert_eq!(next.weekday(), Weekday::Mon);

        // 0 and 7 are both Sunday.
        for expr in ["0 9 * * 0", "0 9 * * 7", "0 9 * * sun"] {
            let next = Schedule::cron(expr)
                .unwrap()
                .next_after(at(2024, 6, 1, 0, 0), None, Tz::UTC)
                .unwrap();
            assert_eq!(next, at(2024, 6, 2, 9, 0), "{}", expr);
        }
    }

    #[test]
    fn test_cron_weekday_range() {
        // Weekdays only; from Saturday the next match is Monday.
        let schedule = Schedule::cron("0 18 * * 1-5").unwrap();
        let next = schedule.next_after(at(2024, 6, 1, 19, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 3, 18, 0));
    }

    #[test]
    fn test_cron_day_of_month_or_day_of_week() {
        // Fires on the 15th OR on Mondays.
        let schedule = Schedule::cron("0 0 15 * 1").unwrap();

        // From Saturday June 1st: next Monday (June 3rd) comes before the 15th.
        let next = schedule.next_after(at(2024, 6, 1, 0, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 3, 0, 0));

        // From Tuesday June 11th: the 15th (Saturday) comes before Monday 17th.
        let next = schedule.next_after(at(2024, 6, 11, 0, 0), None, Tz::UTC).unwrap();
        assert_eq!(next, at(2024, 6, 15, 0, 0));
    }

    #[test]
    fn test_cron_shortcuts() {
        let base = at(2024, 1, 15, 12, 30);
        let hourly = Schedule::cron("@hourly").unwrap();
        assert_eq!(hourly.next_after(base, None, Tz::UTC).unwrap(), at(2024, 1, 15, 13, 0));

        let daily = Schedule::cron("@daily").unwrap();
        assert_eq!(daily.next_after(base, None, Tz::UTC).unwrap(), at(2024, 1, 16, 0, 0));

        // 2024-01-21 is a Sunday.
        let weekly = Schedule::cron("@weekly").unwrap();
        assert_eq!(weekly.next_after(base, None, Tz::UTC).unwrap(), at(2024, 1, 21, 0, 0));
    }

    #[test]
    fn test_invalid_cron_expression_returns_error() {
        for expr in ["invalid cron", "0 2 * *", "61 * * * *", "0 0 * * 9", "@sometimes"] {
            match Schedule::cron(expr) {
                Err(ScheduleError::InvalidCron(_)) => {}
                other => panic!("expected InvalidCron for '{}', got {:?}", expr, other),
            }
        }
    }

    #[test]
    fn test_deserialized_bad_cron_fails_validation() {
        let schedule: Schedule =
            serde_json::from_str(r#"{"type":"cron","expression":"not a cron"}"#).unwrap();
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_timezone_aware_daily() {
        let tz = parse_timezone("America/New_York").unwrap();
        let schedule = Schedule::daily("09:00").unwrap();

        // January: New York is UTC-5.
        let next = schedule.next_after(at(2024, 1, 15, 12, 0), None, tz).unwrap();
        assert_eq!(next, at(2024, 1, 15, 14, 0));
    }

    #[test]
    fn test_invalid_timezone_returns_error() {
        assert!(matches!(
            parse_timezone("Invalid/Timezone"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
        assert_eq!(parse_timezone("").unwrap(), Tz::UTC);
    }

    #[test]
    fn test_one_time_fires_once() {
        let now = at(2024, 6, 1, 1, 0);
        let later = at(2024, 6, 1, 5, 0);

        let schedule = Schedule::once(Some(later));
        assert_eq!(schedule.next_after(now, None, Tz::UTC).unwrap(), later);
        assert_eq!(
            schedule.next_after(now, Some(later), Tz::UTC),
            Err(ScheduleError::NoMoreOccurrences)
        );
        assert!(!schedule.is_recurring());
    }

    #[test]
    fn test_one_time_in_past_or_unset_fires_now() {
        let now = at(2024, 6, 1, 1, 0);
        let past = at(2024, 5, 1, 0, 0);
        assert_eq!(Schedule::once(Some(past)).next_after(now, None, Tz::UTC).unwrap(), now);
        assert_eq!(Schedule::once(None).next_after(now, None, Tz::UTC).unwrap(), now);
    }

    #[test]
    fn test_next_n_after_chains_occurrences() {
        let schedule = Schedule::every_expr("1h").unwrap();
        let base = at(2024, 1, 15, 12, 0);
        let occurrences = schedule.next_n_after(base, 5, Tz::UTC).unwrap();

        assert_eq!(occurrences.len(), 5);
        for (i, occurrence) in occurrences.iter().enumerate() {
            assert_eq!(*occurrence, base + ChronoDuration::hours((i + 1) as i64));
        }

        let once = Schedule::once(None).next_n_after(base, 3, Tz::UTC).unwrap();
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn test_schedule_serialization_shape() {
        let schedule = Schedule::weekly("friday", "18:45").unwrap();
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["type"], "weekly");
        assert_eq!(json["day"], "friday");
        assert_eq!(json["time"], "18:45");

        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn test_schedule_display() {
        assert_eq!(Schedule::daily("02:00").unwrap().to_string(), "daily at 02:00");
        assert_eq!(Schedule::every_expr("90m").unwrap().to_string(), "every 1h30m");
        assert_eq!(Schedule::once(None).to_string(), "once, as soon as possible");
    }
}
