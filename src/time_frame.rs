//! Time frame resolution
//!
//! Turns a symbolic keyword, explicit bounds, a range or a single
//! instant into a concrete `[from, to]` interval at a chosen
//! granularity, and produces the ordered sequence of bucket instants
//! covering it. All times are UTC.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::granularity::{self, GranularityRequest};
use crate::types::Context;

use chrono::format::{parse, Parsed, StrftimeItems};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc, Weekday};

/// Symbolic time spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKeyword {
    /// One hour ago until now
    Hour,
    /// One day ago until now
    Day,
    /// One week ago until now
    Week,
    /// One calendar month ago until now
    Month,
    /// One calendar year ago until now
    Year,
    /// Start of today until now
    Today,
    /// Yesterday's full calendar day
    Yesterday,
    /// Start of this ISO week until now
    ThisWeek,
    /// Last ISO week, Monday through Sunday
    LastWeek,
    /// Start of this month until now
    ThisMonth,
    /// Last full calendar month
    LastMonth,
    /// Start of this year until now
    ThisYear,
    /// Last full calendar year
    LastYear,
    /// One default-granularity step ago until now
    Default,
}

impl std::str::FromStr for TimeKeyword {
    type Err = std::convert::Infallible;

    // Unrecognized keywords resolve to the default span rather than
    // erroring, matching the catalog's silent-fallback behavior
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "hour" => TimeKeyword::Hour,
            "day" => TimeKeyword::Day,
            "week" => TimeKeyword::Week,
            "month" => TimeKeyword::Month,
            "year" => TimeKeyword::Year,
            "today" => TimeKeyword::Today,
            "yesterday" => TimeKeyword::Yesterday,
            "this_week" => TimeKeyword::ThisWeek,
            "last_week" => TimeKeyword::LastWeek,
            "this_month" => TimeKeyword::ThisMonth,
            "last_month" => TimeKeyword::LastMonth,
            "this_year" => TimeKeyword::ThisYear,
            "last_year" => TimeKeyword::LastYear,
            _ => TimeKeyword::Default,
        })
    }
}

/// A time specification, resolved to a concrete frame per context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSpec {
    /// A symbolic span
    Keyword(TimeKeyword),
    /// Explicit bounds; a missing `from` defaults to one
    /// default-granularity step ago, a missing `to` to now
    Bounds {
        /// Lower bound, inclusive
        from: Option<DateTime<Utc>>,
        /// Upper bound, inclusive
        to: Option<DateTime<Utc>>,
    },
    /// An inclusive range between two instants
    Range(DateTime<Utc>, DateTime<Utc>),
    /// A single instant, expanded to its full calendar day
    At(DateTime<Utc>),
}

impl TimeSpec {
    /// A symbolic keyword span
    pub fn keyword(word: &str) -> Self {
        // FromStr is infallible, unknown words fall back to Default
        TimeSpec::Keyword(word.parse().unwrap_or(TimeKeyword::Default))
    }

    /// Explicit bounds from timestamp strings.
    ///
    /// Accepts RFC 3339 or `YYYY-MM-DD[ HH:MM:SS]`; a malformed bound is
    /// a caller error and never swallowed.
    pub fn bounds_from_str(from: Option<&str>, to: Option<&str>) -> Result<Self> {
        let from = from.map(parse_timestamp).transpose()?;
        let to = to.map(parse_timestamp).transpose()?;
        Ok(TimeSpec::Bounds { from, to })
    }
}

impl From<DateTime<Utc>> for TimeSpec {
    fn from(t: DateTime<Utc>) -> Self {
        TimeSpec::At(t)
    }
}

/// Parse a timestamp string in one of the supported formats
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(Error::TimeSpec(format!("unparseable timestamp '{}'", s)))
}

/// A resolved time frame at one granularity
#[derive(Debug, Clone)]
pub struct TimeFrame {
    /// Lower bound, inclusive
    pub from: DateTime<Utc>,
    /// Upper bound, inclusive
    pub to: DateTime<Utc>,
    /// Resolved granularity name
    pub granularity: String,
    step: u64,
    pattern: String,
}

impl TimeFrame {
    /// Resolve a time spec against the current time.
    pub fn new(
        config: &Config,
        context: Context,
        spec: &TimeSpec,
        granularity: &GranularityRequest,
    ) -> Result<Self> {
        Self::resolve_at(config, context, spec, granularity, Utc::now())
    }

    /// Resolve a time spec against an explicit "now" instant.
    pub fn resolve_at(
        config: &Config,
        context: Context,
        spec: &TimeSpec,
        granularity: &GranularityRequest,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let (from, to) = match spec {
            TimeSpec::Keyword(word) => resolve_keyword(config, context, *word, now),
            TimeSpec::Bounds { from, to } => (
                from.unwrap_or_else(|| default_from(config, context, now)),
                to.unwrap_or(now),
            ),
            TimeSpec::Range(a, b) => (*a, *b),
            TimeSpec::At(t) => (beginning_of_day(*t), end_of_day(*t)),
        };
        if from > to {
            return Err(Error::TimeSpec(format!(
                "frame start {} is after end {}",
                from, to
            )));
        }

        let name = granularity::validate(config, context, granularity)
            .into_iter()
            .next()
            .expect("granularity validation never yields an empty list");
        let def = config
            .granularity(&name)
            .expect("validated granularity exists in the catalog");

        Ok(TimeFrame {
            from,
            to,
            granularity: name.clone(),
            step: def.step,
            pattern: def.pattern.clone(),
        })
    }

    /// The bucket step in seconds
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The granularity's strftime label pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Ordered bucket instants `from, from+step, …, ≤ to`.
    ///
    /// Finite and recomputed on every call; never memoized.
    pub fn steps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let step = self.step as i64;
        let from = self.from.timestamp();
        let to = self.to.timestamp();
        (0..)
            .map(move |i| from + i * step)
            .take_while(move |t| *t <= to)
            .filter_map(|t| Utc.timestamp_opt(t, 0).single())
    }

    /// Format an instant into this frame's time label
    pub fn label(&self, instant: DateTime<Utc>) -> String {
        instant.format(&self.pattern).to_string()
    }
}

/// Resolve a keyword to `(from, to)`
fn resolve_keyword(
    config: &Config,
    context: Context,
    word: TimeKeyword,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match word {
        TimeKeyword::Hour => (now - Duration::hours(1), now),
        TimeKeyword::Day => (now - Duration::days(1), now),
        TimeKeyword::Week => (now - Duration::weeks(1), now),
        TimeKeyword::Month => (months_ago(now, 1), now),
        TimeKeyword::Year => (months_ago(now, 12), now),
        TimeKeyword::Today => (beginning_of_day(now), now),
        TimeKeyword::Yesterday => {
            let y = now - Duration::days(1);
            (beginning_of_day(y), end_of_day(y))
        }
        TimeKeyword::ThisWeek => (beginning_of_week(now), now),
        TimeKeyword::LastWeek => {
            let w = now - Duration::weeks(1);
            (beginning_of_week(w), end_of_day(beginning_of_week(w) + Duration::days(6)))
        }
        TimeKeyword::ThisMonth => (beginning_of_month(now), now),
        TimeKeyword::LastMonth => {
            let m = months_ago(now, 1);
            let start = beginning_of_month(m);
            let end = end_of_day(beginning_of_month(now) - Duration::days(1));
            (start, end)
        }
        TimeKeyword::ThisYear => (beginning_of_year(now), now),
        TimeKeyword::LastYear => {
            let start = beginning_of_year(months_ago(now, 12));
            let end = end_of_day(beginning_of_year(now) - Duration::days(1));
            (start, end)
        }
        TimeKeyword::Default => (default_from(config, context, now), now),
    }
}

/// One default-granularity step before `now`
fn default_from(config: &Config, context: Context, now: DateTime<Utc>) -> DateTime<Utc> {
    let name = granularity::default(config, context)
        .into_iter()
        .next()
        .expect("context default is never empty");
    let step = config
        .granularity(&name)
        .map(|g| g.step)
        .unwrap_or(crate::config::DAY);
    now - Duration::seconds(step as i64)
}

fn months_ago(t: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    t.checked_sub_months(Months::new(months)).unwrap_or(t)
}

fn beginning_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

fn end_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &t.date_naive().and_hms_opt(23, 59, 59).expect("23:59:59 is valid"),
    )
}

fn beginning_of_week(t: DateTime<Utc>) -> DateTime<Utc> {
    let days = t.weekday().num_days_from_monday() as i64;
    beginning_of_day(t - Duration::days(days))
}

fn beginning_of_month(t: DateTime<Utc>) -> DateTime<Utc> {
    beginning_of_day(t.with_day(1).unwrap_or(t))
}

fn beginning_of_year(t: DateTime<Utc>) -> DateTime<Utc> {
    beginning_of_month(t.with_month(1).unwrap_or(t))
}

/// Re-parse a key time label into the instant it represents.
///
/// Patterns cover only part of a calendar datetime ("%Y%m" has no day);
/// missing fields are filled with calendar defaults, and ISO-week labels
/// resolve to the Monday of that week.
pub fn parse_label(pattern: &str, label: &str) -> Option<DateTime<Utc>> {
    let mut parsed = Parsed::new();
    parse(&mut parsed, label, StrftimeItems::new(pattern)).ok()?;

    if parsed.year().is_none() && parsed.isoyear().is_some() {
        if parsed.weekday().is_none() {
            parsed.set_weekday(Weekday::Mon).ok()?;
        }
    } else {
        if parsed.month().is_none() {
            parsed.set_month(1).ok()?;
        }
        if parsed.day().is_none() {
            parsed.set_day(1).ok()?;
        }
    }
    if parsed.hour_div_12().is_none() {
        parsed.set_hour(0).ok()?;
    }
    if parsed.minute().is_none() {
        parsed.set_minute(0).ok()?;
    }
    if parsed.second().is_none() {
        parsed.set_second(0).ok()?;
    }

    let naive = parsed.to_naive_date().ok()?.and_time(parsed.to_naive_time().ok()?);
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 30, 0).unwrap()
    }

    fn frame(spec: &TimeSpec) -> TimeFrame {
        let config = Config::default();
        TimeFrame::resolve_at(
            &config,
            Context::Tracker,
            spec,
            &GranularityRequest::Default,
            noon(),
        )
        .unwrap()
    }

    #[test]
    fn test_keyword_today() {
        let f = frame(&TimeSpec::keyword("today"));
        assert_eq!(f.from, Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap());
        assert_eq!(f.to, noon());
    }

    #[test]
    fn test_keyword_yesterday() {
        let f = frame(&TimeSpec::keyword("yesterday"));
        assert_eq!(f.from, Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap());
        assert_eq!(f.to, Utc.with_ymd_and_hms(2024, 5, 14, 23, 59, 59).unwrap());
    }

    #[test]
    fn test_keyword_last_week_is_monday_to_sunday() {
        // 2024-05-15 is a Wednesday; last week is Mon 6th .. Sun 12th
        let f = frame(&TimeSpec::keyword("last_week"));
        assert_eq!(f.from, Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap());
        assert_eq!(f.to, Utc.with_ymd_and_hms(2024, 5, 12, 23, 59, 59).unwrap());
    }

    #[test]
    fn test_keyword_last_month() {
        let f = frame(&TimeSpec::keyword("last_month"));
        assert_eq!(f.from, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(f.to, Utc.with_ymd_and_hms(2024, 4, 30, 23, 59, 59).unwrap());
    }

    #[test]
    fn test_unknown_keyword_uses_default_step() {
        // Default tracker granularity span starts at daily
        let f = frame(&TimeSpec::keyword("fortnight"));
        assert_eq!(f.to, noon());
        assert_eq!(f.from, noon() - Duration::days(1));
    }

    #[test]
    fn test_instant_expands_to_full_day() {
        let f = frame(&TimeSpec::At(noon()));
        assert_eq!(f.from, Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap());
        assert_eq!(f.to, Utc.with_ymd_and_hms(2024, 5, 15, 23, 59, 59).unwrap());
    }

    #[test]
    fn test_bounds_defaults() {
        let f = frame(&TimeSpec::Bounds { from: None, to: None });
        assert_eq!(f.to, noon());
        assert_eq!(f.from, noon() - Duration::days(1));
    }

    #[test]
    fn test_reversed_bounds_error() {
        let config = Config::default();
        let spec = TimeSpec::Range(noon(), noon() - Duration::days(2));
        let err = TimeFrame::resolve_at(
            &config,
            Context::Tracker,
            &spec,
            &GranularityRequest::Default,
            noon(),
        );
        assert!(matches!(err, Err(Error::TimeSpec(_))));
    }

    #[test]
    fn test_steps_inclusive() {
        let config = Config::default();
        let spec = TimeSpec::Range(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 4, 0, 0, 0).unwrap(),
        );
        let f = TimeFrame::resolve_at(
            &config,
            Context::Tracker,
            &spec,
            &GranularityRequest::one("daily"),
            noon(),
        )
        .unwrap();
        let steps: Vec<_> = f.steps().collect();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0], f.from);
        assert_eq!(steps[3], f.to);
        // Restartable: a second call yields the same sequence
        assert_eq!(f.steps().count(), 4);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_timestamp("2024-05-15T12:00:00Z").is_ok());
        assert!(parse_timestamp("2024-05-15 12:00:00").is_ok());
        assert!(parse_timestamp("2024-05-15").is_ok());
        assert!(parse_timestamp("not a time").is_err());
    }

    #[test]
    fn test_label_roundtrip_daily() {
        let t = Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_label("%Y%m%d", "20240515"), Some(t));
    }

    #[test]
    fn test_label_roundtrip_monthly_and_yearly() {
        assert_eq!(
            parse_label("%Y%m", "202405"),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_label("%Y", "2024"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_label_roundtrip_weekly() {
        // ISO week 2024-W20 starts Monday 2024-05-13
        assert_eq!(
            parse_label("%GW%V", "2024W20"),
            Some(Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_label_garbage() {
        assert_eq!(parse_label("%Y%m%d", "banana"), None);
    }
}
