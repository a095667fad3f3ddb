use std::sync::OnceLock;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use crate::error::{ReporterError, Result};

const INSTANT_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

/// Length of the interval one ALB object covers; its name carries the interval end.
pub const OBJECT_INTERVAL_MINUTES: i64 = 5;

/// `s3://bucket/AWSLogs/{account}/elasticloadbalancing/{region}/` split into bucket and key path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoragePrefix {
    pub bucket: String,
    pub path: String,
}

impl StoragePrefix {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let rest = uri.strip_prefix("s3://").ok_or_else(|| ReporterError::config(format!("storage prefix must start with s3:// ({})", uri)))?;
        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() { return Err(ReporterError::config(format!("storage prefix has no bucket ({})", uri))); }
        if bucket.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase()) {
            return Err(ReporterError::config(format!("invalid bucket name: {}", bucket)));
        }
        if path.contains("//") { return Err(ReporterError::config(format!("storage prefix contains an empty path segment ({})", uri))); }
        Ok(Self { bucket: bucket.to_string(), path: path.trim_matches('/').to_string() })
    }

    /// Key prefix of one UTC-day partition, always ending in `/`.
    pub fn partition_prefix(&self, day: NaiveDate) -> String {
        let d = day.format("%Y/%m/%d/").to_string();
        if self.path.is_empty() { d } else { format!("{}/{}", self.path, d) }
    }

    /// File-system friendly name for the report directory.
    pub fn report_stem(&self) -> String {
        let mut s = self.bucket.clone();
        if !self.path.is_empty() { s.push('_'); s.push_str(&self.path.replace('/', "_")); }
        s
    }
}

impl std::fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.path)
    }
}

/// Closed interval `[start, end]` in UTC, remembering the report timezone it was given in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tz: Tz,
}

impl TimeWindow {
    pub fn parse(start: &str, end: Option<&str>, tz_name: &str) -> Result<Self> {
        let tz = parse_timezone(tz_name)?;
        let start = parse_instant(start, tz)?;
        let end = match end {
            Some(e) if !e.trim().is_empty() => parse_instant(e, tz)?,
            _ => Utc::now(),
        };
        Self::new(start, end, tz)
    }

    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, tz: Tz) -> Result<Self> {
        if start > end {
            return Err(ReporterError::config(format!("start {} is after end {}", start.with_timezone(&tz), end.with_timezone(&tz))));
        }
        Ok(Self { start, end, tz })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool { t >= self.start && t <= self.end }

    /// Latest object interval end that can still hold a record at `end`.
    pub fn object_horizon(&self) -> DateTime<Utc> {
        self.end.checked_add_signed(TimeDelta::minutes(OBJECT_INTERVAL_MINUTES)).unwrap_or(self.end)
    }

    /// UTC days whose partitions can hold objects for the window, oldest first.
    /// An end just before midnight reaches into the next day's first object.
    pub fn partitions(&self) -> Vec<NaiveDate> {
        let last = self.object_horizon().date_naive();
        let mut out = Vec::new();
        let mut day = self.start.date_naive();
        while day <= last {
            out.push(day);
            match day.succ_opt() { Some(d) => day = d, None => break }
        }
        out
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim().parse::<Tz>().map_err(|_| ReporterError::config(format!("invalid timezone: {}", name)))
}

/// Reads `YYYY-MM-DD HH:MM[:SS]` as a wall-clock time in `tz`. Repeated local
/// times resolve to the earlier offset; skipped ones are rejected.
pub fn parse_instant(s: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let s = s.trim();
    let naive = INSTANT_FORMATS.iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .ok_or_else(|| ReporterError::config(format!("invalid datetime '{}', expected YYYY-MM-DD HH:MM", s)))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ReporterError::config(format!("{} does not exist in timezone {}", s, tz)))
}

fn name_timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(\d{8}T\d{4})Z_").expect("static regex"))
}

/// Interval end embedded in an ALB object name, e.g.
/// `123456789012_elasticloadbalancing_us-east-1_app.web.50dc6c495c0c9188_20240301T0005Z_10.0.0.1_2soosksi.log.gz`.
pub fn name_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let cap = name_timestamp_re().captures(name)?;
    let naive = NaiveDateTime::parse_from_str(cap.get(1)?.as_str(), "%Y%m%dT%H%M").ok()?;
    Some(naive.and_utc())
}

/// A listed object that survived partition selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    pub key: String,
    pub partition: NaiveDate,
    pub interval_end: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl ObjectKey {
    pub fn new(key: String, partition: NaiveDate, size: Option<u64>) -> Self {
        let interval_end = name_timestamp(&key);
        Self { key, partition, interval_end, size }
    }

    /// True when the object's interval overlaps the window. The interval ends
    /// at the name timestamp, so objects up to one interval past `end` qualify.
    /// Objects without a parseable name timestamp stay in; their partition already bounds them.
    pub fn in_window(&self, w: &TimeWindow) -> bool {
        self.interval_end.map(|t| t >= w.start && t <= w.object_horizon()).unwrap_or(true)
    }

    pub fn file_name(&self) -> &str { self.key.rsplit('/').next().unwrap_or(&self.key) }
}
