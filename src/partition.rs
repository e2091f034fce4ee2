//! Date partitioning shared by every sink: time-zone conversion, storage key
//! layout, the admission rules applied to each incoming record, and the
//! per-month `day,count` index.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime};
use chrono_tz::Tz;

use crate::errors::ArchiveError;
use crate::model::{FeedRecord, Watermark};

/// Time zone partitions are cut in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Default for Zone {
    fn default() -> Self {
        Zone::Named(Tz::UTC)
    }
}

impl Zone {
    /// Fixed offset expressed in minutes east of UTC.
    pub fn from_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes * 60).map(Zone::Fixed)
    }

    pub fn localize(&self, t: &DateTime<FixedOffset>) -> NaiveDateTime {
        match self {
            Zone::Named(tz) => t.with_timezone(tz).naive_local(),
            Zone::Fixed(off) => t.with_timezone(off).naive_local(),
        }
    }
}

impl FromStr for Zone {
    type Err = String;

    /// Accepts an IANA name (`Asia/Tokyo`), an offset (`+09:00`) or a minute
    /// offset (`540min`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(tz) = s.parse::<Tz>() {
            return Ok(Zone::Named(tz));
        }
        if let Some(minutes) = s.strip_suffix("min") {
            return minutes
                .parse::<i32>()
                .ok()
                .and_then(Zone::from_minutes)
                .ok_or_else(|| format!("invalid minute offset: {s}"));
        }
        s.parse::<FixedOffset>()
            .map(Zone::Fixed)
            .map_err(|_| format!("unknown time zone: {s}"))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Named(tz) => write!(f, "{}", tz.name()),
            Zone::Fixed(off) => write!(f, "{off}"),
        }
    }
}

/// Zone-local calendar date identifying one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionDate {
    pub fn of(local: &NaiveDateTime) -> Self {
        PartitionDate {
            year: local.year(),
            month: local.month(),
            day: local.day(),
        }
    }

    /// `{base}/YYYY/MM/DD`
    pub fn key(&self, base: &str) -> String {
        format!("{}/{:04}/{:02}/{:02}", base, self.year, self.month, self.day)
    }

    /// `{base}/YYYY/MM/index`
    pub fn index_key(&self, base: &str) -> String {
        format!("{}/{:04}/{:02}/index", base, self.year, self.month)
    }

    pub fn same_month(&self, other: &PartitionDate) -> bool {
        self.year == other.year && self.month == other.month
    }
}

/// Why a record was not archived. None of these fail the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotPost,
    BadTimestamp(String),
    Watermark,
}

impl SkipReason {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NotPost => "not_post",
            SkipReason::BadTimestamp(_) => "bad_timestamp",
            SkipReason::Watermark => "watermark",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub date: PartitionDate,
    pub local: NaiveDateTime,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit(Admitted),
    Skip(SkipReason),
}

/// Decide whether `record` should be archived, and if so into which partition.
pub fn admit(record: &FeedRecord, zone: &Zone, watermark: Option<&Watermark>) -> Admission {
    if !record.is_post() {
        return Admission::Skip(SkipReason::NotPost);
    }
    let raw = record.created_at.as_deref().unwrap_or_default();
    let parsed = match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t,
        Err(e) => return Admission::Skip(SkipReason::BadTimestamp(e.to_string())),
    };
    let timestamp = parsed.timestamp();
    if let Some(mark) = watermark {
        if mark.covers(timestamp, &record.cid) {
            return Admission::Skip(SkipReason::Watermark);
        }
    }
    let local = zone.localize(&parsed);
    Admission::Admit(Admitted {
        date: PartitionDate::of(&local),
        local,
        timestamp,
    })
}

/// Per-month record counts keyed by day of month.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonthIndex {
    counts: BTreeMap<u32, u64>,
}

impl MonthIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `day,count` table stored at `key`.
    pub fn parse(key: &str, data: &[u8]) -> Result<Self, ArchiveError> {
        let malformed = |msg: String| ArchiveError::Index(key.to_string(), msg);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(data);

        let mut counts = BTreeMap::new();
        for row in reader.records() {
            let row = row.map_err(|e| malformed(e.to_string()))?;
            if row.is_empty() {
                break;
            }
            let day = row
                .get(0)
                .and_then(|d| d.trim().parse::<u32>().ok())
                .ok_or_else(|| malformed(format!("bad day field in {row:?}")))?;
            let count = row
                .get(1)
                .and_then(|c| c.trim().parse::<u64>().ok())
                .ok_or_else(|| malformed(format!("bad count field in {row:?}")))?;
            counts.insert(day, count);
        }
        Ok(MonthIndex { counts })
    }

    pub fn increment(&mut self, day: u32) {
        *self.counts.entry(day).or_insert(0) += 1;
    }

    pub fn count(&self, day: u32) -> u64 {
        self.counts.get(&day).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Header row, then one zero-padded row per day in ascending order.
    pub fn to_csv(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        let failed = |msg: String| ArchiveError::Index(key.to_string(), msg);
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["day", "count"])
            .map_err(|e| failed(e.to_string()))?;
        for (day, count) in &self.counts {
            writer
                .write_record([format!("{day:02}"), count.to_string()])
                .map_err(|e| failed(e.to_string()))?;
        }
        writer.into_inner().map_err(|e| failed(e.to_string()))
    }
}
