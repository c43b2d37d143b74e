//! Time-bucket policy: the reversible mapping between a Unix timestamp and a
//! shard name/id under four granularities.
//!
//! All calendar math is UTC. Week buckets use ISO-8601 week numbering, so a
//! week's year may differ from the calendar year around January 1st.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Shard granularity, as configured by `shard_time_spec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardTimeSpec {
    Year,
    Month,
    Week,
    Day,
}

impl ShardTimeSpec {
    /// Returns the human-readable bucket name and the locally unique id for
    /// the bucket containing `ts`.
    ///
    /// Formats and id formulas:
    /// - Year:  `"YYYY"`, id = year
    /// - Month: `"YYYY-MM"`, id = year*100 + month
    /// - Week:  `"YYYY-Www"` (ISO-8601), id = iso_year*100 + iso_week
    /// - Day:   `"YYYY-MM-DD"`, id = ts / 86400
    pub fn name_and_id(self, ts: u32) -> (String, u32) {
        let t = utc_time(ts);
        match self {
            ShardTimeSpec::Year => (format!("{:04}", t.year()), t.year() as u32),
            ShardTimeSpec::Month => (
                t.format("%Y-%m").to_string(),
                t.year() as u32 * 100 + t.month(),
            ),
            ShardTimeSpec::Week => {
                let iw = t.iso_week();
                (
                    format!("{:04}-W{:02}", iw.year(), iw.week()),
                    iw.year() as u32 * 100 + iw.week(),
                )
            }
            ShardTimeSpec::Day => (t.format("%Y-%m-%d").to_string(), ts / 86400),
        }
    }

    /// Inverts [`name_and_id`](Self::name_and_id): decodes a bucket name into
    /// its start timestamp and id.
    ///
    /// Accepts exactly the formats produced for the same granularity. A
    /// failure here means a misconfigured or foreign directory under the
    /// shards dir, not a runtime condition.
    pub fn parse_name(self, name: &str) -> Result<(u32, u32), StorageError> {
        let bad = |reason: &str| StorageError::ShardName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        match self {
            ShardTimeSpec::Year => {
                if name.len() != 4 {
                    return Err(bad("expected YYYY"));
                }
                let year: i32 = name.parse().map_err(|_| bad("expected YYYY"))?;
                let date = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(|| bad("bad year"))?;
                Ok((start_of(date), year as u32))
            }
            ShardTimeSpec::Month => {
                let (ys, ms) = name.split_once('-').ok_or_else(|| bad("expected YYYY-MM"))?;
                if ys.len() != 4 || ms.len() != 2 {
                    return Err(bad("expected YYYY-MM"));
                }
                let year: i32 = ys.parse().map_err(|_| bad("bad year"))?;
                let month: u32 = ms.parse().map_err(|_| bad("bad month"))?;
                let date =
                    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| bad("bad month"))?;
                Ok((start_of(date), year as u32 * 100 + month))
            }
            ShardTimeSpec::Week => {
                // "YYYY-Www"
                if name.len() != 8 || !name.is_ascii() || &name[4..6] != "-W" {
                    return Err(bad("expected YYYY-Www"));
                }
                let year: i32 = name[0..4].parse().map_err(|_| bad("bad year"))?;
                let week: u32 = name[6..8].parse().map_err(|_| bad("bad week"))?;
                let date = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
                    .ok_or_else(|| bad("bad ISO week"))?;
                Ok((start_of(date), year as u32 * 100 + week))
            }
            ShardTimeSpec::Day => {
                if name.len() != 10 {
                    return Err(bad("expected YYYY-MM-DD"));
                }
                let date = NaiveDate::parse_from_str(name, "%Y-%m-%d")
                    .map_err(|_| bad("expected YYYY-MM-DD"))?;
                let ts = start_of(date);
                Ok((ts, ts / 86400))
            }
        }
    }

    /// Ordered list of `(name, id)` for every bucket that could contain data
    /// in the half-open interval `[t_from, t_to)`.
    ///
    /// Walks with a stride no longer than the shortest bucket of the
    /// granularity (year 365 d, month 28 d, week 6 d, day 23 h), so the walk
    /// may revisit a bucket but never jumps over one; revisits are
    /// deduplicated against the previously emitted id. One extra sample at
    /// `t_to - 1` covers a trailing bucket shorter than the stride.
    pub fn ids_in_range(self, t_from: u32, t_to: u32) -> Vec<(String, u32)> {
        let stride: u32 = match self {
            ShardTimeSpec::Year => 3600 * 24 * 365,
            ShardTimeSpec::Month => 3600 * 24 * 28,
            ShardTimeSpec::Week => 3600 * 24 * 6,
            ShardTimeSpec::Day => 3600 * 23,
        };

        let mut list = Vec::new();
        let mut last_id = None;
        let mut t = t_from;
        while t < t_to {
            let (name, id) = self.name_and_id(t);
            if last_id != Some(id) {
                last_id = Some(id);
                list.push((name, id));
            }
            t = t.saturating_add(stride);
        }
        if t_to > t_from {
            let (name, id) = self.name_and_id(t_to - 1);
            if last_id != Some(id) {
                list.push((name, id));
            }
        }
        list
    }
}

fn utc_time(ts: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(ts), 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Midnight UTC of `date` as a Unix timestamp, clamped to the u32 range.
fn start_of(date: NaiveDate) -> u32 {
    let ts = date
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc()
        .timestamp();
    ts.clamp(0, i64::from(u32::MAX)) as u32
}
