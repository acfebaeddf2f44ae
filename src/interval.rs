//! Time-range partitioning.
//!
//! Every partition covers a half-open UTC interval `[lo, hi)` in epoch
//! milliseconds. Directory names encode the interval start: `YYYY-MM-DD` for
//! daily partitions, `YYYY-MM` for monthly, `YYYY` for yearly, and the
//! literal `default` when the journal is not partitioned. Lag partitions
//! carry a `.lag` suffix on the timestamp-derived name.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Suffix appended to the directory name of a lag partition.
pub const LAG_SUFFIX: &str = ".lag";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    None,
    Day,
    Month,
    Year,
}

/// A half-open UTC time interval `[lo, hi)` in epoch milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    lo: i64,
    hi: i64,
}

impl Interval {
    /// The interval of the partition that owns `ts` under the given
    /// partition type.
    pub fn containing(ts: i64, partition_type: PartitionType) -> Result<Interval> {
        if partition_type == PartitionType::None {
            return Ok(Interval {
                lo: i64::MIN,
                hi: i64::MAX,
            });
        }

        let date = Utc
            .timestamp_millis_opt(ts)
            .single()
            .ok_or_else(|| Error::Config(format!("timestamp {ts} outside calendar range")))?
            .date_naive();

        let (lo, hi) = match partition_type {
            PartitionType::Day => {
                let next = date
                    .succ_opt()
                    .ok_or_else(|| Error::Config(format!("timestamp {ts} outside calendar range")))?;
                (date, next)
            }
            PartitionType::Month => {
                let lo = first_of_month(date.year(), date.month());
                let hi = if date.month() == 12 {
                    first_of_month(date.year() + 1, 1)
                } else {
                    first_of_month(date.year(), date.month() + 1)
                };
                (lo, hi)
            }
            PartitionType::Year => (
                first_of_month(date.year(), 1),
                first_of_month(date.year() + 1, 1),
            ),
            PartitionType::None => unreachable!(),
        };

        Ok(Interval {
            lo: midnight_millis(lo),
            hi: midnight_millis(hi),
        })
    }

    /// Parses a partition directory name back into its interval. Returns
    /// `None` for names that are not canonical for the partition type, which
    /// lets directory scans skip foreign entries.
    pub fn parse(name: &str, partition_type: PartitionType) -> Option<Interval> {
        if partition_type == PartitionType::None {
            return (name == "default").then(|| Interval {
                lo: i64::MIN,
                hi: i64::MAX,
            });
        }

        let lo = match partition_type {
            PartitionType::Day => NaiveDate::parse_from_str(name, "%Y-%m-%d").ok()?,
            PartitionType::Month => {
                let (y, m) = name.split_once('-')?;
                NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, 1)?
            }
            PartitionType::Year => NaiveDate::from_ymd_opt(name.parse().ok()?, 1, 1)?,
            PartitionType::None => unreachable!(),
        };

        let interval = Interval::containing(midnight_millis(lo), partition_type).ok()?;
        (interval.dir_name(partition_type) == name).then_some(interval)
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.lo && ts < self.hi
    }

    pub fn lo(&self) -> i64 {
        self.lo
    }

    pub fn hi(&self) -> i64 {
        self.hi
    }

    /// The partition directory name for this interval.
    pub fn dir_name(&self, partition_type: PartitionType) -> String {
        match partition_type {
            PartitionType::None => "default".to_string(),
            PartitionType::Day => format_start(self.lo, "%Y-%m-%d"),
            PartitionType::Month => format_start(self.lo, "%Y-%m"),
            PartitionType::Year => format_start(self.lo, "%Y"),
        }
    }

    /// The directory name of the lag partition derived from this interval.
    pub fn lag_dir_name(&self, partition_type: PartitionType) -> String {
        format!("{}{}", self.dir_name(partition_type), LAG_SUFFIX)
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    // Month is always produced by chrono, so 1..=12 holds.
    NaiveDate::from_ymd_opt(year, month, 1).unwrap()
}

fn midnight_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
}

fn format_start(millis: i64, fmt: &str) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_else(|| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAN_1_2015: i64 = 1420070400000;
    const MILLIS_PER_DAY: i64 = 86_400_000;

    #[test]
    fn test_day_interval() {
        let iv = Interval::containing(JAN_1_2015 + 3600_000, PartitionType::Day).unwrap();
        assert_eq!(iv.lo(), JAN_1_2015);
        assert_eq!(iv.hi(), JAN_1_2015 + MILLIS_PER_DAY);
        assert_eq!(iv.dir_name(PartitionType::Day), "2015-01-01");
        assert!(iv.contains(JAN_1_2015));
        assert!(!iv.contains(JAN_1_2015 + MILLIS_PER_DAY));
    }

    #[test]
    fn test_month_interval() {
        let iv = Interval::containing(JAN_1_2015 + 20 * MILLIS_PER_DAY, PartitionType::Month)
            .unwrap();
        assert_eq!(iv.dir_name(PartitionType::Month), "2015-01");
        assert_eq!(iv.hi() - iv.lo(), 31 * MILLIS_PER_DAY);
    }

    #[test]
    fn test_year_interval() {
        let iv = Interval::containing(JAN_1_2015, PartitionType::Year).unwrap();
        assert_eq!(iv.dir_name(PartitionType::Year), "2015");
        assert!(iv.contains(JAN_1_2015 + 300 * MILLIS_PER_DAY));
    }

    #[test]
    fn test_none_interval() {
        let iv = Interval::containing(0, PartitionType::None).unwrap();
        assert_eq!(iv.dir_name(PartitionType::None), "default");
        assert!(iv.contains(i64::MIN));
        assert!(iv.contains(JAN_1_2015));
    }

    #[test]
    fn test_parse_roundtrip() {
        for (name, pt) in [
            ("2015-01-01", PartitionType::Day),
            ("2015-01", PartitionType::Month),
            ("2015", PartitionType::Year),
            ("default", PartitionType::None),
        ] {
            let iv = Interval::parse(name, pt).expect(name);
            assert_eq!(iv.dir_name(pt), name);
        }
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(Interval::parse("lock.lock", PartitionType::Day).is_none());
        assert!(Interval::parse("2015-1-1", PartitionType::Day).is_none());
        assert!(Interval::parse("2015-01-01", PartitionType::Month).is_none());
        assert!(Interval::parse("garbage", PartitionType::Year).is_none());
    }

    #[test]
    fn test_lag_name() {
        let iv = Interval::containing(JAN_1_2015, PartitionType::Day).unwrap();
        assert_eq!(iv.lag_dir_name(PartitionType::Day), "2015-01-01.lag");
    }
}
