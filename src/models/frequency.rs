use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProcessingError, Result};

/// Temporal resolution of a series, ordered from fine to coarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Monthly,
        Frequency::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }

    /// Start of the bucket of this frequency that contains `time`.
    ///
    /// Weeks start on Monday. A week that straddles two months belongs to the
    /// month of its Monday when aggregated further.
    pub fn bucket_start(&self, time: NaiveDateTime) -> NaiveDateTime {
        let date = time.date();
        match self {
            Frequency::Hourly => date.and_hms_opt(time.hour(), 0, 0).unwrap_or(time),
            Frequency::Daily => midnight(date),
            Frequency::Weekly => {
                let offset = date.weekday().num_days_from_monday() as i64;
                midnight(date - Duration::days(offset))
            }
            Frequency::Monthly => midnight(date.with_day(1).unwrap_or(date)),
            Frequency::Yearly => midnight(date.with_ordinal(1).unwrap_or(date)),
        }
    }

    /// Next frequency on the canonical aggregation chain towards `target`.
    ///
    /// hourly -> daily -> monthly -> yearly, with weekly only used when it is
    /// the target itself or the starting resolution.
    fn next_step_towards(&self, target: Frequency) -> Option<Frequency> {
        if *self >= target {
            return None;
        }
        let next = match self {
            Frequency::Hourly => Frequency::Daily,
            Frequency::Daily if target == Frequency::Weekly => Frequency::Weekly,
            Frequency::Daily => Frequency::Monthly,
            Frequency::Weekly => Frequency::Monthly,
            Frequency::Monthly => Frequency::Yearly,
            Frequency::Yearly => return None,
        };
        Some(next)
    }

    /// Sequence of `(from, to)` aggregation steps from `self` to `target`.
    pub fn resample_steps(&self, target: Frequency) -> Result<Vec<(Frequency, Frequency)>> {
        if target < *self {
            return Err(ProcessingError::config(format!(
                "cannot resample {} data to finer {} resolution",
                self, target
            )));
        }
        let mut steps = Vec::new();
        let mut current = *self;
        while let Some(next) = current.next_step_towards(target) {
            steps.push((current, next));
            current = next;
        }
        if current != target {
            return Err(ProcessingError::config(format!(
                "no aggregation path from {} to {}",
                self, target
            )));
        }
        Ok(steps)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hourly" | "hour" => Ok(Frequency::Hourly),
            "daily" | "day" => Ok(Frequency::Daily),
            "weekly" | "week" => Ok(Frequency::Weekly),
            "monthly" | "month" => Ok(Frequency::Monthly),
            "yearly" | "year" => Ok(Frequency::Yearly),
            other => Err(ProcessingError::config(format!(
                "unknown frequency '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 17, 0)
            .unwrap()
    }

    #[test]
    fn test_bucket_start() {
        let t = at(2021, 7, 15, 13); // Thursday
        assert_eq!(Frequency::Hourly.bucket_start(t), at(2021, 7, 15, 13) - Duration::minutes(17));
        assert_eq!(Frequency::Daily.bucket_start(t).to_string(), "2021-07-15 00:00:00");
        assert_eq!(Frequency::Weekly.bucket_start(t).to_string(), "2021-07-12 00:00:00");
        assert_eq!(Frequency::Monthly.bucket_start(t).to_string(), "2021-07-01 00:00:00");
        assert_eq!(Frequency::Yearly.bucket_start(t).to_string(), "2021-01-01 00:00:00");
    }

    #[test]
    fn test_ordering_is_fine_to_coarse() {
        assert!(Frequency::Hourly < Frequency::Daily);
        assert!(Frequency::Daily < Frequency::Weekly);
        assert!(Frequency::Weekly < Frequency::Monthly);
        assert!(Frequency::Monthly < Frequency::Yearly);
    }

    #[test]
    fn test_resample_steps() {
        assert_eq!(
            Frequency::Hourly.resample_steps(Frequency::Yearly).unwrap(),
            vec![
                (Frequency::Hourly, Frequency::Daily),
                (Frequency::Daily, Frequency::Monthly),
                (Frequency::Monthly, Frequency::Yearly),
            ]
        );
        assert_eq!(
            Frequency::Daily.resample_steps(Frequency::Weekly).unwrap(),
            vec![(Frequency::Daily, Frequency::Weekly)]
        );
        assert_eq!(
            Frequency::Weekly.resample_steps(Frequency::Monthly).unwrap(),
            vec![(Frequency::Weekly, Frequency::Monthly)]
        );
        assert!(Frequency::Monthly.resample_steps(Frequency::Monthly).unwrap().is_empty());
        assert!(Frequency::Monthly.resample_steps(Frequency::Daily).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("Monthly".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert_eq!("day".parse::<Frequency>().unwrap(), Frequency::Daily);
        assert!("3hourly".parse::<Frequency>().is_err());
    }
}
