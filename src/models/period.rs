use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProcessingError, Result};

/// A single year or an inclusive range of years, e.g. `"2017"` or `"2000-2010"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub start_year: i32,
    pub stop_year: i32,
}

impl Period {
    pub fn new(start_year: i32, stop_year: i32) -> Result<Self> {
        if stop_year < start_year {
            return Err(ProcessingError::config(format!(
                "period stop year {} precedes start year {}",
                stop_year, start_year
            )));
        }
        Ok(Self {
            start_year,
            stop_year,
        })
    }

    pub fn single(year: i32) -> Self {
        Self {
            start_year: year,
            stop_year: year,
        }
    }

    pub fn num_years(&self) -> u32 {
        (self.stop_year - self.start_year + 1) as u32
    }

    pub fn is_single_year(&self) -> bool {
        self.start_year == self.stop_year
    }

    pub fn contains(&self, time: NaiveDateTime) -> bool {
        self.contains_year(time.year())
    }

    pub fn contains_year(&self, year: i32) -> bool {
        (self.start_year..=self.stop_year).contains(&year)
    }

    pub fn years(&self) -> impl Iterator<Item = i32> {
        self.start_year..=self.stop_year
    }

    /// Consecutive sub-periods of `length` years. A trailing remainder shorter
    /// than `length` is merged into the last sub-period.
    pub fn split(&self, length: u32) -> Vec<Period> {
        let length = length.max(1) as i32;
        let mut parts = Vec::new();
        let mut start = self.start_year;
        while start <= self.stop_year {
            let stop = (start + length - 1).min(self.stop_year);
            parts.push(Period {
                start_year: start,
                stop_year: stop,
            });
            start = stop + 1;
        }
        if parts.len() > 1 {
            let last = parts[parts.len() - 1];
            if last.num_years() < length as u32 {
                parts.pop();
                if let Some(prev) = parts.last_mut() {
                    prev.stop_year = last.stop_year;
                }
            }
        }
        parts
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_year() {
            write!(f, "{}", self.start_year)
        } else {
            write!(f, "{}-{}", self.start_year, self.stop_year)
        }
    }
}

impl FromStr for Period {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self> {
        let parse_year = |part: &str| {
            part.trim().parse::<i32>().map_err(|_| {
                ProcessingError::config(format!("invalid year '{}' in period '{}'", part, s))
            })
        };

        match s.trim().split_once('-') {
            Some((start, stop)) => Period::new(parse_year(start)?, parse_year(stop)?),
            None => Ok(Period::single(parse_year(s)?)),
        }
    }
}
