//! Week calendar and walk-forward split generation.
//!
//! Every week is identified by its Monday. For a week W:
//! - TRAIN: the `train_weeks` Mondays before W (used to calibrate and fit)
//! - DEV: W itself, replayed against the TRAIN fit to fill W's grid cube
//!
//! For a TEST week X, the selector aggregates the cubes of the `dev_weeks`
//! Mondays before X and reads τ from X's own cube. Nothing dated on or after
//! X influences X's manifest.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

use crate::config::ExperimentConfig;

/// FX weeks close Friday 17:00 New York time.
const WEEK_CLOSE_HOUR_NY: u32 = 17;

/// Monday of the week containing `date`.
pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// The `n` Mondays strictly before `monday`, oldest first.
pub fn previous_mondays(monday: NaiveDate, n: usize) -> Vec<NaiveDate> {
    (1..=n as i64).rev().map(|i| monday - Duration::weeks(i)).collect()
}

/// Monday of the most recently finished trading week.
///
/// A week is finished after Friday 17:00 New York time; Saturday and
/// Sunday always count as finished.
pub fn last_completed_monday(now_utc: DateTime<Utc>) -> NaiveDate {
    let now_ny = now_utc.with_timezone(&New_York);
    let finished = match now_ny.weekday() {
        Weekday::Sat | Weekday::Sun => true,
        Weekday::Fri => now_ny.hour() >= WEEK_CLOSE_HOUR_NY,
        _ => false,
    };

    let monday = monday_of(now_ny.date_naive());
    if finished {
        monday
    } else {
        monday - Duration::weeks(1)
    }
}

/// Week counts for split generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySplitsConfig {
    pub train_weeks: usize,
    pub dev_weeks: usize,
    pub test_weeks: usize,
}

impl Default for WeeklySplitsConfig {
    fn default() -> Self {
        Self {
            train_weeks: 10,
            dev_weeks: 4,
            test_weeks: 26,
        }
    }
}

impl From<&ExperimentConfig> for WeeklySplitsConfig {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            train_weeks: config.train_weeks,
            dev_weeks: config.dev_weeks,
            test_weeks: config.test_weeks,
        }
    }
}

/// Weeks involved in one TEST week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekSplit {
    /// Split number (1-indexed, oldest TEST week first).
    pub split_num: usize,
    pub test_week: NaiveDate,
    /// Cubes aggregated by the selector, oldest first.
    pub dev_weeks: Vec<NaiveDate>,
    /// TRAIN weeks of the TEST week's own grid, oldest first.
    pub train_weeks: Vec<NaiveDate>,
}

impl WeekSplit {
    /// Earliest Monday whose digest this split can touch: the TRAIN
    /// weeks of its oldest DEV cube.
    pub fn earliest_week(&self) -> NaiveDate {
        let first_grid = self.dev_weeks.first().copied().unwrap_or(self.test_week);
        first_grid - Duration::weeks(self.train_weeks.len() as i64)
    }

    /// Whether any involved week is on or after the TEST week.
    pub fn looks_ahead(&self) -> bool {
        self.dev_weeks
            .iter()
            .chain(self.train_weeks.iter())
            .any(|&w| w >= self.test_week)
    }
}

/// Generator for weekly walk-forward splits.
pub struct WeeklySplits {
    config: WeeklySplitsConfig,
    last_test_week: NaiveDate,
}

impl WeeklySplits {
    /// `last_test_week` is normalized to its Monday.
    pub fn new(config: WeeklySplitsConfig, last_test_week: NaiveDate) -> Self {
        Self {
            config,
            last_test_week: monday_of(last_test_week),
        }
    }

    /// TEST weeks, oldest first.
    pub fn test_weeks(&self) -> Vec<NaiveDate> {
        let mut weeks = previous_mondays(self.last_test_week, self.config.test_weeks.saturating_sub(1));
        if self.config.test_weeks > 0 {
            weeks.push(self.last_test_week);
        }
        weeks
    }

    /// Generate one split per TEST week, oldest first.
    pub fn generate(&self) -> Vec<WeekSplit> {
        self.test_weeks()
            .into_iter()
            .enumerate()
            .map(|(i, test_week)| WeekSplit {
                split_num: i + 1,
                test_week,
                dev_weeks: previous_mondays(test_week, self.config.dev_weeks),
                train_weeks: previous_mondays(test_week, self.config.train_weeks),
            })
            .collect()
    }

    /// Weeks that need a grid cube: every DEV and TEST week, oldest first.
    pub fn grid_weeks(&self) -> Vec<NaiveDate> {
        let tests = self.test_weeks();
        match tests.first() {
            Some(&first) => {
                let mut weeks = previous_mondays(first, self.config.dev_weeks);
                weeks.extend(tests);
                weeks
            }
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn utc(y: i32, m: u32, day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, h, 0, 0).unwrap()
    }

    #[test]
    fn test_monday_of() {
        assert_eq!(monday_of(d(2024, 3, 4)), d(2024, 3, 4));
        assert_eq!(monday_of(d(2024, 3, 8)), d(2024, 3, 4));
        assert_eq!(monday_of(d(2024, 3, 10)), d(2024, 3, 4));
    }

    #[test]
    fn test_previous_mondays_oldest_first() {
        assert_eq!(
            previous_mondays(d(2024, 3, 4), 3),
            vec![d(2024, 2, 12), d(2024, 2, 19), d(2024, 2, 26)]
        );
        assert!(previous_mondays(d(2024, 3, 4), 0).is_empty());
    }

    #[test]
    fn test_last_completed_monday_friday_close() {
        // 2024-03-08 is a Friday; New York is on EST (UTC-5) that day.
        assert_eq!(last_completed_monday(utc(2024, 3, 8, 21)), d(2024, 2, 26));
        assert_eq!(last_completed_monday(utc(2024, 3, 8, 22)), d(2024, 3, 4));
        assert_eq!(last_completed_monday(utc(2024, 3, 9, 12)), d(2024, 3, 4));
        // Monday 02:00 UTC is still Sunday evening in New York.
        assert_eq!(last_completed_monday(utc(2024, 3, 11, 2)), d(2024, 3, 4));
        assert_eq!(last_completed_monday(utc(2024, 3, 11, 14)), d(2024, 3, 4));
    }

    #[test]
    fn test_split_generation() {
        let config = WeeklySplitsConfig {
            train_weeks: 3,
            dev_weeks: 2,
            test_weeks: 2,
        };
        let splits = WeeklySplits::new(config, d(2024, 3, 6));
        let generated = splits.generate();

        assert_eq!(generated.len(), 2);
        assert_eq!(generated[0].split_num, 1);
        assert_eq!(generated[0].test_week, d(2024, 2, 26));
        assert_eq!(generated[1].test_week, d(2024, 3, 4));
        assert_eq!(generated[1].dev_weeks, vec![d(2024, 2, 19), d(2024, 2, 26)]);
        assert_eq!(generated[1].train_weeks.len(), 3);
        // DEV cube 2024-02-19 trains on the three weeks before it.
        assert_eq!(generated[1].earliest_week(), d(2024, 1, 29));
        assert_eq!(generated[0].earliest_week(), d(2024, 1, 22));
        assert!(generated.iter().all(|s| !s.looks_ahead()));

        let leaky = WeekSplit {
            dev_weeks: vec![d(2024, 2, 26), d(2024, 3, 4)],
            ..generated[1].clone()
        };
        assert!(leaky.looks_ahead());

        assert_eq!(
            splits.grid_weeks(),
            vec![d(2024, 2, 12), d(2024, 2, 19), d(2024, 2, 26), d(2024, 3, 4)]
        );
    }

    #[test]
    fn test_zero_test_weeks() {
        let config = WeeklySplitsConfig {
            test_weeks: 0,
            ..WeeklySplitsConfig::default()
        };
        let splits = WeeklySplits::new(config, d(2024, 3, 4));
        assert!(splits.generate().is_empty());
        assert!(splits.grid_weeks().is_empty());
    }
}
