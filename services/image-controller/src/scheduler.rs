//! Recurring prune scheduler.
//!
//! Fires a prune pass on a cron schedule. Firings call the lifecycle
//! controller directly and are awaited, so shutdown never interrupts a pass
//! that has already started.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::lifecycle::LifecycleController;

/// Errors from schedule parsing.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidExpression { expression: String, message: String },
}

/// Parse a cron expression.
///
/// Classic five-field crontab expressions get a leading seconds field of
/// `0` and their day-of-week field is renumbered (see
/// [`crontab_day_of_week`]); six- and seven-field expressions are used as-is.
pub fn parse_schedule(expression: &str) -> Result<Schedule, ScheduleError> {
    let invalid = |message: String| ScheduleError::InvalidExpression {
        expression: expression.to_string(),
        message,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day_of_month, month, day_of_week] => format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day_of_month,
            month,
            crontab_day_of_week(day_of_week).map_err(invalid)?
        ),
        _ => fields.join(" "),
    };

    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Renumber a crontab day-of-week field for the `cron` crate.
///
/// Crontab counts 0-7 with Sunday as both 0 and 7; the crate counts 1-7 with
/// Sunday as 1. Numeric items (values, ranges, steps) are expanded to an
/// explicit day list. Named days, `*` and `?` mean the same in both and pass
/// through.
pub fn crontab_day_of_week(field: &str) -> Result<String, String> {
    let mut passthrough: Vec<&str> = Vec::new();
    let mut days = BTreeSet::new();

    for item in field.split(',') {
        if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
            passthrough.push(item);
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in {item:?}"))?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let parse_day = |s: &str| {
            s.parse::<u8>()
                .ok()
                .filter(|d| *d <= 7)
                .ok_or_else(|| format!("invalid day of week {s:?} (expected 0-7)"))
        };

        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((start, end)) => (parse_day(start)?, parse_day(end)?),
            // `n/step` runs from n to the end of the week.
            None if step.is_some() => (parse_day(range)?, 6),
            None => {
                let day = parse_day(range)?;
                (day, day)
            }
        };

        if start > end {
            return Err(format!("day-of-week range {item:?} is reversed"));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(if day == 7 { 1 } else { day + 1 });
        }
    }

    let renumbered = days.iter().map(u8::to_string);
    Ok(passthrough
        .into_iter()
        .map(str::to_string)
        .chain(renumbered)
        .collect::<Vec<_>>()
        .join(","))
}

/// Runs prune passes on a cron schedule.
pub struct PruneScheduler {
    schedule: Schedule,
    threshold_days: u32,
    controller: Arc<LifecycleController>,
}

impl PruneScheduler {
    /// Create a scheduler from a cron expression.
    pub fn new(
        expression: &str,
        threshold_days: u32,
        controller: Arc<LifecycleController>,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            schedule: parse_schedule(expression)?,
            threshold_days,
            controller,
        })
    }

    /// Run until shutdown is signalled.
    ///
    /// A pass in progress when shutdown arrives runs to completion.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            schedule = %self.schedule,
            threshold_days = self.threshold_days,
            "Starting prune scheduler"
        );

        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!("Prune schedule has no upcoming firings, stopping scheduler");
                break;
            };

            let delay = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!(threshold_days = self.threshold_days, "Scheduled prune firing");
                    self.controller.prune(self.threshold_days).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Prune scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{FixedProbe, GIB};
    use crate::lifecycle::LifecycleSettings;
    use crate::runtime::MockGateway;
    use chrono::{Datelike, TimeZone, Weekday};
    use rstest::rstest;
    use std::time::Duration;

    fn controller(gateway: Arc<MockGateway>) -> Arc<LifecycleController> {
        Arc::new(LifecycleController::new(
            gateway,
            Arc::new(FixedProbe(100 * GIB)),
            LifecycleSettings::default(),
        ))
    }

    #[rstest]
    #[case("0 3 * * *")]
    #[case("*/15 * * * *")]
    #[case("0 0 3 * * *")]
    #[case("0 30 2 * * Sun *")]
    fn test_parse_valid_schedules(#[case] expression: &str) {
        assert!(parse_schedule(expression).is_ok(), "{expression}");
    }

    #[rstest]
    #[case("")]
    #[case("every day")]
    #[case("61 * * * *")]
    #[case("* * *")]
    fn test_parse_invalid_schedules(#[case] expression: &str) {
        assert!(parse_schedule(expression).is_err(), "{expression}");
    }

    #[rstest]
    #[case("1-5", "2,3,4,5,6")]
    #[case("0", "1")]
    #[case("7", "1")]
    #[case("0,7", "1")]
    #[case("5-7", "1,6,7")]
    #[case("*/2", "1,3,5,7")]
    #[case("1/3", "2,5")]
    #[case("*", "*")]
    #[case("MON-FRI", "MON-FRI")]
    #[case("SUN,3", "SUN,4")]
    fn test_crontab_day_of_week(#[case] field: &str, #[case] expected: &str) {
        assert_eq!(crontab_day_of_week(field).unwrap(), expected);
    }

    #[rstest]
    #[case("8")]
    #[case("5-2")]
    #[case("1-5/0")]
    #[case("x-y/")]
    fn test_crontab_day_of_week_rejects(#[case] field: &str) {
        assert!(crontab_day_of_week(field).is_err(), "{field}");
    }

    fn firing_weekdays(expression: &str) -> Vec<Weekday> {
        // Saturday
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        parse_schedule(expression)
            .unwrap()
            .after(&start)
            .take(5)
            .map(|t| t.weekday())
            .collect()
    }

    #[rstest]
    #[case(
        "0 3 * * 1-5",
        vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
    )]
    #[case("0 3 * * 0", vec![Weekday::Sun; 5])]
    #[case("0 3 * * 7", vec![Weekday::Sun; 5])]
    #[case(
        "0 3 * * 6,0",
        vec![Weekday::Sun, Weekday::Sat, Weekday::Sun, Weekday::Sat, Weekday::Sun]
    )]
    #[case("0 3 * * Mon", vec![Weekday::Mon; 5])]
    fn test_crontab_weekdays_fire_on_the_named_day(
        #[case] expression: &str,
        #[case] expected: Vec<Weekday>,
    ) {
        assert_eq!(firing_weekdays(expression), expected);
    }

    #[test]
    fn test_six_field_expressions_keep_crate_numbering() {
        // Day 2 is Monday in the crate's numbering.
        assert_eq!(firing_weekdays("0 0 3 * * 2"), vec![Weekday::Mon; 5]);
    }

    #[test]
    fn test_invalid_schedule_does_not_build_scheduler() {
        let gateway = Arc::new(MockGateway::new());
        assert!(PruneScheduler::new("nonsense", 14, controller(gateway)).is_err());
    }

    #[tokio::test]
    async fn test_scheduler_fires_prune() {
        let gateway = Arc::new(MockGateway::new());
        let scheduler = PruneScheduler::new("* * * * * *", 7, controller(gateway.clone())).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        for _ in 0..300 {
            if !gateway.calls_to("images").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!gateway.calls_to("images").is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let gateway = Arc::new(MockGateway::new());
        // Once a year; never fires during the test.
        let scheduler = PruneScheduler::new("0 0 0 1 1 *", 7, controller(gateway.clone())).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(gateway.calls().is_empty());
    }
}
