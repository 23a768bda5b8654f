//! Cron cadences for root assets.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use cron::Schedule;
use tracing::warn;

/// A validated cron expression.
///
/// Accepts the classic 5-field form (`min hour dom month dow`) and the
/// 6/7-field form with seconds that the `cron` crate parses natively.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, cron::error::Error> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule = Schedule::from_str(&normalized)?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Ticks in `(last, now]` evaluated at `offset`, oldest first.
    ///
    /// Without a previous tick the search starts `catchup_window` before
    /// `now`. Only the newest `max_catchup` ticks are returned; older ones
    /// are dropped and logged.
    pub fn due_ticks(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        offset: FixedOffset,
        catchup_window: Duration,
        max_catchup: usize,
    ) -> Vec<DateTime<FixedOffset>> {
        let start = last.unwrap_or(now - catchup_window).with_timezone(&offset);
        let now_local = now.with_timezone(&offset);
        let mut due = VecDeque::with_capacity(max_catchup);
        let mut skipped = 0usize;
        for tick in self.schedule.after(&start).take_while(|t| *t <= now_local) {
            due.push_back(tick);
            if due.len() > max_catchup {
                due.pop_front();
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(
                cron = %self.expression,
                skipped,
                kept = due.len(),
                "catch-up capped, skipping older ticks"
            );
        }
        due.into()
    }

    /// First tick strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        self.schedule.after(&from.with_timezone(&offset)).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}
