//! Retention windows: the span of partitions a source can still yield.

use chrono::{Days, FixedOffset, NaiveDate, Utc};
use strata_state::{Domain, PartitionKey};

/// Today's date at a fixed UTC offset.
pub fn local_today(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

/// Contiguous, inclusive range of partition dates for one domain.
///
/// The window ends `lag_days` before "today" (a lag of 1 skips the day that
/// is still accumulating) and spans `width` days. A zero width is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionWindow {
    domain: Domain,
    end: NaiveDate,
    width: u32,
}

impl RetentionWindow {
    pub fn ending_at(domain: Domain, today: NaiveDate, width: u32, lag_days: u32) -> Self {
        let end = today
            .checked_sub_days(Days::new(u64::from(lag_days)))
            .unwrap_or(NaiveDate::MIN);
        Self { domain, end, width }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Oldest date in the window.
    pub fn floor(&self) -> NaiveDate {
        self.end
            .checked_sub_days(Days::new(u64::from(self.width.saturating_sub(1))))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Newest date in the window.
    pub fn ceiling(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.width > 0 && date >= self.floor() && date <= self.end
    }

    /// Window dates, oldest first.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        let count = if self.width == 0 { 0 } else { self.width as usize };
        self.floor().iter_days().take(count)
    }

    /// Window keys, oldest first.
    pub fn keys(&self) -> Vec<PartitionKey> {
        self.dates()
            .map(|d| PartitionKey::new(self.domain.clone(), d))
            .collect()
    }
}
