use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use std::sync::{PoisonError, RwLock};

/// Source of "now" for caches and the usage ledger.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: RwLock::new(start) }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Calendar-day arithmetic in one fixed UTC offset.
///
/// Every "today", "end of day" and "midnight tomorrow" in the crate goes through
/// here so that day boundaries never depend on string formatting or on the
/// process time zone changing under us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCalendar {
    offset: FixedOffset,
}

impl UsageCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Calendar pinned to the host's current local offset.
    pub fn local() -> Self {
        Self::new(Local::now().offset().fix())
    }

    /// Build from an offset in minutes east of UTC; out-of-range values fall back to UTC.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(Self::new)
            .unwrap_or_else(Self::utc)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Calendar date `instant` falls on.
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    pub fn is_same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.date_of(a) == self.date_of(b)
    }

    /// Instant at which `date` starts (00:00:00.000 local).
    pub fn start_of(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at(date, NaiveTime::MIN)
    }

    /// 23:59:59.999 local on the day `instant` falls on.
    pub fn end_of_day(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of_next_day(instant) - Duration::milliseconds(1)
    }

    /// Midnight at the start of the day after `instant`.
    pub fn start_of_next_day(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of(self.date_of(instant) + Duration::days(1))
    }

    /// `time` local on `date`, as a UTC instant.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = NaiveDateTime::new(date, time);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, Utc)
    }

    /// The `days` calendar dates ending with the day of `instant`, oldest first.
    pub fn trailing_dates(&self, instant: DateTime<Utc>, days: i64) -> Vec<NaiveDate> {
        let today = self.date_of(instant);
        (0..days)
            .rev()
            .map(|back| today - Duration::days(back))
            .collect()
    }
}

impl Default for UsageCalendar {
    fn default() -> Self {
        Self::local()
    }
}
