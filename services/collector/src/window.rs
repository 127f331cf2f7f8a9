//! Query window calculation.
//!
//! All arithmetic is done on whole minutes since the Unix epoch, which is
//! midnight-aligned in UTC. Every timestamp leaving this module is truncated
//! to the minute; the checkpoint store relies on that granularity.
//!
//! Buckets shorter than an hour are aligned to the top of the hour, so an
//! interval that does not divide 60 yields a short final bucket. Buckets of
//! an hour or more are aligned to midnight the same way.

use chrono::{DateTime, TimeDelta, Utc};

const MINUTES_PER_HOUR: i64 = 60;
const MINUTES_PER_DAY: i64 = 1440;

/// Half-open interval `[start, end)` covered by one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Exclusive end sent upstream: one minute before `end`, so the newest
    /// minute bucket, which the upstream may still be filling, is left for
    /// the next poll.
    pub fn query_end(&self) -> DateTime<Utc> {
        self.end - TimeDelta::minutes(1)
    }

    /// True when there is nothing left to ask the upstream for.
    pub fn is_empty(&self) -> bool {
        self.query_end() <= self.start
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Drop seconds and sub-seconds.
pub fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    from_minutes(to_minutes(t))
}

/// Most recent interval boundary at or before `t`.
pub fn aligned_boundary(t: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    let interval = i64::from(interval_minutes.max(1));
    let mins = to_minutes(t);
    let period = if interval < MINUTES_PER_HOUR {
        MINUTES_PER_HOUR
    } else {
        MINUTES_PER_DAY
    };
    let offset = mins.rem_euclid(period);
    from_minutes(mins - offset.rem_euclid(interval))
}

/// First interval boundary strictly after `t`.
pub fn next_boundary_after(t: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    let interval = i64::from(interval_minutes.max(1));
    let b = to_minutes(aligned_boundary(t, interval_minutes));
    let period = if interval < MINUTES_PER_HOUR {
        MINUTES_PER_HOUR
    } else {
        MINUTES_PER_DAY
    };
    let period_end = b - b.rem_euclid(period) + period;
    from_minutes((b + interval).min(period_end))
}

/// Instant at which the next tick should fire: `delay` minutes after the
/// next interval boundary, always strictly after `now`.
pub fn next_tick(now: DateTime<Utc>, interval_minutes: u32, delay_minutes: u32) -> DateTime<Utc> {
    let delay = TimeDelta::minutes(i64::from(delay_minutes));
    next_boundary_after(now - delay, interval_minutes) + delay
}

/// Compute the window to query on this poll.
///
/// 1. `boundary` = latest interval boundary at or before `now - skew`.
/// 2. `end = boundary`, `start = boundary - interval`.
/// 3. A checkpoint replaces `start`, so a slow cycle leaves no gap.
/// 4. With `sync_minutes > 0`, `start` is pulled back so the window spans
///    at least `sync_minutes`.
///
/// A checkpoint at or past `end` yields a one-minute window, which
/// [`TimeWindow::is_empty`] reports as nothing to fetch.
pub fn window(
    now: DateTime<Utc>,
    interval_minutes: u32,
    sync_minutes: u32,
    checkpoint: Option<DateTime<Utc>>,
    skew: TimeDelta,
) -> TimeWindow {
    let interval = TimeDelta::minutes(i64::from(interval_minutes.max(1)));
    let end = aligned_boundary(now - skew, interval_minutes);
    let mut start = match checkpoint {
        Some(cp) => truncate_to_minute(cp),
        None => end - interval,
    };

    if start >= end {
        start = end - TimeDelta::minutes(1);
    }

    if sync_minutes > 0 {
        let sync = TimeDelta::minutes(i64::from(sync_minutes));
        if end - start < sync {
            start = end - sync;
        }
    }

    TimeWindow { start, end }
}

fn to_minutes(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

fn from_minutes(mins: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(mins * 60, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
