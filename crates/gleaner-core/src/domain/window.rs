//! Half-open UTC time windows `[start, end)`.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Zero when `end <= start`.
    pub fn duration(&self) -> Duration {
        (self.end - self.start).max(Duration::zero())
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Inclusive on both ends. Used for the defensive filter on what a source returns.
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Keeps the window from reaching back before `origin`.
    pub fn clamp_start(self, origin: DateTime<Utc>) -> Self {
        Self {
            start: self.start.max(origin),
            end: self.end,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn inverted_window_is_empty_with_zero_duration() {
        let w = TimeWindow::new(day(8), day(1));
        assert!(w.is_empty());
        assert_eq!(w.duration(), Duration::zero());
    }

    #[test]
    fn covers_is_inclusive_on_both_ends() {
        let w = TimeWindow::new(day(1), day(8));
        assert!(w.covers(day(1)));
        assert!(w.covers(day(8)));
        assert!(!w.covers(day(9)));
    }

    #[test]
    fn clamp_start_never_moves_before_origin() {
        let w = TimeWindow::new(day(1), day(8)).clamp_start(day(3));
        assert_eq!(w.start, day(3));
        assert_eq!(w.duration(), Duration::days(5));
    }
}
