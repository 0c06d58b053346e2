use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;

/// Ordered property bag attached to events, people and groups.
pub type Properties = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClusterIndex(pub usize);

/// Cell of a cluster grid. `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GridPos {
    pub x: usize,
    pub y: usize,
}

impl GridPos {
    pub fn new(x: usize, y: usize) -> Self {
        GridPos { x, y }
    }

    /// Row-major scan index in a square grid with `side` cells per row.
    pub fn scan_index(self, side: usize) -> usize {
        self.y * side + self.x
    }

    pub fn from_scan_index(index: usize, side: usize) -> Self {
        GridPos { x: index % side, y: index / side }
    }
}

/// When a person will next be attended by its cluster.
///
/// `Never` sorts after every instant, so a dormant person is never the
/// earliest candidate while anyone else still has a session ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WakeBy {
    At(DateTime<Utc>),
    Never,
}

impl WakeBy {
    pub fn instant(self) -> Option<DateTime<Utc>> {
        match self {
            WakeBy::At(t) => Some(t),
            WakeBy::Never => None,
        }
    }
}

/// Truncate a timestamp to 00:00:00 UTC of the same day.
pub fn floor_to_midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Convert fractional seconds to a chrono duration at millisecond precision.
/// Negative and non-finite inputs collapse to zero.
pub fn seconds(s: f64) -> chrono::Duration {
    if !s.is_finite() || s <= 0.0 {
        return chrono::Duration::zero();
    }
    chrono::Duration::milliseconds((s * 1_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn never_sorts_after_every_instant() {
        let far = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        assert!(WakeBy::At(far) < WakeBy::Never);
        assert_eq!(WakeBy::Never.instant(), None);
    }

    #[test]
    fn floor_to_midnight_drops_time_of_day() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 17, 42, 9).unwrap();
        assert_eq!(floor_to_midnight(t), Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn scan_index_round_trips_through_grid() {
        let side = 5;
        for i in 0..side * side {
            assert_eq!(GridPos::from_scan_index(i, side).scan_index(side), i);
        }
        assert_eq!(GridPos::new(2, 1).scan_index(side), 7);
    }

    #[test]
    fn seconds_clamps_negative_and_nan() {
        assert_eq!(seconds(-3.0), chrono::Duration::zero());
        assert_eq!(seconds(f64::NAN), chrono::Duration::zero());
        assert_eq!(seconds(1.5), chrono::Duration::milliseconds(1_500));
    }
}
