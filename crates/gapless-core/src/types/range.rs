//! 조회 시간 범위.

use crate::error::{CoreError, CoreResult};
use crate::types::Timeframe;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 반개구간 `[start, end)` 시간 범위.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// 시작 시각 (포함)
    pub start: DateTime<Utc>,
    /// 종료 시각 (미포함)
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// 새 범위를 생성합니다. `start >= end`이면 에러를 반환합니다.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CoreResult<Self> {
        if start >= end {
            return Err(CoreError::InvalidInput(format!(
                "시작 시각이 종료 시각보다 같거나 늦습니다: {} >= {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// epoch 밀리초로 범위를 생성합니다.
    pub fn from_millis(start_ms: i64, end_ms: i64) -> CoreResult<Self> {
        Self::new(millis_to_datetime(start_ms)?, millis_to_datetime(end_ms)?)
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    /// 밀리초 시각이 범위 안에 있는지 확인합니다.
    pub fn contains_ms(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms() && ts_ms < self.end_ms()
    }

    /// 범위 안의 캔들 시작 시각 수(정렬 기준).
    pub fn expected_candles(&self, timeframe: Timeframe) -> u64 {
        let first = timeframe.align_ceil(self.start_ms());
        let end = self.end_ms();
        if first >= end {
            return 0;
        }
        ((end - first - 1) / timeframe.interval_ms() + 1) as u64
    }

    /// 두 범위의 교집합.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// epoch 밀리초를 UTC 시각으로 변환합니다.
pub fn millis_to_datetime(ts_ms: i64) -> CoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .ok_or_else(|| CoreError::InvalidInput(format!("범위를 벗어난 타임스탬프: {}", ts_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_candles_half_open() {
        // 2024-01-01T00:00Z .. 2024-01-02T00:00Z
        let range = TimeRange::from_millis(1_704_067_200_000, 1_704_153_600_000).unwrap();
        assert_eq!(range.expected_candles(Timeframe::H1), 24);
        assert_eq!(range.expected_candles(Timeframe::D1), 1);
        assert!(range.contains_ms(1_704_067_200_000));
        assert!(!range.contains_ms(1_704_153_600_000));
    }

    #[test]
    fn test_unaligned_start_skips_partial_slot() {
        let range = TimeRange::from_millis(1_704_067_200_001, 1_704_074_400_000).unwrap();
        assert_eq!(range.expected_candles(Timeframe::H1), 1);
    }

    #[test]
    fn test_invalid_range() {
        assert!(TimeRange::from_millis(10, 10).is_err());
        assert!(TimeRange::from_millis(20, 10).is_err());
    }

    #[test]
    fn test_intersect() {
        let a = TimeRange::from_millis(0, 100).unwrap();
        let b = TimeRange::from_millis(50, 200).unwrap();
        assert_eq!(a.intersect(&b), Some(TimeRange::from_millis(50, 100).unwrap()));
        let c = TimeRange::from_millis(100, 200).unwrap();
        assert_eq!(a.intersect(&c), None);
    }
}
