//! 갭 감지.
//!
//! 저장된 시각 목록과 타임프레임의 고정 간격으로 기대되는 시각 목록을 비교하여
//! 누락 구간을 찾습니다. 순수 함수이므로 언제든 다시 계산해도 안전합니다.

use chrono::{DateTime, Duration, Utc};
use gapless_core::{millis_to_datetime, FetchConfig, Gap, GapKind, TimeRange, Timeframe};
use tracing::debug;

/// 갭 감지기.
#[derive(Debug, Clone)]
pub struct GapDetector {
    archive_lag: Duration,
}

impl GapDetector {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            archive_lag: config.archive_lag(),
        }
    }

    pub fn archive_lag(&self) -> Duration {
        self.archive_lag
    }

    /// 범위 안에서 기대되는 첫 캔들과 마지막 캔들 시각 (둘 다 포함).
    ///
    /// 시작은 올림, 끝은 내림 정렬하며 아직 닫히지 않은 캔들은 제외합니다.
    /// 기대되는 캔들이 없으면 `None`.
    pub fn expected_slots(
        timeframe: Timeframe,
        range: &TimeRange,
        now: DateTime<Utc>,
    ) -> Option<(i64, i64)> {
        let interval = timeframe.interval_ms();
        let first = timeframe.align_ceil(range.start_ms());
        let last_in_range = timeframe.align_ceil(range.end_ms()) - interval;
        let last_closed = timeframe.align_floor(now.timestamp_millis() - interval);
        let last = last_in_range.min(last_closed);
        (first <= last).then_some((first, last))
    }

    /// 저장된 시각 목록에서 갭을 찾습니다.
    ///
    /// `existing`은 정렬되어 있지 않아도 되며, 범위 밖이거나 경계에 맞지 않는 시각과
    /// 중복은 무시됩니다.
    pub fn detect(
        &self,
        timeframe: Timeframe,
        existing: &[i64],
        range: &TimeRange,
        now: DateTime<Utc>,
    ) -> Vec<Gap> {
        let Some((first, last)) = Self::expected_slots(timeframe, range, now) else {
            return Vec::new();
        };
        let interval = timeframe.interval_ms();

        let mut stored: Vec<i64> = existing
            .iter()
            .copied()
            .filter(|ts| *ts >= first && *ts <= last && timeframe.is_aligned(*ts))
            .collect();
        stored.sort_unstable();
        stored.dedup();

        let mut gaps = Vec::new();
        let mut push = |from: i64, to: i64, kind: GapKind| {
            if let (Ok(start), Ok(end)) = (millis_to_datetime(from), millis_to_datetime(to)) {
                if let Some(gap) = Gap::between(start, end, timeframe, kind) {
                    gaps.push(gap);
                }
            }
        };

        match (stored.first(), stored.last()) {
            (Some(&head), Some(&tail)) => {
                if head > first {
                    push(first, head - interval, GapKind::Leading);
                }
                for pair in stored.windows(2) {
                    if pair[1] - pair[0] > interval {
                        push(pair[0] + interval, pair[1] - interval, GapKind::Interior);
                    }
                }
                if tail < last {
                    push(tail + interval, last, GapKind::Trailing);
                }
            }
            _ => push(first, last, GapKind::Full),
        }

        if !gaps.is_empty() {
            let missing: u64 = gaps.iter().map(|g| g.missing_count).sum();
            debug!(
                timeframe = %timeframe,
                gaps = gaps.len(),
                missing = missing,
                "갭 감지"
            );
        }
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T0: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
    const HOUR: i64 = 3_600_000;

    fn detector() -> GapDetector {
        GapDetector::new(&FetchConfig::default())
    }

    fn day() -> TimeRange {
        TimeRange::from_millis(T0, T0 + 24 * HOUR).unwrap()
    }

    fn later() -> DateTime<Utc> {
        "2024-06-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_empty_storage_is_one_full_gap() {
        let gaps = detector().detect(Timeframe::H1, &[], &day(), later());
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::Full);
        assert_eq!(gaps[0].missing_count, 24);
        assert_eq!(gaps[0].range_start.timestamp_millis(), T0);
        assert_eq!(gaps[0].range_end.timestamp_millis(), T0 + 23 * HOUR);
    }

    #[test]
    fn test_complete_series_has_no_gaps() {
        let all: Vec<i64> = (0..24).map(|i| T0 + i * HOUR).collect();
        assert!(detector().detect(Timeframe::H1, &all, &day(), later()).is_empty());
    }

    #[test]
    fn test_leading_interior_trailing() {
        let stored = vec![T0 + 2 * HOUR, T0 + 3 * HOUR, T0 + 7 * HOUR, T0 + 20 * HOUR];
        let gaps = detector().detect(Timeframe::H1, &stored, &day(), later());

        let summary: Vec<(GapKind, i64, u64)> = gaps
            .iter()
            .map(|g| (g.kind, g.range_start.timestamp_millis(), g.missing_count))
            .collect();
        assert_eq!(
            summary,
            vec![
                (GapKind::Leading, T0, 2),
                (GapKind::Interior, T0 + 4 * HOUR, 3),
                (GapKind::Interior, T0 + 8 * HOUR, 12),
                (GapKind::Trailing, T0 + 21 * HOUR, 3),
            ]
        );
    }

    #[test]
    fn test_ignores_duplicates_and_out_of_range() {
        let stored = vec![
            T0 - HOUR,
            T0,
            T0,
            T0 + HOUR + 17, // 경계 불일치
            T0 + 2 * HOUR,
            T0 + 30 * HOUR,
        ];
        let range = TimeRange::from_millis(T0, T0 + 3 * HOUR).unwrap();
        let gaps = detector().detect(Timeframe::H1, &stored, &range, later());

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::Interior);
        assert_eq!(gaps[0].range_start.timestamp_millis(), T0 + HOUR);
        assert_eq!(gaps[0].missing_count, 1);
    }

    #[test]
    fn test_unaligned_range_is_rounded_inward() {
        let range = TimeRange::from_millis(T0 + 1, T0 + 3 * HOUR + 1).unwrap();
        let (first, last) = GapDetector::expected_slots(Timeframe::H1, &range, later()).unwrap();
        assert_eq!(first, T0 + HOUR);
        assert_eq!(last, T0 + 3 * HOUR);
    }

    #[test]
    fn test_open_candle_is_not_expected() {
        // 10:30 시점에는 09:00 캔들까지만 닫혀 있음
        let now: DateTime<Utc> = "2024-01-01T10:30:00Z".parse().unwrap();
        let gaps = detector().detect(Timeframe::H1, &[], &day(), now);

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].range_end.timestamp_millis(), T0 + 9 * HOUR);
        assert_eq!(gaps[0].missing_count, 10);
    }

    #[test]
    fn test_range_in_future_has_no_gaps() {
        let now: DateTime<Utc> = "2023-12-31T00:00:00Z".parse().unwrap();
        assert!(detector().detect(Timeframe::H1, &[], &day(), now).is_empty());
    }

    #[test]
    fn test_weekly_slots_start_on_monday() {
        // 2024-01-01은 월요일
        let range = TimeRange::from_millis(T0 - 3 * 24 * HOUR, T0 + 15 * 24 * HOUR).unwrap();
        let (first, last) = GapDetector::expected_slots(Timeframe::W1, &range, later()).unwrap();
        assert_eq!(first, T0);
        assert_eq!(last, T0 + 14 * 24 * HOUR);
    }

    proptest! {
        #[test]
        fn prop_gaps_partition_missing_slots(present in proptest::collection::vec(any::<bool>(), 1..200)) {
            let n = present.len() as i64;
            let range = TimeRange::from_millis(T0, T0 + n * HOUR).unwrap();
            let stored: Vec<i64> = present
                .iter()
                .enumerate()
                .filter(|(_, p)| **p)
                .map(|(i, _)| T0 + i as i64 * HOUR)
                .collect();

            let gaps = detector().detect(Timeframe::H1, &stored, &range, later());

            let missing: u64 = gaps.iter().map(|g| g.missing_count).sum();
            prop_assert_eq!(missing + stored.len() as u64, n as u64);

            for gap in &gaps {
                let start = gap.range_start.timestamp_millis();
                let end = gap.range_end.timestamp_millis();
                prop_assert!(start <= end);
                prop_assert!(stored.iter().all(|ts| *ts < start || *ts > end));
            }
            for pair in gaps.windows(2) {
                prop_assert!(pair[0].range_end < pair[1].range_start);
            }

            // 채운 뒤 다시 감지하면 갭이 없어야 함
            let mut filled = stored.clone();
            for gap in &gaps {
                let mut ts = gap.range_start.timestamp_millis();
                while ts <= gap.range_end.timestamp_millis() {
                    filled.push(ts);
                    ts += HOUR;
                }
            }
            prop_assert!(detector().detect(Timeframe::H1, &filled, &range, later()).is_empty());
        }
    }
}
