//! 수집 통계 구조체.

use gapless_data::{BatchOutcome, FillReport};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 수집 작업 통계
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    /// 총 시리즈 수
    pub total: usize,
    /// 갭을 모두 채운 시리즈 수
    pub success: usize,
    /// 에러로 실패한 시리즈 수
    pub errors: usize,
    /// 건너뛴 시리즈 수 (이미 갭 없음)
    pub skipped: usize,
    /// 채우지 못한 구간이 남은 시리즈 수
    pub incomplete: usize,
    /// 채우기 전 누락 캔들 수
    pub missing: u64,
    /// 저장된 총 캔들 수
    pub total_candles: usize,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl CollectionStats {
    /// 새 통계 객체 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 배치 실행 결과에서 통계 집계
    pub fn from_outcome(outcome: &BatchOutcome<FillReport>) -> Self {
        let mut stats = Self {
            total: outcome.succeeded.len() + outcome.failures.len(),
            errors: outcome.failures.len(),
            elapsed: outcome.elapsed,
            ..Self::default()
        };

        for (_, report) in &outcome.succeeded {
            stats.missing += report.missing_before();
            stats.total_candles += report.ingest.written;
            if report.gaps.is_empty() {
                stats.skipped += 1;
            } else if report.is_complete() {
                stats.success += 1;
            } else {
                stats.incomplete += 1;
            }
        }
        stats
    }

    /// 성공률 계산 (%). 건너뛴 시리즈도 성공으로 봅니다.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((self.success + self.skipped) as f64 / self.total as f64) * 100.0
        }
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            total = self.total,
            success = self.success,
            errors = self.errors,
            skipped = self.skipped,
            incomplete = self.incomplete,
            missing = self.missing,
            total_candles = self.total_candles,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "수집 완료"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapless_core::{Gap, GapKind, SeriesId, TimeRange, Timeframe};
    use gapless_data::{DataError, IngestReport, UnfilledRange, UnitFailure};

    const T0: i64 = 1_704_067_200_000;
    const HOUR: i64 = 3_600_000;

    fn report(symbol: &str, missing: i64, written: usize, unfilled: bool) -> (SeriesId, FillReport) {
        let series = SeriesId::spot(symbol, Timeframe::H1);
        let gaps = if missing == 0 {
            Vec::new()
        } else {
            let range = TimeRange::from_millis(T0, T0 + missing * HOUR).unwrap();
            vec![Gap::between(
                range.start,
                range.end - chrono::Duration::hours(1),
                Timeframe::H1,
                GapKind::Full,
            )
            .unwrap()]
        };
        let unfilled = if unfilled {
            vec![UnfilledRange {
                range: TimeRange::from_millis(T0, T0 + HOUR).unwrap(),
                missing_count: 1,
                reason: "HTTP 503".into(),
            }]
        } else {
            Vec::new()
        };
        let fill = FillReport {
            series: series.clone(),
            gaps,
            fetched: written,
            ingest: IngestReport {
                accepted: written,
                rejected: 0,
                written,
            },
            unfilled,
        };
        (series, fill)
    }

    #[test]
    fn test_from_outcome() {
        let outcome = BatchOutcome {
            succeeded: vec![
                report("BTCUSDT", 24, 24, false),
                report("ETHUSDT", 0, 0, false),
                report("SOLUSDT", 10, 9, true),
            ],
            failures: vec![UnitFailure {
                series: SeriesId::spot("BNBUSDT", Timeframe::H1),
                error: DataError::Cancelled,
            }],
            elapsed: Duration::from_millis(1500),
        };

        let stats = CollectionStats::from_outcome(&outcome);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.incomplete, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.missing, 34);
        assert_eq!(stats.total_candles, 33);
        assert!((stats.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_rate() {
        assert_eq!(CollectionStats::new().success_rate(), 0.0);
    }
}
