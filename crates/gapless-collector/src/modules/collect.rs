//! 다중 시리즈 수집.
//!
//! 설정된 심볼 × 타임프레임을 오케스트레이터로 동시에 채우고 통계를 집계합니다.

use crate::{CollectionStats, CollectorConfig, Result};
use chrono::{DateTime, Duration, Utc};
use gapless_core::{SeriesId, TimeRange};
use gapless_data::ConsistentQueryLayer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `now`에서 `lookback`만큼 거슬러 올라간 수집 범위
pub fn collection_range(lookback: Duration, now: DateTime<Utc>) -> Result<TimeRange> {
    Ok(TimeRange::new(now - lookback, now)?)
}

/// 시리즈 목록의 갭을 채웁니다.
///
/// 엄격 모드가 아니면 실패한 시리즈는 통계와 로그에만 남고 나머지 결과는 유지됩니다.
/// 거래소 차단은 정책과 관계없이 수집 전체를 에러로 끝냅니다.
pub async fn collect_series(
    layer: &ConsistentQueryLayer,
    series: &[SeriesId],
    range: &TimeRange,
    cancel: &CancellationToken,
) -> Result<CollectionStats> {
    if series.is_empty() {
        warn!("수집할 시리즈가 없습니다");
        return Ok(CollectionStats::new());
    }

    info!(
        series = series.len(),
        start = %range.start,
        end = %range.end,
        "수집 시작"
    );

    let outcome = layer.fill_many(series, range, cancel).await?;

    for failure in &outcome.failures {
        warn!(series = %failure.series, error = %failure.error, "시리즈 수집 실패");
    }
    for (id, report) in &outcome.succeeded {
        for unfilled in &report.unfilled {
            warn!(series = %id, unfilled = %unfilled, "채우지 못한 구간");
        }
    }

    Ok(CollectionStats::from_outcome(&outcome))
}

/// 데몬 한 주기: 설정된 대상 전체를 `now` 기준 수집 기간으로 채웁니다.
pub async fn run_cycle(
    layer: &ConsistentQueryLayer,
    config: &CollectorConfig,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<CollectionStats> {
    let range = collection_range(config.collect.lookback(), now)?;
    collect_series(layer, &config.collect.series(), &range, cancel).await
}
