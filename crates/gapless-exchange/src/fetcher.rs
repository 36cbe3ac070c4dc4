//! 듀얼 소스 페처.
//!
//! 갭 하나를 원시 캔들 행으로 변환합니다. 오래된 구간은 대량 아카이브에서,
//! 아카이브가 아직 게시되지 않은 최근 구간(`now - lag` 이후)은 REST에서 가져옵니다.

use crate::binance::rest::forward_fill_funding;
use crate::binance::{plan_periods, BinanceArchiveClient, BinanceRestClient};
use crate::error::FetchError;
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gapless_core::{FetchConfig, GaplessConfig, RawCandle, SeriesId, TimeRange};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 펀딩비 조회 시 범위 앞쪽으로 더 가져올 기간 (선물 펀딩 주기 최대 8시간의 3배).
const FUNDING_LOOKBACK_HOURS: i64 = 24;

/// 요청 경로.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchRoute {
    /// 대량 아카이브
    Bulk,
    /// REST API
    Rest,
}

/// 페치 요청 한 건.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub series: SeriesId,
    pub range: TimeRange,
    pub route: FetchRoute,
}

/// 가져오지 못한 구간과 이유.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRange {
    pub range: TimeRange,
    pub reason: FetchError,
}

/// 페치 결과. 성공한 행과 실패 구간을 함께 담습니다.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub rows: Vec<RawCandle>,
    pub failures: Vec<FailedRange>,
}

impl FetchResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// 다른 결과를 합칩니다. 행은 시간순으로 정렬하고 중복을 제거합니다.
    pub fn absorb(&mut self, other: FetchResult) {
        self.rows.extend(other.rows);
        self.failures.extend(other.failures);
        self.rows.sort_by_key(RawCandle::open_time_ms);
        self.rows.dedup_by_key(|row| row.open_time_ms());
    }
}

/// 캔들 소스.
///
/// 쿼리 계층은 이 트레이트만 알며, 테스트에서는 가짜 구현으로 대체합니다.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// 범위를 경로별, 청크별 요청으로 나눕니다.
    fn plan_requests(&self, series: &SeriesId, range: &TimeRange, now: DateTime<Utc>)
        -> Vec<FetchRequest>;

    /// 요청 한 건을 실행합니다.
    ///
    /// 재시도를 소진한 구간은 `FetchResult::failures`로 보고되며,
    /// 차단이나 스키마 불일치 같은 치명적 에러만 `Err`로 반환됩니다.
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError>;

    /// 범위 전체를 계획하고 순서대로 실행합니다.
    async fn fetch_range(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let mut result = FetchResult::default();
        for request in self.plan_requests(series, range, now) {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            result.absorb(self.fetch(&request, cancel).await?);
        }
        Ok(result)
    }
}

/// 경로 결정과 청크 분할.
#[derive(Debug, Clone)]
pub struct FetchPlanner {
    archive_lag: Duration,
    bulk_min_candles: u64,
    max_chunk_candles: u64,
}

impl FetchPlanner {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            archive_lag: config.archive_lag(),
            bulk_min_candles: config.bulk_min_candles,
            max_chunk_candles: config.max_chunk_candles.max(1),
        }
    }

    /// 범위를 `now - lag` 기준으로 자르고, 각 부분을 경로별 청크로 나눕니다.
    pub fn plan(&self, series: &SeriesId, range: &TimeRange, now: DateTime<Utc>) -> Vec<FetchRequest> {
        let tf = series.timeframe;
        let cutoff_ms = tf.align_floor((now - self.archive_lag).timestamp_millis());
        let start = range.start_ms();
        let end = range.end_ms();

        let mut requests = Vec::new();

        let older_end = end.min(cutoff_ms);
        if start < older_end {
            if let Ok(older) = TimeRange::from_millis(start, older_end) {
                let route = if older.expected_candles(tf) >= self.bulk_min_candles {
                    FetchRoute::Bulk
                } else {
                    FetchRoute::Rest
                };
                self.push_chunks(&mut requests, series, older, route);
            }
        }

        let newer_start = start.max(cutoff_ms);
        if newer_start < end {
            if let Ok(newer) = TimeRange::from_millis(newer_start, end) {
                self.push_chunks(&mut requests, series, newer, FetchRoute::Rest);
            }
        }

        requests
    }

    fn push_chunks(
        &self,
        requests: &mut Vec<FetchRequest>,
        series: &SeriesId,
        range: TimeRange,
        route: FetchRoute,
    ) {
        let span = self.max_chunk_candles as i64 * series.timeframe.interval_ms();
        let end = range.end_ms();
        let mut cursor = range.start_ms();

        while cursor < end {
            let chunk_end = cursor.saturating_add(span).min(end);
            if let Ok(chunk) = TimeRange::from_millis(cursor, chunk_end) {
                requests.push(FetchRequest {
                    series: series.clone(),
                    range: chunk,
                    route,
                });
            }
            cursor = chunk_end;
        }
    }
}

/// Binance 아카이브 + REST 듀얼 소스 페처.
pub struct DualSourceFetcher {
    planner: FetchPlanner,
    rest: BinanceRestClient,
    archive: BinanceArchiveClient,
}

impl DualSourceFetcher {
    /// 설정과 공유 레이트 리미터로 생성합니다.
    pub fn new(config: &GaplessConfig, limiter: Arc<RateLimiter>) -> Result<Self, FetchError> {
        Ok(Self {
            planner: FetchPlanner::new(&config.fetch),
            rest: BinanceRestClient::new(&config.exchange, config.retry.network.clone(), limiter)?,
            archive: BinanceArchiveClient::new(
                &config.exchange,
                config.fetch.verify_checksums,
                config.retry.network.clone(),
            )?,
        })
    }

    /// 설정의 분당 한도로 리미터를 만들어 생성합니다.
    pub fn from_config(config: &GaplessConfig) -> Result<Self, FetchError> {
        let limiter = Arc::new(RateLimiter::per_minute(config.exchange.requests_per_minute));
        Self::new(config, limiter)
    }

    async fn fetch_bulk(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let mut result = FetchResult::default();

        for period in plan_periods(&request.range) {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let Some(wanted) = period.range().intersect(&request.range) else {
                continue;
            };

            match self.archive.fetch_period(&request.series, &period, cancel).await {
                Ok(rows) => {
                    result
                        .rows
                        .extend(rows.into_iter().filter(|r| wanted.contains_ms(r.open_time_ms())));
                }
                Err(FetchError::ArchiveNotFound(url)) => {
                    info!(url = %url, "아카이브 미게시, REST로 대체");
                    result.absorb(self.rest.fetch_klines(&request.series, &wanted, cancel).await?);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        series = %request.series,
                        period = %period.label(),
                        error = %e,
                        "아카이브 실패, 구간 건너뜀"
                    );
                    result.failures.push(FailedRange {
                        range: wanted,
                        reason: e,
                    });
                }
            }
        }

        result.rows.sort_by_key(RawCandle::open_time_ms);
        result.rows.dedup_by_key(|row| row.open_time_ms());
        Ok(result)
    }

    /// 선물 행 중 펀딩비가 없는 행을 펀딩 이력으로 채웁니다.
    ///
    /// 이력 조회가 실패하면 행을 버리고 요청 구간 전체를 실패로 보고합니다.
    async fn enrich_funding(
        &self,
        request: &FetchRequest,
        result: &mut FetchResult,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        if !request.series.instrument.has_funding()
            || result.rows.iter().all(|r| r.funding_rate.is_some())
        {
            return Ok(());
        }

        let lookback = TimeRange {
            start: request.range.start - Duration::hours(FUNDING_LOOKBACK_HOURS),
            end: request.range.end,
        };
        match self
            .rest
            .fetch_funding_rates(&request.series.symbol, &lookback, cancel)
            .await
        {
            Ok(events) => {
                forward_fill_funding(&mut result.rows, &events);
                drop_unfunded(request, result);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(series = %request.series, error = %e, "펀딩비 조회 실패, 구간 실패 처리");
                result.rows.clear();
                result.failures.push(FailedRange {
                    range: request.range,
                    reason: e,
                });
                Ok(())
            }
        }
    }
}

/// 펀딩비를 채우지 못한 선물 행을 빼고, 연속 구간별로 실패를 보고합니다.
fn drop_unfunded(request: &FetchRequest, result: &mut FetchResult) {
    let interval = request.series.timeframe.chrono_duration();
    let mut missing: Vec<TimeRange> = Vec::new();
    result.rows.retain(|row| {
        if row.funding_rate.is_some() {
            return true;
        }
        match missing.last_mut() {
            Some(last) if last.end == row.open_time => last.end = row.open_time + interval,
            _ => missing.push(TimeRange {
                start: row.open_time,
                end: row.open_time + interval,
            }),
        }
        false
    });

    if missing.is_empty() {
        return;
    }
    let dropped: i64 = missing
        .iter()
        .map(|r| (r.end - r.start).num_milliseconds() / interval.num_milliseconds())
        .sum();
    warn!(
        series = %request.series,
        dropped = dropped,
        "펀딩 이벤트 이전 행 제외"
    );
    result
        .failures
        .extend(missing.into_iter().map(|range| FailedRange {
            range,
            reason: FetchError::FundingUnavailable(format!(
                "{} 이전 펀딩 이벤트 없음",
                range.end
            )),
        }));
}

#[async_trait]
impl CandleSource for DualSourceFetcher {
    fn plan_requests(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        now: DateTime<Utc>,
    ) -> Vec<FetchRequest> {
        self.planner.plan(series, range, now)
    }

    #[instrument(skip(self, cancel), fields(series = %request.series, route = ?request.route))]
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let mut result = match request.route {
            FetchRoute::Bulk => self.fetch_bulk(request, cancel).await?,
            FetchRoute::Rest => {
                self.rest
                    .fetch_klines(&request.series, &request.range, cancel)
                    .await?
            }
        };
        self.enrich_funding(request, &mut result, cancel).await?;

        debug!(
            rows = result.rows.len(),
            failures = result.failures.len(),
            "페치 완료"
        );
        Ok(result)
    }
}
