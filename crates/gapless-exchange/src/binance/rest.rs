//! Binance REST 캔들 클라이언트.
//!
//! 페이지 단위로 순차 호출하며, 모든 호출은 공유 레이트 리미터에서 토큰을 얻은 뒤 실행됩니다.

use super::{classify_status, retry_after_header};
use crate::error::FetchError;
use crate::fetcher::{FailedRange, FetchResult};
use crate::rate_limit::RateLimiter;
use chrono::{DateTime, Utc};
use gapless_core::{
    DataSource, ExchangeConfig, InstrumentType, RawCandle, RetryPolicy, SeriesId, TimeRange,
};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SPOT_KLINES: &str = "/api/v3/klines";
const FUTURES_KLINES: &str = "/fapi/v1/klines";
const FUNDING_RATE: &str = "/fapi/v1/fundingRate";
const FUNDING_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
struct BinanceKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base asset volume
    String, // 10: Taker buy quote asset volume
    String, // 11: Ignore
);

impl BinanceKline {
    fn into_raw(self) -> Result<RawCandle, FetchError> {
        Ok(RawCandle {
            open_time: to_datetime(self.0)?,
            close_time: to_datetime(self.6)?,
            open: parse_decimal(&self.1)?,
            high: parse_decimal(&self.2)?,
            low: parse_decimal(&self.3)?,
            close: parse_decimal(&self.4)?,
            volume: parse_decimal(&self.5)?,
            quote_volume: parse_decimal(&self.7)?,
            trade_count: self.8,
            taker_buy_base_volume: parse_decimal(&self.9)?,
            taker_buy_quote_volume: parse_decimal(&self.10)?,
            funding_rate: None,
            source: DataSource::RestApi,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceFundingRate {
    funding_time: i64,
    funding_rate: String,
}

/// 펀딩비 이벤트.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingEvent {
    pub time_ms: i64,
    pub rate: Decimal,
}

/// Binance REST 클라이언트.
pub struct BinanceRestClient {
    client: Client,
    spot_base_url: String,
    futures_base_url: String,
    spot_page_limit: u32,
    futures_page_limit: u32,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl BinanceRestClient {
    /// 새 클라이언트를 생성합니다. 리미터는 모든 파이프라인이 공유해야 합니다.
    pub fn new(
        config: &ExchangeConfig,
        retry: RetryPolicy,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FetchError::TransientNetwork(format!("HTTP 클라이언트 생성 실패: {}", e)))?;

        Ok(Self {
            client,
            spot_base_url: config.spot_rest_url.trim_end_matches('/').to_string(),
            futures_base_url: config.futures_rest_url.trim_end_matches('/').to_string(),
            spot_page_limit: config.spot_page_limit,
            futures_page_limit: config.futures_page_limit,
            limiter,
            retry: retry.normalized(),
        })
    }

    /// 상품 유형별 페이지당 최대 행 수.
    pub fn page_limit(&self, instrument: InstrumentType) -> u32 {
        match instrument {
            InstrumentType::Spot => self.spot_page_limit,
            InstrumentType::PerpetualFutures => self.futures_page_limit,
        }
    }

    fn klines_url(&self, instrument: InstrumentType) -> String {
        match instrument {
            InstrumentType::Spot => format!("{}{}", self.spot_base_url, SPOT_KLINES),
            InstrumentType::PerpetualFutures => {
                format!("{}{}", self.futures_base_url, FUTURES_KLINES)
            }
        }
    }

    /// 범위의 캔들을 페이지 단위로 가져옵니다.
    ///
    /// 재시도 예산을 소진한 페이지는 해당 구간만 실패로 기록하고 다음 페이지로 넘어갑니다.
    /// 차단 등 치명적 에러는 즉시 반환합니다.
    pub async fn fetch_klines(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let interval = series.timeframe.interval_ms();
        let limit = self.page_limit(series.instrument);
        let end = range.end_ms();
        let mut cursor = range.start_ms();
        let mut result = FetchResult::default();

        while cursor < end {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let window_end = (cursor + limit as i64 * interval).min(end);

            match self.fetch_page(series, cursor, end - 1, limit, cancel).await {
                Ok(page) => {
                    let page_len = page.len();
                    let last_open = page.last().map(RawCandle::open_time_ms);
                    result
                        .rows
                        .extend(page.into_iter().filter(|row| range.contains_ms(row.open_time_ms())));

                    match last_open {
                        Some(last) if last >= cursor => cursor = last + interval,
                        _ => break,
                    }
                    if page_len < limit as usize {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        series = %series,
                        start = cursor,
                        end = window_end,
                        error = %e,
                        "REST 페이지 재시도 소진, 구간 실패 처리"
                    );
                    result.failures.push(FailedRange {
                        range: TimeRange::from_millis(cursor, window_end)
                            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?,
                        reason: e,
                    });
                    cursor = window_end;
                }
            }
        }

        result.rows.sort_by_key(RawCandle::open_time_ms);
        result.rows.dedup_by_key(|row| row.open_time_ms());
        debug!(series = %series, rows = result.rows.len(), "REST 수집 완료");
        Ok(result)
    }

    async fn fetch_page(
        &self,
        series: &SeriesId,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandle>, FetchError> {
        let url = self.klines_url(series.instrument);
        let params = [
            ("symbol", series.symbol.clone()),
            ("interval", series.timeframe.to_binance_interval().to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", limit.to_string()),
        ];

        let klines: Vec<BinanceKline> = self.get_with_retry(&url, &params, cancel).await?;
        klines.into_iter().map(BinanceKline::into_raw).collect()
    }

    /// 펀딩비 이력을 가져옵니다. 결과는 시간순입니다.
    pub async fn fetch_funding_rates(
        &self,
        symbol: &str,
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<FundingEvent>, FetchError> {
        let url = format!("{}{}", self.futures_base_url, FUNDING_RATE);
        let end = range.end_ms();
        let mut cursor = range.start_ms();
        let mut events = Vec::new();

        while cursor < end {
            let params = [
                ("symbol", symbol.to_string()),
                ("startTime", cursor.to_string()),
                ("endTime", (end - 1).to_string()),
                ("limit", FUNDING_PAGE_LIMIT.to_string()),
            ];
            let page: Vec<BinanceFundingRate> = self.get_with_retry(&url, &params, cancel).await?;
            let page_len = page.len();

            for item in page {
                events.push(FundingEvent {
                    time_ms: item.funding_time,
                    rate: parse_decimal(&item.funding_rate)?,
                });
            }

            match events.last() {
                Some(last) if page_len == FUNDING_PAGE_LIMIT as usize && last.time_ms >= cursor => {
                    cursor = last.time_ms + 1;
                }
                _ => break,
            }
        }

        events.sort_by_key(|e| e.time_ms);
        events.dedup_by_key(|e| e.time_ms);
        Ok(events)
    }

    /// 레이트 리미터를 거쳐 GET을 수행하고, 재시도 가능한 에러는 백오프 후 재시도합니다.
    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T, FetchError> {
        self.retry
            .retry_async_when(
                |attempt| async move {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = self.limiter.acquire() => {}
                    }

                    let result = self.get_json(url, params).await;
                    if let Err(e) = &result {
                        if let Some(delay) = e.retry_after() {
                            self.limiter.pause_for(delay).await;
                        }
                        if e.is_retryable() {
                            warn!(url = url, attempt = attempt + 1, error = %e, "REST 호출 실패, 재시도");
                        }
                    }
                    result
                },
                FetchError::is_retryable,
            )
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        debug!("GET {} {:?}", url, params);
        let response = self.client.get(url).query(params).send().await?;

        let status = response.status();
        let retry_after = retry_after_header(&response);
        let body = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| {
                FetchError::SchemaMismatch(format!("응답 파싱 실패: {} - Body: {}", e, truncate(&body)))
            })
        } else {
            Err(classify_status(status, retry_after, &body))
        }
    }
}

/// 펀딩비를 캔들 시작 시각 기준으로 앞에서부터 채웁니다.
///
/// 캔들 시작 시각 이하의 가장 최근 펀딩 이벤트 값을 사용하며, 이미 값이 있는 행은 건드리지 않습니다.
pub fn forward_fill_funding(rows: &mut [RawCandle], events: &[FundingEvent]) {
    for row in rows.iter_mut().filter(|r| r.funding_rate.is_none()) {
        let open = row.open_time_ms();
        let idx = events.partition_point(|e| e.time_ms <= open);
        if idx > 0 {
            row.funding_rate = Some(events[idx - 1].rate);
        }
    }
}

fn to_datetime(ms: i64) -> Result<DateTime<Utc>, FetchError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| FetchError::SchemaMismatch(format!("잘못된 타임스탬프: {}", ms)))
}

fn parse_decimal(raw: &str) -> Result<Decimal, FetchError> {
    Decimal::from_str(raw).map_err(|_| FetchError::SchemaMismatch(format!("잘못된 숫자: {}", raw)))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
