//! Binance 공개 데이터 아카이브 클라이언트.
//!
//! URL 형식:
//! `{base}/data/{spot|futures/um}/{monthly|daily}/klines/{SYMBOL}/{interval}/{SYMBOL}-{interval}-{period}.zip`
//!
//! 온전한 달은 월 아카이브, 나머지는 일 아카이브로 받습니다.

use super::{classify_status, retry_after_header};
use super::layout::parse_kline_csv;
use crate::error::FetchError;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use gapless_core::{
    DataSource, ExchangeConfig, InstrumentType, RawCandle, RetryPolicy, SeriesId, TimeRange,
    Timeframe,
};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// 아카이브 한 개가 담는 기간.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePeriod {
    Monthly { year: i32, month: u32 },
    Daily(NaiveDate),
}

impl ArchivePeriod {
    fn first_day(&self) -> NaiveDate {
        match *self {
            ArchivePeriod::Monthly { year, month } => {
                NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
            }
            ArchivePeriod::Daily(date) => date,
        }
    }

    fn next_first_day(&self) -> NaiveDate {
        match *self {
            ArchivePeriod::Monthly { year, month } => first_of_next_month(year, month),
            ArchivePeriod::Daily(date) => date.succ_opt().unwrap_or(NaiveDate::MAX),
        }
    }

    /// 기간이 덮는 반개구간.
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: midnight(self.first_day()),
            end: midnight(self.next_first_day()),
        }
    }

    /// URL에 들어가는 기간 표기 (`2024-01`, `2024-01-05`).
    pub fn label(&self) -> String {
        match self {
            ArchivePeriod::Monthly { year, month } => format!("{:04}-{:02}", year, month),
            ArchivePeriod::Daily(date) => date.format("%Y-%m-%d").to_string(),
        }
    }

    fn cadence(&self) -> &'static str {
        match self {
            ArchivePeriod::Monthly { .. } => "monthly",
            ArchivePeriod::Daily(_) => "daily",
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn first_of_next_month(year: i32, month: u32) -> NaiveDate {
    let (y, m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(NaiveDate::MAX)
}

/// 범위를 덮는 아카이브 기간 목록. 범위에 온전히 포함된 달만 월 아카이브를 씁니다.
pub fn plan_periods(range: &TimeRange) -> Vec<ArchivePeriod> {
    let mut periods = Vec::new();
    let mut day = range.start.date_naive();

    while midnight(day) < range.end {
        let month = ArchivePeriod::Monthly {
            year: day.year(),
            month: day.month(),
        };
        let month_range = month.range();
        if day.day() == 1 && month_range.start >= range.start && month_range.end <= range.end {
            periods.push(month);
            day = month.next_first_day();
        } else {
            periods.push(ArchivePeriod::Daily(day));
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
    }
    periods
}

/// 아카이브 다운로드 클라이언트.
pub struct BinanceArchiveClient {
    client: Client,
    base_url: String,
    verify_checksums: bool,
    retry: RetryPolicy,
}

impl BinanceArchiveClient {
    pub fn new(
        config: &ExchangeConfig,
        verify_checksums: bool,
        retry: RetryPolicy,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FetchError::TransientNetwork(format!("HTTP 클라이언트 생성 실패: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.archive_base_url.trim_end_matches('/').to_string(),
            verify_checksums,
            retry: retry.normalized(),
        })
    }

    /// 시리즈와 기간의 아카이브 URL.
    pub fn archive_url(&self, series: &SeriesId, period: &ArchivePeriod) -> String {
        let market = match series.instrument {
            InstrumentType::Spot => "spot",
            InstrumentType::PerpetualFutures => "futures/um",
        };
        let interval = series.timeframe.to_binance_interval();
        format!(
            "{base}/data/{market}/{cadence}/klines/{sym}/{interval}/{sym}-{interval}-{label}.zip",
            base = self.base_url,
            market = market,
            cadence = period.cadence(),
            sym = series.symbol,
            interval = interval,
            label = period.label(),
        )
    }

    /// 한 기간의 아카이브를 받아 검증된 행을 반환합니다.
    ///
    /// 미게시 아카이브는 `ArchiveNotFound`로 반환하여 호출자가 REST로 대체하게 합니다.
    pub async fn fetch_period(
        &self,
        series: &SeriesId,
        period: &ArchivePeriod,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandle>, FetchError> {
        let url = self.archive_url(series, period);
        let bytes = self
            .retry
            .retry_async_when(
                |attempt| {
                    let url = url.as_str();
                    async move {
                        if cancel.is_cancelled() {
                            return Err(FetchError::Cancelled);
                        }
                        let result = self.download(url).await;
                        if let Err(e) = &result {
                            if e.is_retryable() {
                                warn!(url = url, attempt = attempt + 1, error = %e, "아카이브 다운로드 실패, 재시도");
                            }
                            // CDN이 알려준 대기 시간만큼 쉰 뒤 백오프
                            if let Some(delay) = e.retry_after() {
                                tokio::select! {
                                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                        }
                        result
                    }
                },
                FetchError::is_retryable,
            )
            .await?;

        if self.verify_checksums {
            self.verify_checksum(&url, &bytes).await?;
        }

        let rows = tokio::task::spawn_blocking(move || decode_archive(&bytes))
            .await
            .map_err(|e| FetchError::MalformedArchive(format!("압축 해제 작업 실패: {}", e)))??;

        validate_period_rows(&rows, &period.range(), series.timeframe)?;
        debug!(url = %url, rows = rows.len(), "아카이브 디코딩 완료");
        Ok(rows)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::ArchiveNotFound(url.to_string()));
        }
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// `.CHECKSUM` 사이드카와 비교합니다. 사이드카가 없으면 건너뜁니다.
    async fn verify_checksum(&self, url: &str, bytes: &[u8]) -> Result<(), FetchError> {
        let checksum_url = format!("{}.CHECKSUM", url);
        let response = match self.client.get(&checksum_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %checksum_url, error = %e, "체크섬 다운로드 실패, 검증 생략");
                return Ok(());
            }
        };
        if !response.status().is_success() {
            warn!(url = %checksum_url, status = %response.status(), "체크섬 없음, 검증 생략");
            return Ok(());
        }

        let text = response.text().await?;
        let expected = text
            .split_whitespace()
            .next()
            .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| FetchError::MalformedArchive(format!("잘못된 체크섬 형식: {}", text.trim())))?
            .to_lowercase();
        let actual = hex::encode(Sha256::digest(bytes));

        if expected != actual {
            return Err(FetchError::MalformedArchive(format!(
                "체크섬 불일치: expected {}, got {}",
                expected, actual
            )));
        }
        info!(url = %url, hash = %actual, "체크섬 검증 완료");
        Ok(())
    }
}

/// zip을 풀고 안의 CSV를 디코딩합니다.
pub fn decode_archive(bytes: &[u8]) -> Result<Vec<RawCandle>, FetchError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.len() == 0 {
        return Err(FetchError::MalformedArchive("빈 zip 파일".to_string()));
    }

    let mut file = archive.by_index(0)?;
    let mut buffer = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buffer)?;
    parse_kline_csv(&buffer, DataSource::BulkArchive)
}

/// 기간 대비 행 수와 시각이 타당한지 검사합니다.
pub fn validate_period_rows(
    rows: &[RawCandle],
    period: &TimeRange,
    timeframe: Timeframe,
) -> Result<(), FetchError> {
    if rows.is_empty() {
        return Err(FetchError::MalformedArchive("행이 없는 아카이브".to_string()));
    }

    // 주봉은 기간 시작 이전 월요일에 열릴 수 있습니다
    let period = if timeframe == Timeframe::W1 {
        TimeRange {
            start: period.start - ChronoDuration::days(6),
            end: period.end,
        }
    } else {
        *period
    };

    let expected = period.expected_candles(timeframe);
    if rows.len() as u64 > expected {
        return Err(FetchError::MalformedArchive(format!(
            "행 수 초과: {} > 예상 {}",
            rows.len(),
            expected
        )));
    }

    if let Some(outside) = rows.iter().find(|r| !period.contains_ms(r.open_time_ms())) {
        return Err(FetchError::MalformedArchive(format!(
            "기간 밖의 행: {}",
            outside.open_time
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(start.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_plan_mixes_monthly_and_daily() {
        let periods = plan_periods(&range("2024-01-30T00:00:00Z", "2024-03-02T12:00:00Z"));
        assert_eq!(
            periods,
            vec![
                ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2024, 1, 30).unwrap()),
                ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()),
                ArchivePeriod::Monthly { year: 2024, month: 2 },
                ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
                ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()),
            ]
        );
    }

    #[test]
    fn test_plan_partial_day() {
        let periods = plan_periods(&range("2024-01-01T05:00:00Z", "2024-01-01T07:00:00Z"));
        assert_eq!(
            periods,
            vec![ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())]
        );
    }

    #[test]
    fn test_period_range_and_label() {
        let dec = ArchivePeriod::Monthly { year: 2023, month: 12 };
        assert_eq!(dec.label(), "2023-12");
        assert_eq!(dec.range(), range("2023-12-01T00:00:00Z", "2024-01-01T00:00:00Z"));
        assert_eq!(
            ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()).label(),
            "2024-02-29"
        );
    }
}
