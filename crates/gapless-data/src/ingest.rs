//! 캔들 적재.
//!
//! 원시 행을 정규 행으로 변환(버전, 출처, `sign = +1`)하고 저장소의 배치 삽입 경로로
//! 한 번에 씁니다. 대량 백필과 작은 갭 채우기가 같은 경로를 사용합니다.
//!
//! 같은 입력을 여러 번 적재해도 병합 후 보이는 행은 변하지 않으므로,
//! 쓰기 실패 시 배치 전체를 그대로 다시 시도합니다.

use crate::error::{DataError, Result};
use crate::storage::CandleStore;
use gapless_core::{Candle, RawCandle, RetryPolicy, SeriesId};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// 적재 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// 변환된 행 수
    pub accepted: usize,
    /// 시리즈 불일치, 경계 불일치 등으로 버린 행 수
    pub rejected: usize,
    /// 저장소에 쓴 물리 행 수
    pub written: usize,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.written += other.written;
    }
}

/// 적재 엔진.
#[derive(Clone)]
pub struct IngestionEngine {
    store: Arc<dyn CandleStore>,
    retry: RetryPolicy,
}

impl IngestionEngine {
    pub fn new(store: Arc<dyn CandleStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry: retry.normalized(),
        }
    }

    /// 원시 행을 시리즈에 귀속시켜 적재합니다.
    ///
    /// 시리즈 경계에 맞지 않는 행은 쓰지 않고 `rejected`로 집계합니다.
    #[instrument(skip(self, series, rows, cancel), fields(series = %series, rows = rows.len()))]
    pub async fn ingest(
        &self,
        series: &SeriesId,
        rows: Vec<RawCandle>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let total = rows.len();
        let candles: Vec<Candle> = rows
            .into_iter()
            .filter(|row| series.timeframe.is_aligned(row.open_time_ms()))
            .map(|row| Candle::from_raw(series, row))
            .collect();

        let rejected = total - candles.len();
        if rejected > 0 {
            warn!(rejected = rejected, "경계에 맞지 않는 행 제외");
        }

        let mut report = self.ingest_candles(series, &candles, cancel).await?;
        report.rejected += rejected;
        Ok(report)
    }

    /// 이미 변환된 행을 적재합니다.
    pub async fn ingest_candles(
        &self,
        series: &SeriesId,
        candles: &[Candle],
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let (valid, invalid): (Vec<&Candle>, Vec<&Candle>) = candles
            .iter()
            .partition(|c| c.belongs_to(series) && series.timeframe.is_aligned(c.timestamp_ms()));

        if !invalid.is_empty() {
            warn!(
                series = %series,
                rejected = invalid.len(),
                "다른 시리즈이거나 경계에 맞지 않는 행 제외"
            );
        }

        let mut report = IngestReport {
            accepted: valid.len(),
            rejected: invalid.len(),
            written: 0,
        };
        if valid.is_empty() {
            return Ok(report);
        }

        let batch: Vec<Candle> = valid.into_iter().cloned().collect();
        report.written = self.write_batch(&batch, cancel).await?;

        debug!(
            series = %series,
            accepted = report.accepted,
            written = report.written,
            "적재 완료"
        );
        Ok(report)
    }

    /// 배치 전체를 재시도 정책에 따라 씁니다.
    async fn write_batch(&self, batch: &[Candle], cancel: &CancellationToken) -> Result<usize> {
        let store = self.store.as_ref();
        self.retry
            .retry_async_when(
                |attempt| async move {
                    if cancel.is_cancelled() {
                        return Err(DataError::Cancelled);
                    }
                    let result = store.insert_batch(batch).await;
                    if let Err(e) = &result {
                        if e.is_retryable() {
                            warn!(
                                store = store.name(),
                                attempt = attempt + 1,
                                error = %e,
                                "배치 쓰기 실패, 재시도"
                            );
                        }
                    }
                    result
                },
                DataError::is_retryable,
            )
            .await
    }
}
