//! 일관성 쿼리 계층.
//!
//! 읽기 전에 요청 범위의 갭을 감지하고, 갭마다 페치 → 버전 계산 → 적재를 수행한 뒤
//! 병합 읽기(`ReadMode::Final`)로 결과를 반환합니다 (지연 자동 적재).
//!
//! # 동작 흐름
//!
//! ```text
//! query_range(series, range)
//!         │
//!         ▼
//! ┌─────────────────────┐
//! │ 1. 시리즈 Lock 획득  │ ← 같은 시리즈의 채우기는 하나씩
//! └─────────┬───────────┘
//!           │
//! ┌─────────▼───────────┐
//! │ 2. 갭 감지           │
//! └─────────┬───────────┘
//!           │
//! ┌─────────▼───────────┐
//! │ 3. 갭별 페치 + 적재  │ ← 아카이브 / REST
//! └─────────┬───────────┘
//!           │
//! ┌─────────▼───────────┐
//! │ 4. 재감지            │ ← 남은 갭이 있으면 IncompleteRange
//! └─────────┬───────────┘
//!           │
//! ┌─────────▼───────────┐
//! │ 5. 병합 읽기         │
//! └─────────────────────┘
//! ```

use crate::error::{DataError, Result, UnfilledRange, UnitFailure};
use crate::gap::GapDetector;
use crate::ingest::{IngestReport, IngestionEngine};
use crate::orchestrator::{BatchOutcome, ConcurrencyOrchestrator};
use crate::storage::{CandleStore, ReadMode};
use chrono::{DateTime, Utc};
use gapless_core::{Candle, Gap, GaplessConfig, SeriesId, TimeRange};
use gapless_exchange::{CandleSource, FailedRange};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 시리즈별 채우기 상태를 추적하는 Lock 맵.
type FillLockMap = Arc<RwLock<HashMap<String, Arc<RwLock<()>>>>>;

/// 현재 시각 공급자.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const NO_DATA_REASON: &str = "거래소가 해당 구간의 데이터를 반환하지 않음";

/// 갭 채우기 결과.
#[derive(Debug, Clone, Serialize)]
pub struct FillReport {
    pub series: SeriesId,
    /// 채우기 전에 감지된 갭
    pub gaps: Vec<Gap>,
    /// 가져온 원시 행 수
    pub fetched: usize,
    pub ingest: IngestReport,
    /// 채우지 못한 구간
    pub unfilled: Vec<UnfilledRange>,
}

impl FillReport {
    pub fn is_complete(&self) -> bool {
        self.unfilled.is_empty()
    }

    pub fn missing_before(&self) -> u64 {
        self.gaps.iter().map(|g| g.missing_count).sum()
    }
}

/// 다중 시리즈 조회 결과.
#[derive(Debug, Default)]
pub struct MultiSymbolResult {
    pub rows: BTreeMap<SeriesId, Vec<Candle>>,
    pub failures: Vec<UnitFailure>,
}

impl MultiSymbolResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 일관성 쿼리 계층.
#[derive(Clone)]
pub struct ConsistentQueryLayer {
    store: Arc<dyn CandleStore>,
    source: Arc<dyn CandleSource>,
    ingestion: IngestionEngine,
    detector: GapDetector,
    orchestrator: ConcurrencyOrchestrator,
    clock: Clock,
    fill_locks: FillLockMap,
}

impl ConsistentQueryLayer {
    /// 설정, 저장소, 캔들 소스로 생성합니다.
    pub fn new(
        config: &GaplessConfig,
        store: Arc<dyn CandleStore>,
        source: Arc<dyn CandleSource>,
    ) -> Self {
        Self {
            ingestion: IngestionEngine::new(store.clone(), config.retry.storage.clone()),
            detector: GapDetector::new(&config.fetch),
            orchestrator: ConcurrencyOrchestrator::from_config(&config.orchestrator),
            clock: Arc::new(Utc::now),
            fill_locks: Arc::new(RwLock::new(HashMap::new())),
            store,
            source,
        }
    }

    /// 현재 시각 공급자를 교체합니다.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// 다중 시리즈 실행에 쓸 오케스트레이터를 교체합니다.
    pub fn with_orchestrator(mut self, orchestrator: ConcurrencyOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &ConcurrencyOrchestrator {
        &self.orchestrator
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// 범위의 갭을 감지합니다. 저장소를 변경하지 않습니다.
    pub async fn detect_gaps(&self, series: &SeriesId, range: &TimeRange) -> Result<Vec<Gap>> {
        let existing = self.store.timestamps(series, range).await?;
        Ok(self
            .detector
            .detect(series.timeframe, &existing, range, self.now()))
    }

    /// 범위의 갭을 모두 채웁니다.
    pub async fn fill_gaps(&self, series: &SeriesId, range: &TimeRange) -> Result<FillReport> {
        self.fill_gaps_with_cancel(series, range, &CancellationToken::new())
            .await
    }

    /// 취소 토큰을 받아 갭을 채웁니다.
    ///
    /// 차단, 스키마 불일치 같은 치명적 페치 에러는 `Err`로 반환하고,
    /// 그 외 실패 구간은 보고서의 `unfilled`에 담습니다.
    #[instrument(skip(self, series, cancel), fields(series = %series))]
    pub async fn fill_gaps_with_cancel(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<FillReport> {
        // 1. 동시성 제어: Lock 획득
        let key = series.to_string();
        let lock = self.get_or_create_lock(&key).await;
        let result = {
            let _guard = lock.write().await;
            self.fill_locked(series, range, cancel).await
        };
        self.release_lock(&key, lock).await;
        result
    }

    async fn fill_locked(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<FillReport> {
        // 2. 갭 감지
        let gaps = self.detect_gaps(series, range).await?;
        let mut report = FillReport {
            series: series.clone(),
            gaps: gaps.clone(),
            fetched: 0,
            ingest: IngestReport::default(),
            unfilled: Vec::new(),
        };
        if gaps.is_empty() {
            debug!("갭 없음");
            return Ok(report);
        }

        info!(
            gaps = gaps.len(),
            missing = report.missing_before(),
            "갭 채우기 시작"
        );

        // 3. 갭별 페치 + 적재
        let now = self.now();
        let mut failed: Vec<FailedRange> = Vec::new();
        for gap in &gaps {
            if cancel.is_cancelled() {
                return Err(DataError::Cancelled);
            }
            if gap.overlaps_archive_lag(now, self.detector.archive_lag()) {
                debug!(gap = %gap, "아카이브 미게시 구간 포함, REST 경로 사용");
            }

            let fetch_range = gap.fetch_range(series.timeframe);
            let result = self
                .source
                .fetch_range(series, &fetch_range, now, cancel)
                .await?;

            report.fetched += result.rows.len();
            failed.extend(result.failures);
            if !result.rows.is_empty() {
                let ingested = self.ingestion.ingest(series, result.rows, cancel).await?;
                report.ingest.merge(ingested);
            }
        }

        // 4. 재감지
        let remaining = self.detect_gaps(series, range).await?;
        report.unfilled = remaining
            .iter()
            .map(|gap| annotate(gap, series, &failed))
            .collect();

        if report.is_complete() {
            info!(
                fetched = report.fetched,
                written = report.ingest.written,
                "갭 채우기 완료"
            );
        } else {
            warn!(
                unfilled = report.unfilled.len(),
                fetched = report.fetched,
                "갭 일부를 채우지 못함"
            );
        }
        Ok(report)
    }

    /// 범위를 채운 뒤 병합된 행을 반환합니다.
    ///
    /// 채우지 못한 구간이 남으면 부분 데이터 대신 `IncompleteRange`를 반환합니다.
    pub async fn query_range(&self, series: &SeriesId, range: &TimeRange) -> Result<Vec<Candle>> {
        self.query_range_with_cancel(series, range, &CancellationToken::new())
            .await
    }

    pub async fn query_range_with_cancel(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>> {
        let report = self.fill_gaps_with_cancel(series, range, cancel).await?;
        if !report.is_complete() {
            return Err(DataError::IncompleteRange {
                series: series.clone(),
                unfilled: report.unfilled,
            });
        }
        self.store.query_range(series, range, ReadMode::Final).await
    }

    /// 닫힌 캔들 중 최신 `n`개를 반환합니다.
    pub async fn query_latest(&self, series: &SeriesId, n: usize) -> Result<Vec<Candle>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let tf = series.timeframe;
        let interval = tf.interval_ms();
        let last_closed = tf.align_floor(self.now().timestamp_millis() - interval);
        let span = i64::try_from(n)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|k| k.checked_mul(interval))
            .ok_or_else(|| DataError::InvalidInput(format!("조회 개수가 너무 큽니다: {}", n)))?;
        let range = TimeRange::from_millis(last_closed - span, last_closed + interval)?;

        let mut rows = self.query_range(series, &range).await?;
        if rows.len() > n {
            rows.drain(..rows.len() - n);
        }
        Ok(rows)
    }

    /// 여러 시리즈를 동시에 조회합니다.
    ///
    /// 한 시리즈의 실패는 다른 시리즈에 영향을 주지 않습니다 (엄격 모드 제외).
    pub async fn query_multi_symbol(
        &self,
        series: &[SeriesId],
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<MultiSymbolResult> {
        let layer = self.clone();
        let range = *range;
        let outcome = self
            .orchestrator
            .run(series.to_vec(), cancel, move |id, token| {
                let layer = layer.clone();
                async move { layer.query_range_with_cancel(&id, &range, &token).await }
            })
            .await?;

        Ok(MultiSymbolResult {
            rows: outcome.succeeded.into_iter().collect(),
            failures: outcome.failures,
        })
    }

    /// 여러 시리즈의 갭을 동시에 채웁니다.
    pub async fn fill_many(
        &self,
        series: &[SeriesId],
        range: &TimeRange,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome<FillReport>> {
        let layer = self.clone();
        let range = *range;
        self.orchestrator
            .run(series.to_vec(), cancel, move |id, token| {
                let layer = layer.clone();
                async move { layer.fill_gaps_with_cancel(&id, &range, &token).await }
            })
            .await
    }

    async fn get_or_create_lock(&self, key: &str) -> Arc<RwLock<()>> {
        let locks = self.fill_locks.read().await;
        if let Some(lock) = locks.get(key) {
            return lock.clone();
        }
        drop(locks);

        let mut locks = self.fill_locks.write().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 아무도 기다리지 않는 Lock은 맵에서 제거합니다.
    async fn release_lock(&self, key: &str, lock: Arc<RwLock<()>>) {
        drop(lock);
        let mut locks = self.fill_locks.write().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

/// 남은 갭에 겹치는 실패 이유를 붙입니다. 겹치는 실패가 없으면 데이터 없음으로 봅니다.
fn annotate(gap: &Gap, series: &SeriesId, failed: &[FailedRange]) -> UnfilledRange {
    let range = gap.fetch_range(series.timeframe);
    let reasons: Vec<String> = failed
        .iter()
        .filter(|f| f.range.intersect(&range).is_some())
        .map(|f| f.reason.to_string())
        .collect();

    let reason = if reasons.is_empty() {
        NO_DATA_REASON.to_string()
    } else {
        let mut unique = reasons;
        unique.sort();
        unique.dedup();
        unique.join("; ")
    };

    UnfilledRange {
        range,
        missing_count: gap.missing_count,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCandleStore;
    use async_trait::async_trait;
    use gapless_core::{GapKind, MergePolicy, Timeframe};
    use gapless_exchange::{FetchError, FetchRequest, FetchResult, FetchRoute};

    /// 항상 빈 결과를 돌려주는 소스.
    struct EmptySource;

    #[async_trait]
    impl CandleSource for EmptySource {
        fn plan_requests(
            &self,
            series: &SeriesId,
            range: &TimeRange,
            _now: DateTime<Utc>,
        ) -> Vec<FetchRequest> {
            vec![FetchRequest {
                series: series.clone(),
                range: *range,
                route: FetchRoute::Rest,
            }]
        }

        async fn fetch(
            &self,
            _request: &FetchRequest,
            _cancel: &CancellationToken,
        ) -> std::result::Result<FetchResult, FetchError> {
            Ok(FetchResult::default())
        }
    }

    fn at(value: &str) -> DateTime<Utc> {
        value.parse().unwrap()
    }

    fn failed(start: &str, end: &str, reason: FetchError) -> FailedRange {
        FailedRange {
            range: TimeRange::new(at(start), at(end)).unwrap(),
            reason,
        }
    }

    #[test]
    fn test_annotate_lists_each_reason_once() {
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);
        let gap = Gap::between(
            at("2024-01-01T00:00:00Z"),
            at("2024-01-01T05:00:00Z"),
            Timeframe::H1,
            GapKind::Full,
        )
        .unwrap();
        let failures = vec![
            failed("2024-01-01T00:00:00Z", "2024-01-01T02:00:00Z", FetchError::TransientNetwork("HTTP 503".into())),
            failed("2024-01-01T02:00:00Z", "2024-01-01T04:00:00Z", FetchError::Timeout("30s".into())),
            failed("2024-01-01T04:00:00Z", "2024-01-01T06:00:00Z", FetchError::TransientNetwork("HTTP 503".into())),
        ];

        let unfilled = annotate(&gap, &series, &failures);

        let reasons: Vec<&str> = unfilled.reason.split("; ").collect();
        assert_eq!(reasons.len(), 2);
        assert_eq!(unfilled.missing_count, 6);
    }

    #[test]
    fn test_annotate_without_overlap_reports_no_data() {
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);
        let gap = Gap::between(
            at("2024-01-01T00:00:00Z"),
            at("2024-01-01T01:00:00Z"),
            Timeframe::H1,
            GapKind::Interior,
        )
        .unwrap();
        let failures = vec![failed(
            "2024-01-02T00:00:00Z",
            "2024-01-02T01:00:00Z",
            FetchError::Timeout("30s".into()),
        )];

        assert_eq!(annotate(&gap, &series, &failures).reason, NO_DATA_REASON);
    }

    #[tokio::test]
    async fn test_fill_locks_are_released_after_fills() {
        let fixed = at("2024-06-01T00:00:00Z");
        let layer = ConsistentQueryLayer::new(
            &GaplessConfig::default(),
            Arc::new(MemoryCandleStore::new(MergePolicy::LatestIngested)),
            Arc::new(EmptySource),
        )
        .with_clock(Arc::new(move || fixed));
        let range = TimeRange::new(at("2024-01-01T00:00:00Z"), at("2024-01-01T06:00:00Z")).unwrap();

        let ids: Vec<SeriesId> = ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
            .iter()
            .map(|s| SeriesId::spot(*s, Timeframe::H1))
            .collect();
        let outcome = layer
            .fill_many(&ids, &range, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 3);
        assert!(layer.fill_locks.read().await.is_empty());

        // 단일 채우기도 끝나면 항목이 남지 않는다
        layer.fill_gaps(&ids[0], &range).await.unwrap();
        assert!(layer.fill_locks.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_held_by_waiter_is_kept() {
        let layer = ConsistentQueryLayer::new(
            &GaplessConfig::default(),
            Arc::new(MemoryCandleStore::new(MergePolicy::LatestIngested)),
            Arc::new(EmptySource),
        );
        let waiting = layer.get_or_create_lock("BTCUSDT:1h").await;
        let held = layer.get_or_create_lock("BTCUSDT:1h").await;

        layer.release_lock("BTCUSDT:1h", held).await;
        assert_eq!(layer.fill_locks.read().await.len(), 1);

        layer.release_lock("BTCUSDT:1h", waiting).await;
        assert!(layer.fill_locks.read().await.is_empty());
    }
}
