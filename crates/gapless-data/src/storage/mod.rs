//! 캔들 저장소.
//!
//! 모든 쓰기는 배치 삽입이며 읽기 전 조회(read-before-write)가 없습니다.
//! 같은 식별자의 물리 행은 여러 개 존재할 수 있고, 보이는 행은 읽기 시점 병합
//! (`ReadMode::Final`) 또는 백그라운드 압축(`compact`)으로 하나로 정리됩니다.
//!
//! - `memory`: 프로세스 내 테이블
//! - `postgres`: PostgreSQL 추가 전용 테이블 (`DISTINCT ON`으로 병합)

pub mod memory;
pub mod postgres;

pub use memory::MemoryCandleStore;
pub use postgres::PgCandleStore;

use crate::error::{DataError, Result};
use async_trait::async_trait;
use gapless_core::{Candle, GaplessConfig, MergePolicy, SeriesId, StorageBackend, TimeRange};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 읽기 모드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// 식별자당 보이는 행 하나 (병합 적용)
    #[default]
    Final,
    /// 물리 행 전체 (진단용)
    Raw,
}

/// 캔들 저장소 인터페이스.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// 저장소 이름 (로그용).
    fn name(&self) -> &'static str;

    /// 행을 일괄 삽입하고 쓴 물리 행 수를 반환합니다.
    async fn insert_batch(&self, rows: &[Candle]) -> Result<usize>;

    /// `[start, end)` 범위의 행을 시간순으로 조회합니다.
    async fn query_range(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        mode: ReadMode,
    ) -> Result<Vec<Candle>>;

    /// 보이는 행 중 최신 `limit`개를 시간순으로 조회합니다.
    async fn latest(&self, series: &SeriesId, limit: usize) -> Result<Vec<Candle>>;

    /// 범위 안의 보이는 행 시각(밀리초)을 오름차순으로 조회합니다.
    async fn timestamps(&self, series: &SeriesId, range: &TimeRange) -> Result<Vec<i64>>;

    /// 밀려난 물리 행을 삭제하고 삭제한 행 수를 반환합니다.
    async fn compact(&self) -> Result<u64>;
}

/// 같은 식별자의 두 물리 행 중 병합 후 남는 행을 비교합니다.
///
/// `seq`는 저장소 내부의 적재 순번입니다. 결과가 `Greater`인 쪽이 이깁니다.
pub(crate) fn merge_order(
    policy: MergePolicy,
    (a, a_seq): (&Candle, u64),
    (b, b_seq): (&Candle, u64),
) -> Ordering {
    match policy {
        MergePolicy::LatestIngested => a_seq.cmp(&b_seq),
        MergePolicy::HighestVersion => a.version.cmp(&b.version).then(a_seq.cmp(&b_seq)),
    }
}

/// 설정에 맞는 저장소를 엽니다.
pub async fn open_store(config: &GaplessConfig) -> Result<Arc<dyn CandleStore>> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Memory => {
            info!(merge_policy = ?storage.merge_policy, "메모리 저장소 사용");
            Ok(Arc::new(MemoryCandleStore::new(storage.merge_policy)))
        }
        StorageBackend::Postgres => {
            let url = storage.database_url.as_deref().ok_or_else(|| {
                DataError::Config("storage.database_url이 설정되지 않았습니다".to_string())
            })?;
            let store = PgCandleStore::connect(
                url,
                storage.max_connections,
                storage.merge_policy,
                config.ingest.insert_chunk_size,
            )
            .await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// 주기적으로 `compact`를 실행하는 백그라운드 태스크를 띄웁니다.
///
/// `cancel`이 취소되면 종료합니다. 압축 실패는 로그만 남기고 다음 주기에 다시 시도합니다.
pub fn spawn_compactor(
    store: Arc<dyn CandleStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // 첫 tick은 즉시 완료됨
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(store = store.name(), "백그라운드 압축 종료");
                    break;
                }
                _ = interval.tick() => match store.compact().await {
                    Ok(0) => {}
                    Ok(removed) => info!(store = store.name(), removed = removed, "대체된 행 정리"),
                    Err(e) => warn!(store = store.name(), error = %e, "백그라운드 압축 실패"),
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapless_core::{DataSource, RawCandle, Timeframe};
    use rust_decimal_macros::dec;

    const T0: i64 = 1_704_067_200_000;

    fn candle(series: &SeriesId, close: rust_decimal::Decimal) -> Candle {
        Candle::from_raw(
            series,
            RawCandle {
                open_time: chrono::DateTime::from_timestamp_millis(T0).unwrap(),
                close_time: chrono::DateTime::from_timestamp_millis(T0 + 59_999).unwrap(),
                open: dec!(1),
                high: dec!(2),
                low: dec!(1),
                close,
                volume: dec!(10),
                quote_volume: dec!(15),
                trade_count: 3,
                taker_buy_base_volume: dec!(5),
                taker_buy_quote_volume: dec!(7),
                funding_rate: None,
                source: DataSource::RestApi,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_compactor_merges_and_stops() {
        let memory = Arc::new(MemoryCandleStore::new(MergePolicy::LatestIngested));
        let series = SeriesId::spot("BTCUSDT", Timeframe::M1);
        memory
            .insert_batch(&[candle(&series, dec!(1.5)), candle(&series, dec!(1.6))])
            .await
            .unwrap();
        assert_eq!(memory.physical_len().await, 2);

        let cancel = CancellationToken::new();
        let handle = spawn_compactor(memory.clone(), Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(memory.physical_len().await, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_merge_order_policies() {
        let series = SeriesId::spot("BTCUSDT", Timeframe::M1);
        let (a, b) = (candle(&series, dec!(1.5)), candle(&series, dec!(1.6)));
        let expected = a.version.cmp(&b.version);

        assert_eq!(
            merge_order(MergePolicy::LatestIngested, (&a, 1), (&b, 2)),
            Ordering::Less
        );
        assert_eq!(merge_order(MergePolicy::HighestVersion, (&a, 1), (&b, 2)), expected);
    }
}
