//! 프로세스 내 캔들 저장소.
//!
//! 물리 행을 적재 순번과 함께 그대로 쌓고, 읽을 때 병합 규칙으로 보이는 행을 고릅니다.

use super::{merge_order, CandleStore, ReadMode};
use crate::error::Result;
use async_trait::async_trait;
use gapless_core::{Candle, MergePolicy, SeriesId, TimeRange};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRow {
    seq: u64,
    candle: Candle,
}

#[derive(Debug, Default)]
struct Table {
    next_seq: u64,
    series: HashMap<SeriesId, BTreeMap<i64, Vec<StoredRow>>>,
}

/// 메모리 캔들 저장소.
pub struct MemoryCandleStore {
    policy: MergePolicy,
    table: RwLock<Table>,
}

impl MemoryCandleStore {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            table: RwLock::new(Table::default()),
        }
    }

    /// 물리 행 수.
    pub async fn physical_len(&self) -> usize {
        let table = self.table.read().await;
        table
            .series
            .values()
            .flat_map(|slots| slots.values())
            .map(Vec::len)
            .sum()
    }

    /// 한 시각의 물리 행 중 병합 후 보이는 행.
    fn winner<'a>(&self, rows: &'a [StoredRow]) -> Option<&'a StoredRow> {
        rows.iter()
            .max_by(|a, b| merge_order(self.policy, (&a.candle, a.seq), (&b.candle, b.seq)))
            .filter(|row| row.candle.sign > 0)
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert_batch(&self, rows: &[Candle]) -> Result<usize> {
        let mut table = self.table.write().await;
        for candle in rows {
            table.next_seq += 1;
            let seq = table.next_seq;
            table
                .series
                .entry(candle.series_id())
                .or_default()
                .entry(candle.timestamp_ms())
                .or_default()
                .push(StoredRow {
                    seq,
                    candle: candle.clone(),
                });
        }
        Ok(rows.len())
    }

    async fn query_range(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        mode: ReadMode,
    ) -> Result<Vec<Candle>> {
        let table = self.table.read().await;
        let Some(slots) = table.series.get(series) else {
            return Ok(Vec::new());
        };

        let in_range = slots.range(range.start_ms()..range.end_ms());
        let rows = match mode {
            ReadMode::Final => in_range
                .filter_map(|(_, rows)| self.winner(rows))
                .map(|row| row.candle.clone())
                .collect(),
            ReadMode::Raw => in_range
                .flat_map(|(_, rows)| rows.iter())
                .map(|row| row.candle.clone())
                .collect(),
        };
        Ok(rows)
    }

    async fn latest(&self, series: &SeriesId, limit: usize) -> Result<Vec<Candle>> {
        let table = self.table.read().await;
        let Some(slots) = table.series.get(series) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<Candle> = slots
            .values()
            .rev()
            .filter_map(|rows| self.winner(rows))
            .take(limit)
            .map(|row| row.candle.clone())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    async fn timestamps(&self, series: &SeriesId, range: &TimeRange) -> Result<Vec<i64>> {
        let table = self.table.read().await;
        let Some(slots) = table.series.get(series) else {
            return Ok(Vec::new());
        };

        Ok(slots
            .range(range.start_ms()..range.end_ms())
            .filter(|(_, rows)| self.winner(rows).is_some())
            .map(|(ts, _)| *ts)
            .collect())
    }

    async fn compact(&self) -> Result<u64> {
        let mut table = self.table.write().await;
        let mut removed = 0u64;

        for slots in table.series.values_mut() {
            for rows in slots.values_mut() {
                if rows.len() < 2 {
                    continue;
                }
                let Some(keep) = rows
                    .iter()
                    .max_by(|a, b| merge_order(self.policy, (&a.candle, a.seq), (&b.candle, b.seq)))
                    .cloned()
                else {
                    continue;
                };
                removed += (rows.len() - 1) as u64;
                *rows = vec![keep];
            }
        }

        if removed > 0 {
            debug!(removed = removed, "메모리 저장소 압축");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use gapless_core::{DataSource, RawCandle, Timeframe};
    use rust_decimal_macros::dec;

    const T0: i64 = 1_704_067_200_000;
    const HOUR: i64 = 3_600_000;

    fn candle(ts: i64, close: rust_decimal::Decimal, source: DataSource) -> Candle {
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);
        Candle::from_raw(
            &series,
            RawCandle {
                open_time: DateTime::<Utc>::from_timestamp_millis(ts).unwrap(),
                close_time: DateTime::<Utc>::from_timestamp_millis(ts + HOUR - 1).unwrap(),
                open: dec!(100),
                high: dec!(110),
                low: dec!(90),
                close,
                volume: dec!(1),
                quote_volume: dec!(100),
                trade_count: 10,
                taker_buy_base_volume: dec!(0.5),
                taker_buy_quote_volume: dec!(50),
                funding_rate: None,
                source,
            },
        )
    }

    fn day() -> TimeRange {
        TimeRange::from_millis(T0, T0 + 24 * HOUR).unwrap()
    }

    #[tokio::test]
    async fn test_final_read_picks_latest_ingested() {
        let store = MemoryCandleStore::new(MergePolicy::LatestIngested);
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);

        store
            .insert_batch(&[candle(T0, dec!(105), DataSource::RestApi)])
            .await
            .unwrap();
        store
            .insert_batch(&[candle(T0, dec!(104), DataSource::BulkArchive)])
            .await
            .unwrap();

        let visible = store.query_range(&series, &day(), ReadMode::Final).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].close, dec!(104));
        assert_eq!(visible[0].data_source, DataSource::BulkArchive);

        let raw = store.query_range(&series, &day(), ReadMode::Raw).await.unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[tokio::test]
    async fn test_highest_version_policy() {
        let store = MemoryCandleStore::new(MergePolicy::HighestVersion);
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);
        let a = candle(T0, dec!(105), DataSource::RestApi);
        let b = candle(T0, dec!(104), DataSource::BulkArchive);
        let expected = if a.version > b.version { a.close } else { b.close };

        store.insert_batch(&[a.clone(), b.clone()]).await.unwrap();
        let first = store.query_range(&series, &day(), ReadMode::Final).await.unwrap();
        store.insert_batch(&[b, a]).await.unwrap();
        let second = store.query_range(&series, &day(), ReadMode::Final).await.unwrap();

        assert_eq!(first[0].close, expected);
        assert_eq!(second[0].close, expected);
    }

    #[tokio::test]
    async fn test_compact_keeps_visible_rows() {
        let store = MemoryCandleStore::new(MergePolicy::LatestIngested);
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);
        let rows: Vec<Candle> = (0..3)
            .map(|i| candle(T0 + i * HOUR, dec!(105), DataSource::RestApi))
            .collect();

        for _ in 0..3 {
            store.insert_batch(&rows).await.unwrap();
        }
        let before = store.query_range(&series, &day(), ReadMode::Final).await.unwrap();

        assert_eq!(store.physical_len().await, 9);
        assert_eq!(store.compact().await.unwrap(), 6);
        assert_eq!(store.physical_len().await, 3);
        assert_eq!(
            store.query_range(&series, &day(), ReadMode::Final).await.unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn test_latest_and_timestamps() {
        let store = MemoryCandleStore::new(MergePolicy::LatestIngested);
        let series = SeriesId::spot("BTCUSDT", Timeframe::H1);
        let rows: Vec<Candle> = [0, 1, 3, 4]
            .iter()
            .map(|i| candle(T0 + i * HOUR, dec!(105), DataSource::RestApi))
            .collect();
        store.insert_batch(&rows).await.unwrap();

        let latest = store.latest(&series, 2).await.unwrap();
        let opens: Vec<i64> = latest.iter().map(Candle::timestamp_ms).collect();
        assert_eq!(opens, vec![T0 + 3 * HOUR, T0 + 4 * HOUR]);

        let range = TimeRange::from_millis(T0 + HOUR, T0 + 4 * HOUR).unwrap();
        assert_eq!(
            store.timestamps(&series, &range).await.unwrap(),
            vec![T0 + HOUR, T0 + 3 * HOUR]
        );

        let other = SeriesId::futures("BTCUSDT", Timeframe::H1);
        assert!(store.latest(&other, 10).await.unwrap().is_empty());
    }
}
