//! PostgreSQL 캔들 저장소.
//!
//! 추가 전용 테이블에 적재 순번(`ingest_seq`)을 함께 저장합니다.
//! 보이는 행은 `DISTINCT ON`으로 고르며, `compact()`가 밀려난 행을 삭제합니다.
//!
//! `version`은 u64 전체 범위를 담기 위해 `NUMERIC(20, 0)`으로 저장합니다.

use super::{CandleStore, ReadMode};
use crate::error::{DataError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gapless_core::{Candle, DataSource, InstrumentType, MergePolicy, SeriesId, TimeRange, Timeframe};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

const CANDLE_COLUMNS: &str = r#"symbol, timeframe, instrument_type, "timestamp", open, high, low, close,
    volume, close_time, quote_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume,
    funding_rate, data_source, version, sign"#;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    symbol                  TEXT           NOT NULL,
    timeframe               TEXT           NOT NULL,
    instrument_type         TEXT           NOT NULL,
    "timestamp"             TIMESTAMPTZ    NOT NULL,
    open                    NUMERIC        NOT NULL,
    high                    NUMERIC        NOT NULL,
    low                     NUMERIC        NOT NULL,
    close                   NUMERIC        NOT NULL,
    volume                  NUMERIC        NOT NULL,
    close_time              TIMESTAMPTZ    NOT NULL,
    quote_volume            NUMERIC        NOT NULL,
    trade_count             BIGINT         NOT NULL,
    taker_buy_base_volume   NUMERIC        NOT NULL,
    taker_buy_quote_volume  NUMERIC        NOT NULL,
    funding_rate            NUMERIC,
    data_source             TEXT           NOT NULL,
    version                 NUMERIC(20, 0) NOT NULL,
    sign                    SMALLINT       NOT NULL DEFAULT 1,
    ingest_seq              BIGSERIAL      PRIMARY KEY
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_candles_identity
    ON candles (symbol, timeframe, instrument_type, "timestamp", ingest_seq DESC)
"#;

/// 캔들 데이터베이스 레코드.
#[derive(Debug, Clone, FromRow)]
struct CandleRecord {
    symbol: String,
    timeframe: String,
    instrument_type: String,
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    close_time: DateTime<Utc>,
    quote_volume: Decimal,
    trade_count: i64,
    taker_buy_base_volume: Decimal,
    taker_buy_quote_volume: Decimal,
    funding_rate: Option<Decimal>,
    data_source: String,
    version: Decimal,
    sign: i16,
}

impl CandleRecord {
    fn into_candle(self) -> Result<Candle> {
        let timeframe: Timeframe = self.timeframe.parse()?;
        let instrument_type: InstrumentType = self.instrument_type.parse()?;
        let data_source: DataSource = self.data_source.parse()?;
        let version = self
            .version
            .to_u64()
            .ok_or_else(|| DataError::Query(format!("잘못된 version 값: {}", self.version)))?;

        Ok(Candle {
            symbol: self.symbol,
            timeframe,
            instrument_type,
            timestamp: self.timestamp,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trade_count: self.trade_count.max(0) as u64,
            taker_buy_base_volume: self.taker_buy_base_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
            funding_rate: self.funding_rate,
            data_source,
            version,
            sign: self.sign as i8,
        })
    }
}

/// PostgreSQL 캔들 저장소.
#[derive(Clone)]
pub struct PgCandleStore {
    pool: PgPool,
    policy: MergePolicy,
    chunk_size: usize,
}

impl PgCandleStore {
    /// 연결 풀을 생성합니다.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        policy: MergePolicy,
        chunk_size: usize,
    ) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| DataError::Config(format!("데이터베이스 연결 실패: {}", e)))?;

        info!("Database connection established");
        Ok(Self::from_pool(pool, policy, chunk_size))
    }

    /// 기존 연결 풀에서 생성합니다.
    pub fn from_pool(pool: PgPool, policy: MergePolicy, chunk_size: usize) -> Self {
        Self {
            pool,
            policy,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 테이블과 인덱스를 생성합니다.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        debug!("candles 스키마 확인 완료");
        Ok(())
    }

    /// 같은 식별자 안에서 이기는 행이 먼저 오도록 하는 정렬 절.
    fn winner_order(&self) -> &'static str {
        match self.policy {
            MergePolicy::LatestIngested => "ingest_seq DESC",
            MergePolicy::HighestVersion => "version DESC, ingest_seq DESC",
        }
    }

    /// 시리즈의 `[start, end)` 범위에서 식별자당 이긴 행만 남기는 서브쿼리.
    fn final_subquery(&self) -> String {
        format!(
            r#"SELECT DISTINCT ON ("timestamp") {cols}
               FROM candles
               WHERE symbol = $1 AND timeframe = $2 AND instrument_type = $3
                 AND "timestamp" >= $4 AND "timestamp" < $5
               ORDER BY "timestamp", {order}"#,
            cols = CANDLE_COLUMNS,
            order = self.winner_order(),
        )
    }

    async fn fetch_records(
        &self,
        sql: &str,
        series: &SeriesId,
        range: &TimeRange,
    ) -> Result<Vec<Candle>> {
        let records: Vec<CandleRecord> = sqlx::query_as(sql)
            .bind(&series.symbol)
            .bind(series.timeframe.to_binance_interval())
            .bind(series.instrument.code())
            .bind(range.start)
            .bind(range.end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DataError::Query(e.to_string()))?;

        records.into_iter().map(CandleRecord::into_candle).collect()
    }
}

#[async_trait]
impl CandleStore for PgCandleStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    /// UNNEST 패턴으로 청크 단위 일괄 삽입.
    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn insert_batch(&self, rows: &[Candle]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;
        for chunk in rows.chunks(self.chunk_size) {
            let symbols: Vec<&str> = chunk.iter().map(|c| c.symbol.as_str()).collect();
            let timeframes: Vec<&str> = chunk
                .iter()
                .map(|c| c.timeframe.to_binance_interval())
                .collect();
            let instruments: Vec<&str> = chunk.iter().map(|c| c.instrument_type.code()).collect();
            let timestamps: Vec<DateTime<Utc>> = chunk.iter().map(|c| c.timestamp).collect();
            let opens: Vec<Decimal> = chunk.iter().map(|c| c.open).collect();
            let highs: Vec<Decimal> = chunk.iter().map(|c| c.high).collect();
            let lows: Vec<Decimal> = chunk.iter().map(|c| c.low).collect();
            let closes: Vec<Decimal> = chunk.iter().map(|c| c.close).collect();
            let volumes: Vec<Decimal> = chunk.iter().map(|c| c.volume).collect();
            let close_times: Vec<DateTime<Utc>> = chunk.iter().map(|c| c.close_time).collect();
            let quote_volumes: Vec<Decimal> = chunk.iter().map(|c| c.quote_volume).collect();
            let trade_counts: Vec<i64> = chunk
                .iter()
                .map(|c| i64::try_from(c.trade_count).unwrap_or(i64::MAX))
                .collect();
            let taker_base: Vec<Decimal> = chunk.iter().map(|c| c.taker_buy_base_volume).collect();
            let taker_quote: Vec<Decimal> =
                chunk.iter().map(|c| c.taker_buy_quote_volume).collect();
            let funding: Vec<Option<Decimal>> = chunk.iter().map(|c| c.funding_rate).collect();
            let sources: Vec<&str> = chunk.iter().map(|c| c.data_source.as_str()).collect();
            let versions: Vec<Decimal> = chunk.iter().map(|c| Decimal::from(c.version)).collect();
            let signs: Vec<i16> = chunk.iter().map(|c| i16::from(c.sign)).collect();

            let result = sqlx::query(&format!(
                r#"
                INSERT INTO candles ({cols})
                SELECT * FROM UNNEST(
                    $1::text[], $2::text[], $3::text[], $4::timestamptz[],
                    $5::numeric[], $6::numeric[], $7::numeric[], $8::numeric[], $9::numeric[],
                    $10::timestamptz[], $11::numeric[], $12::bigint[],
                    $13::numeric[], $14::numeric[], $15::numeric[],
                    $16::text[], $17::numeric[], $18::smallint[]
                )
                "#,
                cols = CANDLE_COLUMNS
            ))
            .bind(&symbols)
            .bind(&timeframes)
            .bind(&instruments)
            .bind(&timestamps)
            .bind(&opens)
            .bind(&highs)
            .bind(&lows)
            .bind(&closes)
            .bind(&volumes)
            .bind(&close_times)
            .bind(&quote_volumes)
            .bind(&trade_counts)
            .bind(&taker_base)
            .bind(&taker_quote)
            .bind(&funding)
            .bind(&sources)
            .bind(&versions)
            .bind(&signs)
            .execute(&self.pool)
            .await
            .map_err(|e| DataError::StorageWrite(e.to_string()))?;

            inserted += result.rows_affected() as usize;
        }

        debug!(inserted = inserted, "캔들 일괄 삽입");
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn query_range(
        &self,
        series: &SeriesId,
        range: &TimeRange,
        mode: ReadMode,
    ) -> Result<Vec<Candle>> {
        let sql = match mode {
            ReadMode::Final => format!(
                r#"SELECT {cols} FROM ({sub}) AS visible WHERE sign > 0 ORDER BY "timestamp""#,
                cols = CANDLE_COLUMNS,
                sub = self.final_subquery(),
            ),
            ReadMode::Raw => format!(
                r#"SELECT {cols} FROM candles
                   WHERE symbol = $1 AND timeframe = $2 AND instrument_type = $3
                     AND "timestamp" >= $4 AND "timestamp" < $5
                   ORDER BY "timestamp", ingest_seq"#,
                cols = CANDLE_COLUMNS,
            ),
        };
        self.fetch_records(&sql, series, range).await
    }

    async fn latest(&self, series: &SeriesId, limit: usize) -> Result<Vec<Candle>> {
        let sql = format!(
            r#"SELECT DISTINCT ON ("timestamp") {cols}, ingest_seq
               FROM candles
               WHERE symbol = $1 AND timeframe = $2 AND instrument_type = $3
               ORDER BY "timestamp" DESC, {order}"#,
            cols = CANDLE_COLUMNS,
            order = self.winner_order(),
        );
        let sql = format!(
            r#"SELECT {cols} FROM ({sql}) AS visible WHERE sign > 0
               ORDER BY "timestamp" DESC LIMIT $4"#,
            cols = CANDLE_COLUMNS,
            sql = sql,
        );

        let records: Vec<CandleRecord> = sqlx::query_as(&sql)
            .bind(&series.symbol)
            .bind(series.timeframe.to_binance_interval())
            .bind(series.instrument.code())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DataError::Query(e.to_string()))?;

        let mut rows = records
            .into_iter()
            .map(CandleRecord::into_candle)
            .collect::<Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    async fn timestamps(&self, series: &SeriesId, range: &TimeRange) -> Result<Vec<i64>> {
        let sql = format!(
            r#"SELECT "timestamp" FROM ({sub}) AS visible WHERE sign > 0 ORDER BY "timestamp""#,
            sub = self.final_subquery(),
        );

        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(&sql)
            .bind(&series.symbol)
            .bind(series.timeframe.to_binance_interval())
            .bind(series.instrument.code())
            .bind(range.start)
            .bind(range.end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DataError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(|(t,)| t.timestamp_millis()).collect())
    }

    #[instrument(skip(self))]
    async fn compact(&self) -> Result<u64> {
        let sql = format!(
            r#"
            DELETE FROM candles c
            USING (
                SELECT ingest_seq,
                       ROW_NUMBER() OVER (
                           PARTITION BY symbol, timeframe, instrument_type, "timestamp"
                           ORDER BY {order}
                       ) AS rn
                FROM candles
            ) ranked
            WHERE c.ingest_seq = ranked.ingest_seq AND ranked.rn > 1
            "#,
            order = self.winner_order(),
        );

        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| DataError::StorageWrite(e.to_string()))?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed = removed, "밀려난 캔들 행 삭제");
        }
        Ok(removed)
    }
}
