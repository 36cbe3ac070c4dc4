//! 아카이브 CSV 행 형식 감지 및 디코딩.
//!
//! 지원 형식:
//! - 헤더 없음, 12열 (open_time … ignore)
//! - 헤더 없음, 13열 (마지막 열이 펀딩비)
//! - 헤더 있음, 열 이름으로 매핑 (별칭 허용)
//!
//! 그 외 형식은 `SchemaMismatch`입니다.

use crate::error::FetchError;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use gapless_core::{DataSource, RawCandle};
use rust_decimal::Decimal;
use std::str::FromStr;

/// 이 값보다 큰 타임스탬프는 마이크로초로 간주합니다 (밀리초 기준 5138년).
const MICROS_THRESHOLD: i64 = 100_000_000_000_000;

/// 열 위치 매핑.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnMap {
    open_time: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    close_time: usize,
    quote_volume: usize,
    trade_count: usize,
    taker_buy_base: usize,
    taker_buy_quote: usize,
    funding_rate: Option<usize>,
}

impl ColumnMap {
    fn positional(width: usize) -> Result<Self, FetchError> {
        let funding_rate = match width {
            12 => None,
            13 => Some(12),
            other => {
                return Err(FetchError::SchemaMismatch(format!(
                    "헤더 없는 행은 12열 또는 13열이어야 합니다: {}열",
                    other
                )))
            }
        };
        Ok(Self {
            open_time: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: 5,
            close_time: 6,
            quote_volume: 7,
            trade_count: 8,
            taker_buy_base: 9,
            taker_buy_quote: 10,
            funding_rate,
        })
    }

    fn from_header(header: &StringRecord) -> Result<Self, FetchError> {
        let names: Vec<String> = header
            .iter()
            .map(|h| h.trim().to_lowercase().replace(' ', "_"))
            .collect();
        let find = |aliases: &[&str]| {
            names
                .iter()
                .position(|n| aliases.iter().any(|alias| *alias == n.as_str()))
        };
        let require = |field: &str, aliases: &[&str]| {
            find(aliases).ok_or_else(|| {
                FetchError::SchemaMismatch(format!("필수 열 없음: {} (헤더: {:?})", field, names))
            })
        };

        Ok(Self {
            open_time: require("open_time", &["open_time", "opentime", "timestamp"])?,
            open: require("open", &["open"])?,
            high: require("high", &["high"])?,
            low: require("low", &["low"])?,
            close: require("close", &["close"])?,
            volume: require("volume", &["volume"])?,
            close_time: require("close_time", &["close_time", "closetime"])?,
            quote_volume: require(
                "quote_volume",
                &["quote_volume", "quote_asset_volume"],
            )?,
            trade_count: require(
                "trade_count",
                &["count", "trade_count", "number_of_trades", "trades"],
            )?,
            taker_buy_base: require(
                "taker_buy_base_volume",
                &[
                    "taker_buy_volume",
                    "taker_buy_base_volume",
                    "taker_buy_base_asset_volume",
                ],
            )?,
            taker_buy_quote: require(
                "taker_buy_quote_volume",
                &["taker_buy_quote_volume", "taker_buy_quote_asset_volume"],
            )?,
            funding_rate: find(&["funding_rate", "last_funding_rate"]),
        })
    }
}

/// 첫 행이 헤더인지 확인합니다. 첫 필드가 정수가 아니면 헤더입니다.
fn is_header(record: &StringRecord) -> bool {
    record
        .get(0)
        .map(|first| first.trim().parse::<i64>().is_err())
        .unwrap_or(false)
}

/// 아카이브 CSV를 원시 캔들로 디코딩합니다.
pub fn parse_kline_csv(data: &[u8], source: DataSource) -> Result<Vec<RawCandle>, FetchError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(data);

    let mut records = reader.records();
    let first = match records.next() {
        Some(record) => record?,
        None => return Ok(Vec::new()),
    };

    let (columns, pending) = if is_header(&first) {
        (ColumnMap::from_header(&first)?, None)
    } else {
        (ColumnMap::positional(first.len())?, Some(first))
    };

    let mut rows = Vec::new();
    if let Some(record) = pending {
        rows.push(decode_row(&record, &columns, source)?);
    }
    for record in records {
        rows.push(decode_row(&record?, &columns, source)?);
    }
    Ok(rows)
}

fn decode_row(
    record: &StringRecord,
    columns: &ColumnMap,
    source: DataSource,
) -> Result<RawCandle, FetchError> {
    let field = |idx: usize| field_at(record, idx);

    let funding_rate = match columns.funding_rate {
        Some(idx) => {
            let raw = field(idx)?;
            if raw.is_empty() {
                None
            } else {
                Some(parse_decimal(raw)?)
            }
        }
        None => None,
    };

    Ok(RawCandle {
        open_time: parse_time(field(columns.open_time)?)?,
        close_time: parse_time(field(columns.close_time)?)?,
        open: parse_decimal(field(columns.open)?)?,
        high: parse_decimal(field(columns.high)?)?,
        low: parse_decimal(field(columns.low)?)?,
        close: parse_decimal(field(columns.close)?)?,
        volume: parse_decimal(field(columns.volume)?)?,
        quote_volume: parse_decimal(field(columns.quote_volume)?)?,
        trade_count: field(columns.trade_count)?
            .parse()
            .map_err(|_| FetchError::MalformedArchive(format!("잘못된 체결 건수: {:?}", record)))?,
        taker_buy_base_volume: parse_decimal(field(columns.taker_buy_base)?)?,
        taker_buy_quote_volume: parse_decimal(field(columns.taker_buy_quote)?)?,
        funding_rate,
        source,
    })
}

fn field_at(record: &StringRecord, idx: usize) -> Result<&str, FetchError> {
    record
        .get(idx)
        .map(str::trim)
        .ok_or_else(|| FetchError::MalformedArchive(format!("열 {} 없음: {:?}", idx, record)))
}

/// 밀리초 또는 마이크로초 타임스탬프를 파싱합니다.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    let value: i64 = raw
        .parse()
        .map_err(|_| FetchError::MalformedArchive(format!("잘못된 타임스탬프: {}", raw)))?;
    let millis = normalize_millis(value);
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| FetchError::MalformedArchive(format!("범위를 벗어난 타임스탬프: {}", raw)))
}

/// 마이크로초 타임스탬프를 밀리초로 변환합니다.
pub fn normalize_millis(value: i64) -> i64 {
    if value > MICROS_THRESHOLD {
        value / 1_000
    } else {
        value
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, FetchError> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| FetchError::MalformedArchive(format!("잘못된 숫자: {}", raw)))
}
