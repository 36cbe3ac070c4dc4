//! 캔들 도메인 모델.
//!
//! - `RawCandle` - 업스트림(아카이브/REST)에서 디코딩한 원시 행
//! - `Candle` - 버전과 출처가 부여된 저장소 정규 행

use crate::error::CoreError;
use crate::types::{InstrumentType, SeriesId, Timeframe};
use crate::version::{candle_version, VersionInput};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 캔들 데이터 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    /// 대량 아카이브 (CDN)
    #[serde(rename = "bulk-archive")]
    BulkArchive,
    /// REST API
    #[serde(rename = "rest-api")]
    RestApi,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::BulkArchive => "bulk-archive",
            DataSource::RestApi => "rest-api",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk-archive" => Ok(Self::BulkArchive),
            "rest-api" => Ok(Self::RestApi),
            other => Err(CoreError::InvalidInput(format!("알 수 없는 데이터 출처: {}", other))),
        }
    }
}

/// 업스트림에서 디코딩한 원시 캔들 행.
///
/// 시리즈 식별 정보는 요청에서 오므로 행에는 포함되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandle {
    /// 캔들 시작 시간
    pub open_time: DateTime<Utc>,
    /// 캔들 종료 시간
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// 거래량 (기준 자산)
    pub volume: Decimal,
    /// 거래대금 (호가 자산)
    pub quote_volume: Decimal,
    /// 체결 건수
    pub trade_count: u64,
    /// Taker 매수 거래량 (기준 자산)
    pub taker_buy_base_volume: Decimal,
    /// Taker 매수 거래대금 (호가 자산)
    pub taker_buy_quote_volume: Decimal,
    /// 펀딩비 (무기한 선물만)
    pub funding_rate: Option<Decimal>,
    /// 행을 가져온 경로
    pub source: DataSource,
}

impl RawCandle {
    pub fn open_time_ms(&self) -> i64 {
        self.open_time.timestamp_millis()
    }
}

/// 저장소 정규 캔들 행.
///
/// 식별자는 (symbol, timeframe, instrument_type, timestamp)입니다.
/// 같은 식별자의 물리 행이 여러 개일 수 있으며, 병합 시 하나만 보입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub instrument_type: InstrumentType,
    /// 캔들 시작 시간
    pub timestamp: DateTime<Utc>,
    /// 캔들 종료 시간
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<Decimal>,
    /// 데이터 출처
    pub data_source: DataSource,
    /// 내용 지문 (VersionHasher)
    pub version: u64,
    /// +1 = 유효 행, 음수는 논리 삭제용으로 예약
    pub sign: i8,
}

impl Candle {
    /// 원시 행을 시리즈에 귀속시키고 버전을 계산합니다.
    pub fn from_raw(series: &SeriesId, raw: RawCandle) -> Self {
        let mut candle = Self {
            symbol: series.symbol.clone(),
            timeframe: series.timeframe,
            instrument_type: series.instrument,
            timestamp: raw.open_time,
            close_time: raw.close_time,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            quote_volume: raw.quote_volume,
            trade_count: raw.trade_count,
            taker_buy_base_volume: raw.taker_buy_base_volume,
            taker_buy_quote_volume: raw.taker_buy_quote_volume,
            funding_rate: raw.funding_rate,
            data_source: raw.source,
            version: 0,
            sign: 1,
        };
        candle.version = candle.compute_version();
        candle
    }

    /// 해시 입력으로 사용할 필드 뷰.
    pub fn version_input(&self) -> VersionInput<'_> {
        VersionInput {
            symbol: &self.symbol,
            timeframe: self.timeframe,
            instrument_type: self.instrument_type,
            timestamp_ms: self.timestamp.timestamp_millis(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            close_time_ms: self.close_time.timestamp_millis(),
            quote_volume: self.quote_volume,
            trade_count: self.trade_count,
            taker_buy_base_volume: self.taker_buy_base_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
            funding_rate: self.funding_rate,
        }
    }

    /// 현재 필드로 버전을 다시 계산합니다.
    pub fn compute_version(&self) -> u64 {
        candle_version(&self.version_input())
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// 이 행이 속한 시리즈.
    pub fn series_id(&self) -> SeriesId {
        SeriesId::new(self.symbol.clone(), self.timeframe, self.instrument_type)
    }

    /// 식별자가 주어진 시리즈와 일치하는지 확인합니다.
    pub fn belongs_to(&self, series: &SeriesId) -> bool {
        self.symbol == series.symbol
            && self.timeframe == series.timeframe
            && self.instrument_type == series.instrument
    }
}
