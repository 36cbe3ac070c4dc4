//! 상품 유형 및 시리즈 식별자 정의.
//!
//! - `InstrumentType` - 현물 / 무기한 선물
//! - `SeriesId` - (심볼, 타임프레임, 상품 유형) 조합으로 식별되는 캔들 시리즈

use crate::error::CoreError;
use crate::types::Timeframe;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 상품 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentType {
    /// 현물
    #[serde(rename = "spot")]
    Spot,
    /// USD-M 무기한 선물
    #[serde(rename = "futures", alias = "perpetual_futures", alias = "um")]
    PerpetualFutures,
}

impl InstrumentType {
    /// 저장소와 버전 해시에 사용하는 코드.
    pub fn code(&self) -> &'static str {
        match self {
            InstrumentType::Spot => "spot",
            InstrumentType::PerpetualFutures => "futures",
        }
    }

    /// 펀딩비가 존재하는 상품인지 여부.
    pub fn has_funding(&self) -> bool {
        matches!(self, InstrumentType::PerpetualFutures)
    }
}

impl Default for InstrumentType {
    fn default() -> Self {
        Self::Spot
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for InstrumentType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "futures" | "perpetual_futures" | "perp" | "um" => Ok(Self::PerpetualFutures),
            _ => Err(CoreError::UnknownInstrument(s.to_string())),
        }
    }
}

/// 캔들 시리즈 식별자.
///
/// 갭 감지, 채우기, 조회는 모두 시리즈 단위로 수행됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId {
    /// 거래소 심볼 (예: BTCUSDT)
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 상품 유형
    pub instrument: InstrumentType,
}

impl SeriesId {
    /// 새 시리즈 식별자를 생성합니다. 심볼은 대문자로 정규화됩니다.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, instrument: InstrumentType) -> Self {
        Self {
            symbol: symbol.into().trim().to_uppercase(),
            timeframe,
            instrument,
        }
    }

    /// 현물 시리즈를 생성합니다.
    pub fn spot(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self::new(symbol, timeframe, InstrumentType::Spot)
    }

    /// 무기한 선물 시리즈를 생성합니다.
    pub fn futures(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self::new(symbol, timeframe, InstrumentType::PerpetualFutures)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.symbol, self.timeframe, self.instrument)
    }
}

/// `SYMBOL/TIMEFRAME[/INSTRUMENT]` 형식을 파싱합니다. 상품 유형 생략 시 현물입니다.
impl FromStr for SeriesId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (symbol, timeframe, instrument) = match parts.as_slice() {
            [symbol, tf] => (*symbol, tf.parse()?, InstrumentType::Spot),
            [symbol, tf, inst] => (*symbol, tf.parse()?, inst.parse()?),
            _ => {
                return Err(CoreError::InvalidInput(format!(
                    "시리즈 형식은 SYMBOL/TIMEFRAME[/INSTRUMENT] 이어야 합니다: {}",
                    s
                )))
            }
        };

        if symbol.trim().is_empty() {
            return Err(CoreError::InvalidInput(format!("빈 심볼: {}", s)));
        }

        Ok(Self::new(symbol, timeframe, instrument))
    }
}
