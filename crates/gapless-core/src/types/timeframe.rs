//! 캔들스틱 데이터를 위한 타임프레임 정의.
//!
//! 모든 타임프레임은 고정 폭 간격입니다. 월봉처럼 길이가 달라지는 간격과
//! 정렬 기준이 불명확한 3일봉은 갭 감지가 불가능하므로 지원하지 않습니다.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// 캔들스틱 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    /// 1분봉
    M1,
    /// 3분봉
    M3,
    /// 5분봉
    M5,
    /// 15분봉
    M15,
    /// 30분봉
    M30,
    /// 1시간봉
    H1,
    /// 2시간봉
    H2,
    /// 4시간봉
    H4,
    /// 6시간봉
    H6,
    /// 8시간봉
    H8,
    /// 12시간봉
    H12,
    /// 일봉
    D1,
    /// 주봉 (월요일 00:00 UTC 시작)
    W1,
}

impl Timeframe {
    /// 지원하는 모든 타임프레임.
    pub const ALL: [Timeframe; 13] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// 간격(밀리초)을 반환합니다.
    pub const fn interval_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => MINUTE_MS,
            Timeframe::M3 => 3 * MINUTE_MS,
            Timeframe::M5 => 5 * MINUTE_MS,
            Timeframe::M15 => 15 * MINUTE_MS,
            Timeframe::M30 => 30 * MINUTE_MS,
            Timeframe::H1 => HOUR_MS,
            Timeframe::H2 => 2 * HOUR_MS,
            Timeframe::H4 => 4 * HOUR_MS,
            Timeframe::H6 => 6 * HOUR_MS,
            Timeframe::H8 => 8 * HOUR_MS,
            Timeframe::H12 => 12 * HOUR_MS,
            Timeframe::D1 => DAY_MS,
            Timeframe::W1 => 7 * DAY_MS,
        }
    }

    /// 이 타임프레임의 기간을 반환합니다.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.interval_ms() as u64)
    }

    /// chrono 기간으로 반환합니다.
    pub fn chrono_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.interval_ms())
    }

    /// 이 타임프레임의 초 단위 값을 반환합니다.
    pub fn as_secs(&self) -> u64 {
        self.duration().as_secs()
    }

    /// 캔들 경계 정렬 기준점(epoch 기준 밀리초).
    ///
    /// epoch(1970-01-01)은 목요일이므로 주봉은 1970-01-05(월요일)를 기준으로 정렬합니다.
    pub const fn alignment_offset_ms(&self) -> i64 {
        match self {
            Timeframe::W1 => 4 * DAY_MS,
            _ => 0,
        }
    }

    /// `ts_ms` 이하의 가장 가까운 캔들 경계.
    pub fn align_floor(&self, ts_ms: i64) -> i64 {
        let offset = self.alignment_offset_ms();
        let interval = self.interval_ms();
        (ts_ms - offset).div_euclid(interval) * interval + offset
    }

    /// `ts_ms` 이상의 가장 가까운 캔들 경계.
    pub fn align_ceil(&self, ts_ms: i64) -> i64 {
        let floor = self.align_floor(ts_ms);
        if floor == ts_ms {
            floor
        } else {
            floor + self.interval_ms()
        }
    }

    /// 캔들 경계에 정렬된 시각인지 확인합니다.
    pub fn is_aligned(&self, ts_ms: i64) -> bool {
        self.align_floor(ts_ms) == ts_ms
    }

    /// 바이낸스 간격 문자열로 변환합니다. 저장소 코드로도 사용합니다.
    pub fn to_binance_interval(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// 바이낸스 간격 문자열에서 파싱합니다.
    pub fn from_binance_interval(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tf| tf.to_binance_interval() == s)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_binance_interval())
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_binance_interval(s.trim())
            .ok_or_else(|| CoreError::UnsupportedTimeframe(s.to_string()))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_binance_interval().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::M1.as_secs(), 60);
        assert_eq!(Timeframe::H1.as_secs(), 3600);
        assert_eq!(Timeframe::D1.as_secs(), 86400);
        assert_eq!(Timeframe::H1.interval_ms(), 3_600_000);
    }

    #[test]
    fn test_timeframe_binance() {
        assert_eq!(Timeframe::M15.to_binance_interval(), "15m");
        assert_eq!(Timeframe::from_binance_interval("4h"), Some(Timeframe::H4));
        assert_eq!(Timeframe::from_binance_interval("1M"), None);
        assert!("3d".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_alignment() {
        let tf = Timeframe::H1;
        // 2024-01-01T00:30:00Z
        let ts = 1_704_069_000_000;
        assert_eq!(tf.align_floor(ts), 1_704_067_200_000);
        assert_eq!(tf.align_ceil(ts), 1_704_070_800_000);
        assert!(tf.is_aligned(1_704_067_200_000));
        assert!(!tf.is_aligned(ts));
    }

    #[test]
    fn test_weekly_alignment_starts_on_monday() {
        // 2024-01-03(수) → 2024-01-01(월)
        let wednesday = 1_704_240_000_000;
        assert_eq!(Timeframe::W1.align_floor(wednesday), 1_704_067_200_000);
    }

    #[test]
    fn test_serde_uses_interval_code() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let parsed: Timeframe = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(parsed, Timeframe::M15);
    }
}
