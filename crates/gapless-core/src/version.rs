//! 캔들 버전 해시 (VersionHasher).
//!
//! 캔들 내용의 결정적 지문을 계산합니다. 같은 내용은 출처와 무관하게 같은 버전을
//! 가지므로, 아카이브와 REST가 동일한 행을 가져와도 병합 후 하나로 보입니다.
//!
//! 직렬화 형식 (순서 고정, 앞에 `gapless.candle.v1` 접두사):
//! - 문자열: u32 BE 길이 + UTF-8
//! - 시각: i64 BE epoch 밀리초
//! - 십진수: 소수점 8자리로 버림 후 scale 8 가수(i128) 16바이트 BE
//! - 체결 건수: u64 BE
//! - 펀딩비: 태그 1바이트(0 없음, 1 있음) + 있으면 십진수

use crate::types::{InstrumentType, Timeframe};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

const DOMAIN_PREFIX: &[u8] = b"gapless.candle.v1";
const DECIMAL_SCALE: u32 = 8;

/// 해시 입력 필드.
#[derive(Debug, Clone, Copy)]
pub struct VersionInput<'a> {
    pub symbol: &'a str,
    pub timeframe: Timeframe,
    pub instrument_type: InstrumentType,
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time_ms: i64,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub funding_rate: Option<Decimal>,
}

/// 캔들 버전을 계산합니다. SHA-256 앞 8바이트(BE)를 u64로 해석합니다.
pub fn candle_version(input: &VersionInput<'_>) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_PREFIX);

    write_str(&mut hasher, input.symbol);
    write_str(&mut hasher, input.timeframe.to_binance_interval());
    write_str(&mut hasher, input.instrument_type.code());
    hasher.update(input.timestamp_ms.to_be_bytes());
    write_decimal(&mut hasher, input.open);
    write_decimal(&mut hasher, input.high);
    write_decimal(&mut hasher, input.low);
    write_decimal(&mut hasher, input.close);
    write_decimal(&mut hasher, input.volume);
    hasher.update(input.close_time_ms.to_be_bytes());
    write_decimal(&mut hasher, input.quote_volume);
    hasher.update(input.trade_count.to_be_bytes());
    write_decimal(&mut hasher, input.taker_buy_base_volume);
    write_decimal(&mut hasher, input.taker_buy_quote_volume);
    match input.funding_rate {
        Some(rate) => {
            hasher.update([1u8]);
            write_decimal(&mut hasher, rate);
        }
        None => hasher.update([0u8]),
    }

    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

fn write_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u32).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn write_decimal(hasher: &mut Sha256, value: Decimal) {
    hasher.update(decimal_mantissa(value).to_be_bytes());
}

/// 소수점 8자리로 버린 값의 scale 8 가수.
fn decimal_mantissa(value: Decimal) -> i128 {
    let mut truncated = value.trunc_with_scale(DECIMAL_SCALE);
    truncated.rescale(DECIMAL_SCALE);
    truncated.mantissa()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn fixture() -> VersionInput<'static> {
        VersionInput {
            symbol: "BTCUSDT",
            timeframe: Timeframe::H1,
            instrument_type: InstrumentType::Spot,
            timestamp_ms: 1_704_067_200_000,
            open: dec!(42283.58),
            high: dec!(42554.57),
            low: dec!(42261.02),
            close: dec!(42475.23),
            volume: dec!(1271.68108),
            close_time_ms: 1_704_070_799_999,
            quote_volume: dec!(53957248.97378980),
            trade_count: 47134,
            taker_buy_base_volume: dec!(682.57581),
            taker_buy_quote_volume: dec!(28957416.81985110),
            funding_rate: None,
        }
    }

    #[test]
    fn test_golden_vector_spot() {
        assert_eq!(candle_version(&fixture()), 12_563_832_157_085_604_555);
    }

    #[test]
    fn test_golden_vector_futures_with_funding() {
        let input = VersionInput {
            instrument_type: InstrumentType::PerpetualFutures,
            funding_rate: Some(dec!(0.00010000)),
            ..fixture()
        };
        assert_eq!(candle_version(&input), 11_876_286_288_590_794_310);
    }

    #[test]
    fn test_scale_does_not_change_version() {
        let a = fixture();
        let b = VersionInput {
            open: dec!(42283.58000000),
            volume: dec!(1271.681080),
            ..fixture()
        };
        assert_eq!(candle_version(&a), candle_version(&b));
    }

    #[test]
    fn test_truncates_beyond_eight_digits() {
        let b = VersionInput {
            open: dec!(42283.580000009),
            ..fixture()
        };
        assert_eq!(candle_version(&fixture()), candle_version(&b));
        assert_eq!(decimal_mantissa(dec!(-0.000000019)), -1);
    }

    #[test]
    fn test_absent_and_zero_funding_differ() {
        let absent = fixture();
        let zero = VersionInput {
            funding_rate: Some(Decimal::ZERO),
            ..fixture()
        };
        assert_ne!(candle_version(&absent), candle_version(&zero));
    }

    proptest! {
        #[test]
        fn prop_close_change_changes_version(cents in 1i64..1_000_000_000, delta in 1i64..1_000) {
            let base = VersionInput { close: Decimal::new(cents, 2), ..fixture() };
            let changed = VersionInput { close: Decimal::new(cents + delta, 2), ..fixture() };
            prop_assert_eq!(candle_version(&base), candle_version(&base));
            prop_assert_ne!(candle_version(&base), candle_version(&changed));
        }

        #[test]
        fn prop_timestamp_is_part_of_identity(hours in 1i64..100_000) {
            let shifted = VersionInput {
                timestamp_ms: fixture().timestamp_ms + hours * 3_600_000,
                ..fixture()
            };
            prop_assert_ne!(candle_version(&fixture()), candle_version(&shifted));
        }
    }
}
