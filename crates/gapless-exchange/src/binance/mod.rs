//! Binance 데이터 소스.
//!
//! - `rest`: 레이트 리밋이 적용되는 REST API (`/api/v3/klines`, `/fapi/v1/klines`, `/fapi/v1/fundingRate`)
//! - `archive`: 공개 데이터 CDN의 월/일 단위 zip 아카이브
//! - `layout`: 아카이브 CSV 형식 감지

pub mod archive;
pub mod layout;
pub mod rest;

pub use archive::{plan_periods, ArchivePeriod, BinanceArchiveClient};
pub use rest::{BinanceRestClient, FundingEvent};

use crate::error::FetchError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Binance 에러 응답 본문.
#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i32,
    msg: String,
}

/// HTTP 상태와 본문을 에러로 분류합니다.
///
/// 418은 차단, 429와 -1003은 한도 초과, 5xx는 일시적 에러입니다.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    match status.as_u16() {
        418 => FetchError::Banned(body.to_string()),
        429 => FetchError::RateLimited { retry_after },
        404 => FetchError::ArchiveNotFound(body.to_string()),
        408 | 500..=599 => FetchError::TransientNetwork(format!("HTTP {}: {}", status, body)),
        _ => match serde_json::from_str::<BinanceError>(body) {
            Ok(err) if err.code == -1003 => FetchError::RateLimited { retry_after },
            Ok(err) => FetchError::InvalidRequest(format!("{}: {}", err.code, err.msg)),
            Err(_) => FetchError::InvalidRequest(format!("HTTP {}: {}", status, body)),
        },
    }
}

/// `Retry-After` 헤더(초)를 읽습니다.
fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, None, "banned"),
            FetchError::Banned(_)
        ));
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(2)),
                ""
            ),
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            FetchError::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                None,
                r#"{"code":-1121,"msg":"Invalid symbol."}"#
            ),
            FetchError::InvalidRequest(_)
        ));
    }
}
