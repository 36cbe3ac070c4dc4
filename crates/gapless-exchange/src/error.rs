//! 페치 에러 타입.

use std::time::Duration;
use thiserror::Error;

/// 업스트림 페치 에러.
///
/// 실패 구간 보고서에 그대로 담기므로 모든 variant는 복제 가능합니다.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// 일시적 네트워크/서버 에러
    #[error("일시적 네트워크 에러: {0}")]
    TransientNetwork(String),

    /// 요청 한도 초과 (HTTP 429)
    #[error("요청 한도 초과 (retry_after: {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// IP 차단 (HTTP 418)
    #[error("거래소 차단: {0}")]
    Banned(String),

    /// 손상된 아카이브 (압축, 체크섬, 행 수 검증 실패)
    #[error("손상된 아카이브: {0}")]
    MalformedArchive(String),

    /// 알 수 없는 행 형식
    #[error("스키마 불일치: {0}")]
    SchemaMismatch(String),

    /// 아카이브 미게시 (HTTP 404)
    #[error("아카이브 없음: {0}")]
    ArchiveNotFound(String),

    /// 거래소가 요청을 거부함 (잘못된 심볼 등)
    #[error("잘못된 요청: {0}")]
    InvalidRequest(String),

    /// 선물 행에 적용할 펀딩 이벤트가 없음
    #[error("펀딩비 없음: {0}")]
    FundingUnavailable(String),

    /// 호출 타임아웃
    #[error("타임아웃: {0}")]
    Timeout(String),

    /// 취소됨
    #[error("취소됨")]
    Cancelled,
}

impl FetchError {
    /// 같은 호출을 다시 시도할 수 있는 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::TransientNetwork(_) | FetchError::RateLimited { .. } | FetchError::Timeout(_)
        )
    }

    /// 실행 전체를 중단해야 하는 에러인지 확인.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::Banned(_)
                | FetchError::SchemaMismatch(_)
                | FetchError::InvalidRequest(_)
                | FetchError::Cancelled
        )
    }

    /// 서버가 알려준 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_decode() {
            FetchError::SchemaMismatch(err.to_string())
        } else {
            FetchError::TransientNetwork(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for FetchError {
    fn from(err: zip::result::ZipError) -> Self {
        FetchError::MalformedArchive(err.to_string())
    }
}

impl From<csv::Error> for FetchError {
    fn from(err: csv::Error) -> Self {
        FetchError::MalformedArchive(err.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::MalformedArchive(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::SchemaMismatch(err.to_string())
    }
}
