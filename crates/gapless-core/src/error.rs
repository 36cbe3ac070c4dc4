//! 핵심 에러 타입.
//!
//! 설정 로드와 입력 검증 단계에서 발생하는 에러를 정의합니다.
//! 네트워크/저장소 에러는 각 crate(`gapless-exchange`, `gapless-data`)가 따로 정의합니다.

use thiserror::Error;

/// 핵심 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 잘못된 입력
    #[error("잘못된 입력: {0}")]
    InvalidInput(String),

    /// 지원하지 않는 타임프레임
    #[error("지원하지 않는 타임프레임: {0}")]
    UnsupportedTimeframe(String),

    /// 알 수 없는 상품 유형
    #[error("알 수 없는 상품 유형: {0}")]
    UnknownInstrument(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),
}

/// 핵심 작업을 위한 Result 타입.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::UnsupportedTimeframe("1M".to_string());
        assert_eq!(err.to_string(), "지원하지 않는 타임프레임: 1M");
    }
}
