//! 에러 타입 정의.

use gapless_core::CoreError;
use gapless_data::DataError;
use gapless_exchange::FetchError;
use thiserror::Error;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 핵심 타입 / 설정 로드 에러
    #[error(transparent)]
    Core(#[from] CoreError),

    /// 거래소 클라이언트 에러
    #[error("Exchange error: {0}")]
    Exchange(#[from] FetchError),

    /// 저장 / 적재 / 쿼리 에러
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// 결과 출력 에러
    #[error("Output error: {0}")]
    Output(#[from] std::io::Error),

    /// 직렬화 에러
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
