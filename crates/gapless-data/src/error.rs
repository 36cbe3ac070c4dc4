//! 데이터 모듈 오류 타입.

use gapless_core::{CoreError, SeriesId, TimeRange};
use gapless_exchange::FetchError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 채우지 못한 구간과 그 이유.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnfilledRange {
    pub range: TimeRange,
    pub missing_count: u64,
    pub reason: String,
}

impl fmt::Display for UnfilledRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ~ {} ({}개): {}",
            self.range.start.to_rfc3339(),
            self.range.end.to_rfc3339(),
            self.missing_count,
            self.reason
        )
    }
}

/// 파이프라인 한 단위의 실패.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub series: SeriesId,
    pub error: DataError,
}

/// 데이터 관련 오류.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// 저장소 쓰기 실패 (배치 단위 재시도 대상)
    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// 조회 실패
    #[error("Query error: {0}")]
    Query(String),

    /// 업스트림 페치 실패
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// 갭을 모두 채우지 못한 범위
    #[error("Incomplete range for {series}: {} unfilled sub-range(s)", .unfilled.len())]
    IncompleteRange {
        series: SeriesId,
        unfilled: Vec<UnfilledRange>,
    },

    /// 다중 파이프라인 중 일부 실패
    #[error("{} pipeline(s) failed, {succeeded} succeeded", .failures.len())]
    PartialPipelineFailure {
        succeeded: usize,
        failures: Vec<UnitFailure>,
    },

    /// 작업 중 패닉 등 내부 실패
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// 취소됨
    #[error("Cancelled")]
    Cancelled,

    /// 잘못된 입력
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 설정 오류
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DataError {
    /// 배치 전체를 다시 쓸 수 있는 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::StorageWrite(_))
    }

    /// 실행 전체를 멈춰야 하는 에러인지 확인 (차단, 스키마 불일치).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DataError::Fetch(FetchError::Banned(_) | FetchError::SchemaMismatch(_))
        )
    }

    /// 취소로 인한 에러인지 확인.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DataError::Cancelled | DataError::Fetch(FetchError::Cancelled)
        )
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                DataError::StorageWrite(err.to_string())
            }
            sqlx::Error::Database(db_err) => DataError::Query(db_err.message().to_string()),
            _ => DataError::Query(err.to_string()),
        }
    }
}

impl From<CoreError> for DataError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Config(msg) => DataError::Config(msg),
            other => DataError::InvalidInput(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DataError::StorageWrite("conn reset".into()).is_retryable());
        assert!(!DataError::Query("syntax".into()).is_retryable());
        assert!(DataError::Fetch(FetchError::Cancelled).is_cancelled());
    }

    #[test]
    fn test_partial_failure_message() {
        let err = DataError::PartialPipelineFailure {
            succeeded: 4,
            failures: vec![UnitFailure {
                series: "BTCUSDT/1h/spot".parse().unwrap(),
                error: DataError::Cancelled,
            }],
        };
        assert_eq!(err.to_string(), "1 pipeline(s) failed, 4 succeeded");
    }
}
